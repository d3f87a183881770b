//! Capability registry
//!
//! Maps type names to factories for data sources and data writers. The
//! registry is filled once at startup by whatever loads extensions; the
//! engine only ever calls through the capability traits.

use super::source::{DataSource, SourceRegistration};
use super::writer::DataWriter;
use crate::error::{PipelineError, Result};
use crate::types::Parameters;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds a data source for a registration
pub type SourceFactory =
    Arc<dyn Fn(&SourceRegistration) -> Result<Arc<dyn DataSource>> + Send + Sync>;

/// Builds a data writer from export writer settings
pub type WriterFactory = Arc<dyn Fn(&Parameters) -> Result<Box<dyn DataWriter>> + Send + Sync>;

/// Type name → factory lookup for sources and writers
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    sources: HashMap<String, SourceFactory>,
    writers: HashMap<String, WriterFactory>,
}

impl CapabilityRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a data source factory, replacing any previous one
    pub fn register_source(&mut self, type_name: impl Into<String>, factory: SourceFactory) {
        self.sources.insert(type_name.into(), factory);
    }

    /// Register a data writer factory, replacing any previous one
    pub fn register_writer(&mut self, type_name: impl Into<String>, factory: WriterFactory) {
        self.writers.insert(type_name.into(), factory);
    }

    /// Instantiate the source for a registration
    pub fn create_source(&self, registration: &SourceRegistration) -> Result<Arc<dyn DataSource>> {
        let factory = self
            .sources
            .get(&registration.type_name)
            .ok_or_else(|| PipelineError::UnknownExtension(registration.type_name.clone()))?;

        factory(registration)
    }

    /// Instantiate a writer
    pub fn create_writer(&self, type_name: &str, configuration: &Parameters) -> Result<Box<dyn DataWriter>> {
        let factory = self
            .writers
            .get(type_name)
            .ok_or_else(|| PipelineError::UnknownExtension(type_name.to_string()))?;

        factory(configuration)
    }

    /// Registered source type names, sorted
    pub fn source_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.keys().cloned().collect();
        names.sort();
        names
    }

    /// Registered writer type names, sorted
    pub fn writer_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.writers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("sources", &self.source_types())
            .field("writers", &self.writer_types())
            .finish()
    }
}
