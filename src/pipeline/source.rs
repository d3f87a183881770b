//! Data source capability

use crate::error::Result;
use crate::types::{create_buffers, CatalogItem, Parameters};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// How to reach the source backing a catalog item
///
/// Items sharing a registration are read by the same source instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceRegistration {
    /// Name the source factory is registered under
    pub type_name: String,
    /// Optional location handed to the source (path, URL, ...)
    pub resource_locator: Option<String>,
    /// Source specific settings
    pub configuration: Parameters,
}

impl SourceRegistration {
    /// Registration without locator or settings
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            resource_locator: None,
            configuration: Parameters::new(),
        }
    }

    /// Set the resource locator
    pub fn with_locator(mut self, locator: impl Into<String>) -> Self {
        self.resource_locator = Some(locator.into());
        self
    }
}

/// Buffers for one item of a batched source read
///
/// `data` holds one little-endian element per sample, `status` one byte per
/// sample (`1` = valid). Both start zeroed.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    /// Item to read, always with its source representation
    pub item: CatalogItem,
    /// Raw element buffer
    pub data: Vec<u8>,
    /// Status buffer
    pub status: Vec<u8>,
}

impl ReadRequest {
    /// Zeroed buffers for reading `[begin, end)` of `item`
    pub fn new(item: CatalogItem, begin: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let (data, status) = create_buffers(&item.representation, begin, end);
        Self { item, data, status }
    }
}

/// A provider of raw time-series data
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Fill every request with the samples of `[begin, end)`
    async fn read(
        &self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        requests: &mut [ReadRequest],
        cancel: &CancellationToken,
    ) -> Result<()>;
}
