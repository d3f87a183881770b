//! Nexus data engine - time-series read, cache and export core
//!
//! This library provides the data path of a time-series archive:
//! - Interval algebra for gap tracking
//! - On-disk cache of derived representations in time buckets
//! - Memory backpressure for concurrent reads
//! - Resampling and block aggregation
//! - Streaming exports from pluggable data sources to pluggable data writers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod interval;
pub mod pipe;
pub mod types;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// Tracing subscriber setup
pub mod logging;

/// Time-bucketed cache of processed data
pub mod cache;

/// Memory budget shared by all concurrent reads
pub mod allocator;

/// Resampling and aggregation of raw source buffers
pub mod aggregation;

/// Reading, writing and orchestration of exports
pub mod pipeline;

// Re-export main types
pub use allocator::{AllocationTicket, MemoryAllocator};
pub use cache::CacheService;
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use interval::Interval;
pub use pipeline::{CapabilityRegistry, CatalogItemRequest, DataEngine, ExportRequest};
pub use types::{CatalogItem, NexusDataType, Representation, RepresentationKind, SamplePeriod};
