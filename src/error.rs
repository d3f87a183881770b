//! Error types for the data engine

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the data engine
#[derive(Error, Debug)]
pub enum Error {
    /// Data model error
    #[error("Data model error: {0}")]
    DataModel(#[from] DataModelError),

    /// Cache error
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Memory allocator error
    #[error("Allocator error: {0}")]
    Allocator(#[from] AllocatorError),

    /// Aggregation error
    #[error("Aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    /// Reading or writing side of a pipeline failed
    #[error("Pipeline fault: {0}")]
    Pipeline(#[from] PipelineError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was cancelled by its caller
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// True if this error is a cancellation rather than a fault
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Error::Cancelled
                | Error::Allocator(AllocatorError::Cancelled)
                | Error::Pipeline(PipelineError::Cancelled)
        )
    }

    /// True if the whole read/export may succeed when retried later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Allocator(AllocatorError::AllocationTimeout { .. }))
    }

    /// Wrap an error raised by a data source or data writer extension
    pub fn extension(message: impl std::fmt::Display) -> Self {
        Error::Pipeline(PipelineError::Extension(message.to_string()))
    }
}

/// Data model errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataModelError {
    /// Identifier does not match the required pattern
    #[error("Invalid {kind} identifier: {id}")]
    InvalidIdentifier {
        /// What was being validated (catalog, resource, parameter)
        kind: &'static str,
        /// The rejected identifier
        id: String,
    },

    /// Sample period must be strictly positive
    #[error("Invalid sample period: {0} ns")]
    InvalidSamplePeriod(i64),

    /// Unknown raw data type code
    #[error("Unknown data type: {0:#x}")]
    UnknownDataType(u16),
}

/// Cache errors
///
/// Read and write failures are recovered inside the cache store and only
/// become visible through logs; `ClearTimeout` is surfaced to callers.
#[derive(Error, Debug)]
pub enum CacheError {
    /// No bucket period exists for this sample period
    #[error("Unsupported sample period: {0} ns")]
    UnsupportedSamplePeriod(i64),

    /// Bucket file I/O failed
    #[error("Cache I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Bucket file content is not valid
    #[error("Corrupt cache file {path}: {reason}")]
    Corrupt {
        /// Bucket file path
        path: PathBuf,
        /// What failed validation
        reason: String,
    },

    /// Another writer of this process holds the bucket file
    #[error("Cache file is in use: {0}")]
    InUse(PathBuf),

    /// A file scheduled for deletion still exists after the retry window
    #[error("Cache file {path} could not be deleted within {timeout_ms} ms")]
    ClearTimeout {
        /// File that could not be removed
        path: PathBuf,
        /// Retry window in milliseconds
        timeout_ms: u64,
    },
}

/// Memory allocator errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AllocatorError {
    /// The minimum request can never be satisfied
    #[error("Request of {requested} bytes exceeds budget of {budget} bytes")]
    RequestExceedsBudget {
        /// Minimum bytes requested
        requested: usize,
        /// Largest grantable amount
        budget: usize,
    },

    /// Minimum is greater than maximum
    #[error("Invalid allocation range: min {min} > max {max}")]
    InvalidRange {
        /// Minimum bytes requested
        min: usize,
        /// Maximum bytes requested
        max: usize,
    },

    /// Waited longer than the configured deadline
    #[error("Timed out after {waited_ms} ms waiting for {min} bytes")]
    AllocationTimeout {
        /// Minimum bytes requested
        min: usize,
        /// Time spent waiting
        waited_ms: u64,
    },

    /// Wait was cancelled
    #[error("Allocation cancelled")]
    Cancelled,
}

/// Aggregation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregationError {
    /// Kind cannot be produced by block reduction
    #[error("Unsupported representation kind: {0}")]
    UnsupportedRepresentationKind(String),

    /// Buffers have inconsistent lengths
    #[error("Buffer length mismatch: {0}")]
    LengthMismatch(String),

    /// Block size must be at least one
    #[error("Invalid block size: {0}")]
    InvalidBlockSize(usize),
}

/// Pipeline errors
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Request parameters are inconsistent
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No factory registered under this type name
    #[error("Unknown extension type: {0}")]
    UnknownExtension(String),

    /// A data source or data writer failed
    #[error("Extension failed: {0}")]
    Extension(String),

    /// Pipe closed before all expected values arrived
    #[error("Unexpected end of stream: expected {expected} bytes, got {actual}")]
    UnexpectedEndOfStream {
        /// Bytes expected
        expected: usize,
        /// Bytes actually received
        actual: usize,
    },

    /// Other end of a pipe went away
    #[error("Pipe closed: {0}")]
    PipeClosed(String),

    /// A pipeline task panicked or was aborted
    #[error("Task failed: {0}")]
    TaskFailed(String),

    /// Cancelled while streaming
    #[error("Pipeline cancelled")]
    Cancelled,
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
