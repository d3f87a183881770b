//! Streaming pipeline
//!
//! An export runs two concurrent sides connected by one bounded pipe per item:
//!
//! ```text
//!  reading task                                   writing task
//! ┌──────────────────────────┐   pipe(item 0)   ┌──────────────────────────┐
//! │ DataSourceReader (src A) │ ───────────────► │ DataWriterController     │
//! │ DataSourceReader (src B) │ ───────────────► │   or drain (no writer)   │
//! └──────────────────────────┘   pipe(item n)   └──────────────────────────┘
//! ```
//!
//! Both sides are joined fail-fast: the first error cancels the other side and
//! is returned right away. Caller cancellation cascades the same way.

pub mod reader;
pub mod registry;
pub mod source;
pub mod writer;

pub use reader::{CatalogItemRequest, DataSourceReader, Processing};
pub use registry::{CapabilityRegistry, SourceFactory, WriterFactory};
pub use source::{DataSource, ReadRequest, SourceRegistration};
pub use writer::{drain_all, DataWriter, DataWriterController, ProgressCallback, WriteRequest};

use crate::allocator::{AllocatorConfig, MemoryAllocator};
use crate::cache::CacheService;
use crate::config::EngineConfig;
use crate::error::{Error, PipelineError, Result};
use crate::interval::to_nanos;
use crate::metrics;
use crate::pipe::{pipe, PipeReader, PipeWriter};
use crate::types::{CatalogItem, Parameters, SamplePeriod};
use chrono::{DateTime, TimeDelta, Utc};
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

// =============================================================================
// Export Request
// =============================================================================

/// Everything needed to export a time range of several items
#[derive(Debug, Clone)]
pub struct ExportRequest {
    /// Inclusive start
    pub begin: DateTime<Utc>,
    /// Exclusive end
    pub end: DateTime<Utc>,
    /// Sample period shared by all items
    pub sample_period: SamplePeriod,
    /// A new output file is started every file period; zero means one file
    pub file_period: TimeDelta,
    /// Registered writer type, `None` to read and discard
    pub writer_type: Option<String>,
    /// Writer specific settings
    pub writer_configuration: Parameters,
    /// Items to export
    pub items: Vec<CatalogItemRequest>,
}

impl ExportRequest {
    /// Export without writer and with a single file period
    pub fn new(
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        sample_period: SamplePeriod,
        items: Vec<CatalogItemRequest>,
    ) -> Self {
        Self {
            begin,
            end,
            sample_period,
            file_period: TimeDelta::zero(),
            writer_type: None,
            writer_configuration: Parameters::new(),
            items,
        }
    }

    /// Write through the writer registered as `writer_type`
    pub fn with_writer(mut self, writer_type: impl Into<String>, configuration: Parameters) -> Self {
        self.writer_type = Some(writer_type.into());
        self.writer_configuration = configuration;
        self
    }

    /// Cut a new file every `file_period`
    pub fn with_file_period(mut self, file_period: TimeDelta) -> Self {
        self.file_period = file_period;
        self
    }

    /// Check range alignment, file period and items
    pub fn validate(&self) -> Result<()> {
        validate_range(self.begin, self.end, self.sample_period)?;

        let file_period = self
            .file_period
            .num_nanoseconds()
            .ok_or_else(|| invalid("file period out of range".to_string()))?;

        if file_period < 0 || file_period % self.sample_period.as_nanos() != 0 {
            return Err(invalid(format!(
                "file period {} is not a non-negative multiple of the sample period {}",
                self.file_period, self.sample_period
            )));
        }

        validate_items(&self.items, self.sample_period)
    }
}

fn invalid(message: String) -> Error {
    PipelineError::InvalidRequest(message).into()
}

fn validate_range(begin: DateTime<Utc>, end: DateTime<Utc>, sample_period: SamplePeriod) -> Result<()> {
    if begin >= end {
        return Err(invalid(format!("begin {} must be before end {}", begin, end)));
    }

    let period = sample_period.as_nanos();
    if to_nanos(begin).rem_euclid(period) != 0 || to_nanos(end).rem_euclid(period) != 0 {
        return Err(invalid(format!(
            "begin and end must be multiples of the sample period {}",
            sample_period
        )));
    }

    Ok(())
}

fn validate_items(items: &[CatalogItemRequest], sample_period: SamplePeriod) -> Result<()> {
    if items.is_empty() {
        return Err(invalid("no items requested".to_string()));
    }

    for request in items {
        if request.item.representation.sample_period != sample_period {
            return Err(invalid(format!(
                "{} does not have the requested sample period {}",
                request.item, sample_period
            )));
        }
        request.processing()?;
    }

    Ok(())
}

// =============================================================================
// Read Streams
// =============================================================================

/// Pipes of a running read, one per item in request order
pub struct ReadStreams {
    /// Item and the pipe carrying its doubles
    pub readers: Vec<(CatalogItem, PipeReader)>,
    /// Task feeding the pipes
    pub task: JoinHandle<Result<()>>,
}

impl ReadStreams {
    /// Wait for the reading task to finish
    pub async fn join(self) -> Result<()> {
        flatten(self.task.await)
    }
}

fn flatten(result: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    result.map_err(|e| PipelineError::TaskFailed(e.to_string()))?
}

// =============================================================================
// Engine
// =============================================================================

/// Cache, allocator and extensions shared by all exports
pub struct DataEngine {
    config: EngineConfig,
    registry: CapabilityRegistry,
    cache: Option<CacheService>,
    allocator: Arc<MemoryAllocator>,
}

impl DataEngine {
    /// Create an engine from validated configuration
    pub fn new(config: EngineConfig, registry: CapabilityRegistry) -> Result<Self> {
        config.validate().map_err(Error::Configuration)?;

        let allocator_config = AllocatorConfig::from(&config.memory);
        allocator_config.validate().map_err(Error::Configuration)?;

        let cache = config.cache.enabled.then(|| CacheService::new(&config.cache));

        info!(
            cache = ?cache.as_ref().map(|c| c.root().display().to_string()),
            total_buffer_memory = config.memory.total_buffer_memory,
            sources = ?registry.source_types(),
            writers = ?registry.writer_types(),
            "Data engine created"
        );

        Ok(Self {
            allocator: Arc::new(MemoryAllocator::new(allocator_config)),
            config,
            registry,
            cache,
        })
    }

    /// Share an allocator with other engines
    pub fn with_allocator(mut self, allocator: Arc<MemoryAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registered extensions
    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Cache store, if enabled
    pub fn cache(&self) -> Option<&CacheService> {
        self.cache.as_ref()
    }

    /// Memory allocator
    pub fn allocator(&self) -> &Arc<MemoryAllocator> {
        &self.allocator
    }

    /// Delete the cached buckets of a catalog in `[begin, end)`
    pub async fn clear_cache(
        &self,
        catalog_id: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        match &self.cache {
            Some(cache) => cache.clear_range(catalog_id, begin, end, cancel).await,
            None => Ok(0),
        }
    }

    /// Run an export to completion
    ///
    /// Returns `Error::Cancelled` when `cancel` fires, and the first error of
    /// either side otherwise.
    pub async fn export(
        &self,
        request: ExportRequest,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let started = Instant::now();
        request.validate()?;

        let writer = match &request.writer_type {
            Some(writer_type) => Some(
                self.registry
                    .create_writer(writer_type, &request.writer_configuration)?,
            ),
            None => None,
        };

        info!(
            begin = %request.begin,
            end = %request.end,
            sample_period = %request.sample_period,
            items = request.items.len(),
            writer = request.writer_type.as_deref().unwrap_or("none"),
            "Export started"
        );

        let token = cancel.child_token();
        let _guard = token.clone().drop_guard();

        let streams = self.spawn_reading(request.begin, request.end, request.items, &token)?;

        let writing = {
            let token = token.clone();
            let inputs = streams.readers;
            let write_buffer_samples = self.config.pipeline.write_buffer_samples;
            let (begin, end) = (request.begin, request.end);
            let (sample_period, file_period) = (request.sample_period, request.file_period);

            tokio::spawn(async move {
                match writer {
                    Some(writer) => {
                        DataWriterController::new(writer, write_buffer_samples)
                            .write(begin, end, sample_period, file_period, inputs, progress, &token)
                            .await
                    }
                    None => {
                        let readers = inputs.into_iter().map(|(_, reader)| reader).collect();
                        drain_all(readers).await.map(|_| ())
                    }
                }
            })
        };

        let result = join_fail_fast(streams.task, writing, &token, cancel).await;
        let elapsed = started.elapsed().as_secs_f64();

        match &result {
            Ok(()) => {
                info!(duration_secs = elapsed, "Export completed");
                metrics::record_export("completed", elapsed);
            }
            Err(e) if e.is_cancelled() => {
                info!(duration_secs = elapsed, "Export cancelled");
                metrics::record_export("cancelled", elapsed);
            }
            Err(e) => {
                error!(error = %e, duration_secs = elapsed, "Export failed");
                metrics::record_export("failed", elapsed);
            }
        }

        result
    }

    /// Start reading `[begin, end)` and hand the pipes to the caller
    ///
    /// The caller must consume every pipe; cancelling `cancel` stops the task.
    pub fn read_streams(
        &self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        sample_period: SamplePeriod,
        items: Vec<CatalogItemRequest>,
        cancel: &CancellationToken,
    ) -> Result<ReadStreams> {
        validate_range(begin, end, sample_period)?;
        validate_items(&items, sample_period)?;
        self.spawn_reading(begin, end, items, cancel)
    }

    fn spawn_reading(
        &self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        items: Vec<CatalogItemRequest>,
        cancel: &CancellationToken,
    ) -> Result<ReadStreams> {
        let capacity = self.config.pipeline.pipe_capacity;
        let mut groups: Vec<(SourceRegistration, Vec<(CatalogItemRequest, PipeWriter)>)> = Vec::new();
        let mut readers = Vec::with_capacity(items.len());

        for request in items {
            let (tx, rx) = pipe(capacity, cancel.clone());
            readers.push((request.item.clone(), rx));

            match groups.iter_mut().find(|(source, _)| *source == request.source) {
                Some((_, group)) => group.push((request, tx)),
                None => groups.push((request.source.clone(), vec![(request, tx)])),
            }
        }

        let mut work = Vec::with_capacity(groups.len());
        for (registration, group) in groups {
            let source = self.registry.create_source(&registration)?;
            let reader = DataSourceReader::new(
                source,
                self.cache.clone(),
                Arc::clone(&self.allocator),
                self.config.processing.nan_threshold,
            );
            work.push((reader, group));
        }

        let token = cancel.clone();
        let task = tokio::spawn(async move {
            try_join_all(work.into_iter().map(|(reader, group)| {
                let token = token.clone();
                async move { reader.read(begin, end, group, &token).await }
            }))
            .await
            .map(|_| ())
        });

        Ok(ReadStreams { readers, task })
    }
}

impl std::fmt::Debug for DataEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataEngine")
            .field("registry", &self.registry)
            .field("cache", &self.cache.as_ref().map(|c| c.root().to_path_buf()))
            .field("allocator", &self.allocator)
            .finish()
    }
}

/// Wait for both sides, returning as soon as one fails or the caller cancels
async fn join_fail_fast(
    mut reading: JoinHandle<Result<()>>,
    mut writing: JoinHandle<Result<()>>,
    token: &CancellationToken,
    caller: &CancellationToken,
) -> Result<()> {
    let mut reading_done = false;
    let mut writing_done = false;

    while !(reading_done && writing_done) {
        tokio::select! {
            biased;

            _ = caller.cancelled() => {
                token.cancel();
                return Err(Error::Cancelled);
            }

            result = &mut reading, if !reading_done => {
                if let Err(e) = flatten(result) {
                    token.cancel();
                    return Err(e);
                }
                reading_done = true;
            }

            result = &mut writing, if !writing_done => {
                if let Err(e) = flatten(result) {
                    token.cancel();

                    // a failed reader drops its pipes, the writer only sees the truncation
                    if !reading_done && is_truncation(&e) {
                        if let Err(cause) = flatten((&mut reading).await) {
                            if !cause.is_cancelled() {
                                return Err(cause);
                            }
                        }
                    }
                    return Err(e);
                }
                writing_done = true;
            }
        }
    }

    Ok(())
}

fn is_truncation(error: &Error) -> bool {
    matches!(
        error,
        Error::Pipeline(PipelineError::UnexpectedEndOfStream { .. })
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NexusDataType, Representation, RepresentationKind};
    use chrono::TimeZone;

    fn item(secs: i64, kind: RepresentationKind) -> CatalogItem {
        let representation = Representation::new(
            NexusDataType::FLOAT64,
            SamplePeriod::from_secs(secs).unwrap(),
            kind,
        );
        CatalogItem::new("/A", "T1", representation, None).unwrap()
    }

    fn request(begin: DateTime<Utc>, end: DateTime<Utc>) -> ExportRequest {
        ExportRequest::new(
            begin,
            end,
            SamplePeriod::from_secs(1).unwrap(),
            vec![CatalogItemRequest::original(
                item(1, RepresentationKind::Original),
                SourceRegistration::new("src"),
            )],
        )
    }

    #[test]
    fn test_export_request_validation() {
        let begin = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let end = begin + TimeDelta::minutes(1);

        assert!(request(begin, end).validate().is_ok());
        assert!(request(end, begin).validate().is_err());
        assert!(request(begin + TimeDelta::milliseconds(500), end).validate().is_err());
        assert!(request(begin, end).with_file_period(TimeDelta::milliseconds(1500)).validate().is_err());
        assert!(request(begin, end).with_file_period(TimeDelta::seconds(-1)).validate().is_err());
        assert!(request(begin, end).with_file_period(TimeDelta::seconds(30)).validate().is_ok());

        let mut empty = request(begin, end);
        empty.items.clear();
        assert!(empty.validate().is_err());

        let mut mismatched = request(begin, end);
        mismatched.sample_period = SamplePeriod::from_secs(2).unwrap();
        assert!(mismatched.validate().is_err());
    }

    #[tokio::test]
    async fn test_fail_fast_returns_before_slow_side() {
        let token = CancellationToken::new();
        let caller = CancellationToken::new();

        let slow_token = token.clone();
        let reading = tokio::spawn(async move {
            slow_token.cancelled().await;
            Err::<(), _>(Error::Cancelled)
        });
        let writing = tokio::spawn(async { Err::<(), _>(Error::extension("disk full")) });

        let result = join_fail_fast(reading, writing, &token, &caller).await;
        assert!(matches!(result, Err(Error::Pipeline(PipelineError::Extension(_)))));
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_truncation_reports_reading_cause() {
        let token = CancellationToken::new();
        let caller = CancellationToken::new();

        let reading = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Err::<(), _>(Error::extension("source offline"))
        });
        let writing = tokio::spawn(async {
            Err::<(), Error>(
                PipelineError::UnexpectedEndOfStream {
                    expected: 8,
                    actual: 0,
                }
                .into(),
            )
        });

        let result = join_fail_fast(reading, writing, &token, &caller).await;
        assert!(matches!(result, Err(Error::Pipeline(PipelineError::Extension(msg))) if msg == "source offline"));
    }

    #[tokio::test]
    async fn test_caller_cancellation() {
        let token = CancellationToken::new();
        let caller = CancellationToken::new();

        let reading = tokio::spawn(std::future::pending::<Result<()>>());
        let writing = tokio::spawn(std::future::pending::<Result<()>>());

        caller.cancel();
        let result = join_fail_fast(reading, writing, &token, &caller).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(token.is_cancelled());
    }
}
