//! Reading side of a pipeline
//!
//! A [`DataSourceReader`] serves every requested item backed by one source
//! registration. The time range is processed in steps whose size is granted
//! by the memory allocator:
//!
//! ```text
//! acquire ticket -> cache read (derived items) -> batched source read of the
//! gaps -> decode / aggregate / resample -> cache write -> pipe write -> release
//! ```

use super::source::{DataSource, ReadRequest, SourceRegistration};
use crate::aggregation;
use crate::allocator::MemoryAllocator;
use crate::cache::CacheService;
use crate::error::{Error, PipelineError, Result};
use crate::interval::{ceil_nanos, floor_nanos, from_nanos, to_nanos, Interval};
use crate::metrics;
use crate::pipe::PipeWriter;
use crate::types::{CatalogItem, RepresentationKind};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const SAMPLE_SIZE: usize = std::mem::size_of::<f64>();

// =============================================================================
// Item Request
// =============================================================================

/// A resolved catalog item together with where its data comes from
///
/// Derived items (aggregations and resampled items) are computed from
/// `base_item`, which is what the source is actually asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogItemRequest {
    /// Item delivered to the consumer
    pub item: CatalogItem,
    /// Original item the derived item is computed from
    pub base_item: Option<CatalogItem>,
    /// Source serving the original data
    pub source: SourceRegistration,
}

/// How source data turns into the requested representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processing {
    /// Decode the source data as is
    Direct,
    /// Reduce `block` source samples into one value
    Aggregate {
        /// Source samples per output sample
        block: usize,
    },
    /// Repeat every source sample `block` times
    Resample {
        /// Output samples per source sample
        block: usize,
    },
}

impl CatalogItemRequest {
    /// Request an original item
    pub fn original(item: CatalogItem, source: SourceRegistration) -> Self {
        Self {
            item,
            base_item: None,
            source,
        }
    }

    /// Request an item derived from `base_item`
    pub fn derived(item: CatalogItem, base_item: CatalogItem, source: SourceRegistration) -> Self {
        Self {
            item,
            base_item: Some(base_item),
            source,
        }
    }

    /// Item the source is asked for
    pub fn source_item(&self) -> &CatalogItem {
        self.base_item.as_ref().unwrap_or(&self.item)
    }

    /// Work needed to produce the item, validating base and item periods
    pub fn processing(&self) -> Result<Processing> {
        let representation = &self.item.representation;
        let item_period = representation.sample_period.as_nanos();

        let base = match (&self.base_item, representation.kind) {
            (None, RepresentationKind::Original) => return Ok(Processing::Direct),
            (Some(base), RepresentationKind::Original) => {
                if base.representation.sample_period.as_nanos() != item_period {
                    return Err(invalid(format!(
                        "{}: base item {} has a different sample period",
                        self.item, base
                    )));
                }
                return Ok(Processing::Direct);
            }
            (None, kind) => {
                return Err(invalid(format!("{}: {} requires a base item", self.item, kind)));
            }
            (Some(base), _) => base,
        };

        let base_period = base.representation.sample_period.as_nanos();

        if representation.kind == RepresentationKind::Resampled {
            if base_period % item_period != 0 {
                return Err(invalid(format!(
                    "{}: base period {} is not a multiple of {}",
                    self.item,
                    base.representation.sample_period,
                    representation.sample_period
                )));
            }
            return Ok(Processing::Resample {
                block: (base_period / item_period) as usize,
            });
        }

        if item_period % base_period != 0 {
            return Err(invalid(format!(
                "{}: period is not a multiple of base period {}",
                self.item, base.representation.sample_period
            )));
        }

        if representation.kind.is_bitwise() && base.representation.data_type.is_float() {
            return Err(invalid(format!(
                "{}: bitwise aggregation of floating point base item {}",
                self.item, base
            )));
        }

        Ok(Processing::Aggregate {
            block: (item_period / base_period) as usize,
        })
    }
}

fn invalid(message: String) -> Error {
    PipelineError::InvalidRequest(message).into()
}

// =============================================================================
// Reader
// =============================================================================

struct ItemState {
    request: CatalogItemRequest,
    processing: Processing,
    writer: PipeWriter,
}

impl ItemState {
    fn sample_period(&self) -> i64 {
        self.request.item.representation.sample_period.as_nanos()
    }

    fn is_derived(&self) -> bool {
        self.processing != Processing::Direct
    }

    /// Allocator cost of producing `span` nanoseconds of this item
    fn cost(&self, span: i64) -> usize {
        let output = (span / self.sample_period()) as usize;
        let element_size = self.request.source_item().representation.element_size();

        let (source, decoded) = match self.processing {
            Processing::Direct => (output, output),
            Processing::Aggregate { block } => {
                // bitwise kinds reduce the raw buffer, all others decode it first
                let decoded = if self.request.item.representation.kind.is_bitwise() {
                    0
                } else {
                    output * block
                };
                (output * block, decoded)
            }
            Processing::Resample { block } => {
                let source = output.div_ceil(block) + 1;
                (source, source)
            }
        };

        source * (element_size + 1) + (decoded + output) * SAMPLE_SIZE
    }

    /// Range the source must deliver to produce `interval`
    fn source_range(&self, interval: &Interval) -> (i64, i64) {
        let begin = to_nanos(interval.begin);
        let end = to_nanos(interval.end);

        match self.processing {
            Processing::Resample { .. } => {
                let base_period = self
                    .request
                    .source_item()
                    .representation
                    .sample_period
                    .as_nanos();
                (floor_nanos(begin, base_period), ceil_nanos(end, base_period))
            }
            _ => (begin, end),
        }
    }
}

/// One gap of one item to be filled from the source
struct Fetch {
    item: usize,
    interval: Interval,
}

/// Streams all items of one source registration into their pipes
pub struct DataSourceReader {
    source: Arc<dyn DataSource>,
    cache: Option<CacheService>,
    allocator: Arc<MemoryAllocator>,
    nan_threshold: f64,
}

impl DataSourceReader {
    /// Create a reader
    ///
    /// Without a cache every derived item is recomputed from source data.
    pub fn new(
        source: Arc<dyn DataSource>,
        cache: Option<CacheService>,
        allocator: Arc<MemoryAllocator>,
        nan_threshold: f64,
    ) -> Self {
        Self {
            source,
            cache,
            allocator,
            nan_threshold,
        }
    }

    /// Read `[begin, end)` of every item into its pipe, completing the pipes at the end
    pub async fn read(
        &self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        items: Vec<(CatalogItemRequest, PipeWriter)>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut states = Vec::with_capacity(items.len());
        for (request, writer) in items {
            let processing = request.processing()?;
            states.push(ItemState {
                request,
                processing,
                writer,
            });
        }

        if states.is_empty() {
            return Ok(());
        }

        let begin_ns = to_nanos(begin);
        let end_ns = to_nanos(end);

        // smallest span that holds a whole number of samples of every item
        let unit = states
            .iter()
            .map(ItemState::sample_period)
            .fold(1, lcm);

        let unit_cost: usize = states.iter().map(|state| state.cost(unit)).sum::<usize>().max(1);
        let mut cursor = begin_ns;

        while cursor < end_ns {
            let remaining_units = ((end_ns - cursor) as u64).div_ceil(unit as u64) as usize;
            let max = unit_cost.saturating_mul(remaining_units);

            let ticket = self.allocator.acquire(unit_cost, max, cancel).await?;
            let units = (ticket.amount() / unit_cost).clamp(1, remaining_units);
            let step_end = cursor.saturating_add(units as i64 * unit).min(end_ns);

            debug!(
                begin = %from_nanos(cursor),
                end = %from_nanos(step_end),
                granted = ticket.amount(),
                "Reading step"
            );

            self.read_step(cursor, step_end, &mut states, cancel).await?;
            ticket.release();

            cursor = step_end;
        }

        for state in states {
            state.writer.complete().await?;
        }

        Ok(())
    }

    async fn read_step(
        &self,
        begin: i64,
        end: i64,
        states: &mut [ItemState],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let step_begin = from_nanos(begin);
        let mut targets = Vec::with_capacity(states.len());
        let mut gaps = Vec::with_capacity(states.len());

        for state in states.iter() {
            let mut target = vec![f64::NAN; ((end - begin) / state.sample_period()) as usize];
            let full = vec![Interval::from_nanos(begin, end)];

            let uncached = match (&self.cache, state.is_derived()) {
                (Some(cache), true) => {
                    match cache.read(&state.request.item, step_begin, &mut target).await {
                        Ok(uncached) => Some(uncached),
                        Err(e) => {
                            debug!(item = %state.request.item, error = %e, "Item not cacheable");
                            None
                        }
                    }
                }
                _ => None,
            };

            gaps.push(uncached.clone().unwrap_or(full));
            targets.push((target, uncached.is_some()));
        }

        // one source call per distinct range
        let mut batches: BTreeMap<(i64, i64), Vec<Fetch>> = BTreeMap::new();
        for (index, state) in states.iter().enumerate() {
            for interval in &gaps[index] {
                batches
                    .entry(state.source_range(interval))
                    .or_default()
                    .push(Fetch {
                        item: index,
                        interval: *interval,
                    });
            }
        }

        for ((source_begin, source_end), fetches) in batches {
            let source_begin_time = from_nanos(source_begin);
            let source_end_time = from_nanos(source_end);

            let mut requests: Vec<ReadRequest> = fetches
                .iter()
                .map(|fetch| {
                    ReadRequest::new(
                        states[fetch.item].request.source_item().clone(),
                        source_begin_time,
                        source_end_time,
                    )
                })
                .collect();

            match self
                .source
                .read(source_begin_time, source_end_time, &mut requests, cancel)
                .await
            {
                Ok(()) => metrics::record_source_read(true),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    metrics::record_source_read(false);
                    return Err(match e {
                        Error::Pipeline(_) => e,
                        other => Error::extension(other),
                    });
                }
            }

            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled.into());
            }

            for (fetch, request) in fetches.iter().zip(requests) {
                let state = &states[fetch.item];
                let (target, _) = &mut targets[fetch.item];
                process(state, begin, source_begin, &fetch.interval, &request, target, self.nan_threshold)?;
            }
        }

        if let Some(cache) = &self.cache {
            for (index, state) in states.iter().enumerate() {
                let (target, cacheable) = &targets[index];
                if *cacheable && !gaps[index].is_empty() {
                    if let Err(e) = cache.write(&state.request.item, step_begin, target, &gaps[index]).await {
                        warn!(item = %state.request.item, error = %e, "Cache write failed");
                    }
                }
            }
        }

        // pipes are fed concurrently, the consumer reads them together
        try_join_all(
            states
                .iter_mut()
                .zip(targets.iter())
                .map(|(state, (target, _))| state.writer.write_f64s(target)),
        )
        .await?;

        Ok(())
    }
}

/// Fill the part of `target` covered by `interval` from one source buffer
fn process(
    state: &ItemState,
    step_begin: i64,
    source_begin: i64,
    interval: &Interval,
    request: &ReadRequest,
    target: &mut [f64],
    nan_threshold: f64,
) -> Result<()> {
    let sample_period = state.sample_period();
    let interval_begin = to_nanos(interval.begin);
    let first = ((interval_begin - step_begin) / sample_period) as usize;
    let count = ((to_nanos(interval.end) - interval_begin) / sample_period) as usize;
    let target = &mut target[first..first + count];

    let source_representation = &request.item.representation;
    let data_type = source_representation.data_type;

    match state.processing {
        Processing::Direct => {
            let values = aggregation::decode(data_type, &request.data, &request.status)?;
            if values.len() != target.len() {
                return Err(PipelineError::Extension(format!(
                    "source returned {} samples for {}, expected {}",
                    values.len(),
                    state.request.item,
                    target.len()
                ))
                .into());
            }
            target.copy_from_slice(&values);
        }
        Processing::Aggregate { block } => {
            aggregation::aggregate(
                state.request.item.representation.kind,
                data_type,
                &request.data,
                &request.status,
                block,
                nan_threshold,
                target,
            )?;
        }
        Processing::Resample { block } => {
            let values = aggregation::decode(data_type, &request.data, &request.status)?;
            let offset = ((interval_begin - source_begin) / sample_period) as usize;
            aggregation::resample(&values, block, offset, target)?;
        }
    }

    Ok(())
}

fn gcd(a: i64, b: i64) -> i64 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

fn lcm(a: i64, b: i64) -> i64 {
    a / gcd(a, b) * b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::AllocatorConfig;
    use crate::pipe::pipe;
    use crate::types::{create_buffers, NexusDataType, Representation, SamplePeriod};
    use async_trait::async_trait;
    use chrono::{TimeDelta, TimeZone};
    use parking_lot::Mutex;

    /// Delivers `seconds since epoch` as f64 for every sample, recording calls
    struct ClockSource {
        calls: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>, usize)>>,
    }

    impl ClockSource {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DataSource for ClockSource {
        async fn read(
            &self,
            begin: DateTime<Utc>,
            end: DateTime<Utc>,
            requests: &mut [ReadRequest],
            _cancel: &CancellationToken,
        ) -> Result<()> {
            self.calls.lock().push((begin, end, requests.len()));

            for request in requests.iter_mut() {
                let period = request.item.representation.sample_period.as_nanos();
                let begin_ns = to_nanos(begin);
                for i in 0..request.status.len() {
                    let value = (begin_ns + i as i64 * period) as f64 / 1e9;
                    request.data[i * 8..(i + 1) * 8].copy_from_slice(&value.to_le_bytes());
                    request.status[i] = 1;
                }
            }
            Ok(())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl DataSource for FailingSource {
        async fn read(
            &self,
            _begin: DateTime<Utc>,
            _end: DateTime<Utc>,
            _requests: &mut [ReadRequest],
            _cancel: &CancellationToken,
        ) -> Result<()> {
            Err(Error::Io(std::io::Error::other("device offline")))
        }
    }

    fn item(secs: i64, kind: RepresentationKind) -> CatalogItem {
        let representation = Representation::new(
            NexusDataType::FLOAT64,
            SamplePeriod::from_secs(secs).unwrap(),
            kind,
        );
        CatalogItem::new("/A/B", "T1", representation, None).unwrap()
    }

    fn allocator(total_budget: usize) -> Arc<MemoryAllocator> {
        Arc::new(MemoryAllocator::new(AllocatorConfig {
            total_budget,
            fairness_factor: 1,
            ..AllocatorConfig::default()
        }))
    }

    #[test]
    fn test_processing_selection() {
        let source = SourceRegistration::new("clock");

        let direct = CatalogItemRequest::original(item(1, RepresentationKind::Original), source.clone());
        assert_eq!(direct.processing().unwrap(), Processing::Direct);

        let mean = CatalogItemRequest::derived(
            item(60, RepresentationKind::Mean),
            item(1, RepresentationKind::Original),
            source.clone(),
        );
        assert_eq!(mean.processing().unwrap(), Processing::Aggregate { block: 60 });

        let resampled = CatalogItemRequest::derived(
            item(1, RepresentationKind::Resampled),
            item(10, RepresentationKind::Original),
            source.clone(),
        );
        assert_eq!(resampled.processing().unwrap(), Processing::Resample { block: 10 });

        let no_base = CatalogItemRequest::original(item(60, RepresentationKind::Mean), source.clone());
        assert!(no_base.processing().is_err());

        let misaligned = CatalogItemRequest::derived(
            item(90, RepresentationKind::Mean),
            item(60, RepresentationKind::Original),
            source,
        );
        assert!(misaligned.processing().is_err());
    }

    #[tokio::test]
    async fn test_aggregates_in_small_steps() {
        let begin = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2020, 1, 1, 0, 5, 0).unwrap();
        let cancel = CancellationToken::new();

        let source = Arc::new(ClockSource::new());
        let request = CatalogItemRequest::derived(
            item(60, RepresentationKind::Max),
            item(1, RepresentationKind::Original),
            SourceRegistration::new("clock"),
        );

        // budget for exactly one minute per step
        let unit_cost = 60 * 9 + (60 + 1) * 8;
        let reader = DataSourceReader::new(source.clone(), None, allocator(unit_cost), 0.99);

        let (tx, mut rx) = pipe(1024, cancel.clone());
        let consumer = tokio::spawn(async move { rx.read_f64s(5).await });

        reader.read(begin, end, vec![(request, tx)], &cancel).await.unwrap();

        let values = consumer.await.unwrap().unwrap().unwrap();
        let first = to_nanos(begin) as f64 / 1e9;
        assert_eq!(values, (0..5).map(|m| first + 60.0 * m as f64 + 59.0).collect::<Vec<_>>());
        assert_eq!(source.calls.lock().len(), 5);
    }

    fn state(request: CatalogItemRequest) -> ItemState {
        let (writer, _reader) = pipe(16, CancellationToken::new());
        ItemState {
            processing: request.processing().unwrap(),
            request,
            writer,
        }
    }

    /// Bytes held while processing `span`: raw data and status, decoded doubles, output
    fn allocated(request: &CatalogItemRequest, span: i64) -> usize {
        let source = request.source_item().representation.clone();
        let begin = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let (data, status) = create_buffers(&source, begin, begin + TimeDelta::nanoseconds(span));

        let decoded = if request.item.representation.kind.is_bitwise() {
            0
        } else {
            crate::aggregation::decode(source.data_type, &data, &status).unwrap().len()
        };
        let output = (span / request.item.representation.sample_period.as_nanos()) as usize;

        data.len() + status.len() + (decoded + output) * SAMPLE_SIZE
    }

    #[tokio::test]
    async fn test_cost_covers_allocated_buffers() {
        let minute = 60_000_000_000;
        let source = SourceRegistration::new("clock");

        let mean = CatalogItemRequest::derived(
            item(60, RepresentationKind::Mean),
            item(1, RepresentationKind::Original),
            source.clone(),
        );
        assert_eq!(state(mean.clone()).cost(minute), allocated(&mean, minute));
        assert_eq!(state(mean).cost(minute), 1028);

        let counter = |secs, kind| {
            let representation = Representation::new(NexusDataType::UINT32, SamplePeriod::from_secs(secs).unwrap(), kind);
            CatalogItem::new("/A/B", "T2", representation, None).unwrap()
        };
        let or = CatalogItemRequest::derived(
            counter(60, RepresentationKind::MaxBitwise),
            counter(1, RepresentationKind::Original),
            source.clone(),
        );
        assert_eq!(state(or.clone()).cost(minute), allocated(&or, minute));

        let direct = CatalogItemRequest::original(item(1, RepresentationKind::Original), source);
        assert_eq!(state(direct.clone()).cost(minute), allocated(&direct, minute));
    }

    #[tokio::test]
    async fn test_resample_widens_source_range() {
        let begin = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 5).unwrap();
        let end = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 25).unwrap();
        let cancel = CancellationToken::new();

        let source = Arc::new(ClockSource::new());
        let request = CatalogItemRequest::derived(
            item(1, RepresentationKind::Resampled),
            item(10, RepresentationKind::Original),
            SourceRegistration::new("clock"),
        );
        let reader = DataSourceReader::new(source.clone(), None, allocator(1 << 20), 0.99);

        let (tx, mut rx) = pipe(1024, cancel.clone());
        reader.read(begin, end, vec![(request, tx)], &cancel).await.unwrap();

        let values = rx.read_f64s(20).await.unwrap().unwrap();
        let base = to_nanos(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()) as f64 / 1e9;
        assert_eq!(values[0], base);
        assert_eq!(values[4], base);
        assert_eq!(values[5], base + 10.0);
        assert_eq!(values[19], base + 20.0);

        let calls = source.calls.lock();
        assert_eq!(calls[0].0, Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(calls[0].1, Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 30).unwrap());
    }

    #[tokio::test]
    async fn test_cached_items_skip_source() {
        let directory = tempfile::tempdir().unwrap();
        let cache = CacheService::with_root(directory.path());
        let begin = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2020, 1, 1, 1, 0, 0).unwrap();
        let cancel = CancellationToken::new();

        let source = Arc::new(ClockSource::new());
        let request = CatalogItemRequest::derived(
            item(600, RepresentationKind::Mean),
            item(60, RepresentationKind::Original),
            SourceRegistration::new("clock"),
        );
        let reader = DataSourceReader::new(source.clone(), Some(cache), allocator(1 << 20), 0.99);

        let mut outputs = Vec::new();
        for _ in 0..2 {
            let (tx, mut rx) = pipe(1024, cancel.clone());
            reader.read(begin, end, vec![(request.clone(), tx)], &cancel).await.unwrap();
            outputs.push(rx.read_f64s(6).await.unwrap().unwrap());
        }

        assert_eq!(outputs[0], outputs[1]);
        assert_eq!(source.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_source_error_is_extension_fault() {
        let begin = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let cancel = CancellationToken::new();
        let reader = DataSourceReader::new(Arc::new(FailingSource), None, allocator(1 << 20), 0.99);

        let (tx, _rx) = pipe(1024, cancel.clone());
        let request = CatalogItemRequest::original(item(1, RepresentationKind::Original), SourceRegistration::new("x"));

        let result = reader
            .read(begin, begin + chrono::TimeDelta::seconds(10), vec![(request, tx)], &cancel)
            .await;
        assert!(matches!(result, Err(Error::Pipeline(PipelineError::Extension(_)))));
    }

    #[test]
    fn test_lcm() {
        assert_eq!(lcm(4, 6), 12);
        assert_eq!(lcm(1, 1_000_000_000), 1_000_000_000);
    }
}
