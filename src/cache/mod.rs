//! Time-bucketed on-disk cache for derived representations
//!
//! Each catalog item is cached in bucket files of a fixed duration that is
//! chosen from its sample period (see [`bucket_period`]). Reads report which
//! sub-ranges could not be served so that only those are fetched from the
//! data source; writes fill exactly those gaps afterwards.
//!
//! Read and write failures never reach the caller: a broken or busy bucket is
//! a cache miss on read and a skipped bucket on write. Only a clear that
//! cannot delete a file within its retry window is reported.
//!
//! # Example
//!
//! ```rust,ignore
//! let cache = CacheService::with_root("/var/cache/nexus");
//!
//! let mut values = vec![0.0; 120];
//! let uncached = cache.read(&item, begin, &mut values).await?;
//! // fetch `uncached` from the source into `values` ...
//! cache.write(&item, begin, &values, &uncached).await?;
//! ```

pub mod bucket;
pub mod path;

pub use bucket::{BucketHeader, BucketReader, BucketWriter, WriterRegistry};

use crate::config::CacheConfig;
use crate::error::{CacheError, Error, PipelineError, Result};
use crate::interval::{consolidate, from_nanos, round_down, to_nanos, Interval, PeriodAnchor, PeriodIter, PeriodSlice};
use crate::metrics;
use crate::types::{physical_catalog_id, CatalogItem, SamplePeriod, NANOS_PER_DAY};
use chrono::{DateTime, TimeDelta, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const NANOS_PER_MILLI: i64 = 1_000_000;
const NANOS_PER_SECOND: i64 = 1_000_000_000;
const NANOS_PER_HOUR: i64 = 3_600 * NANOS_PER_SECOND;

/// Bucket length for a sample period
///
/// | sample period | bucket period |
/// |---------------|---------------|
/// | <= 1 ns       | 1 ms          |
/// | <= 1 us       | 1 s           |
/// | <= 1 ms       | 1 h           |
/// | otherwise     | 1 day         |
///
/// The sample period must evenly divide both a day and the chosen bucket.
pub fn bucket_period(sample_period: SamplePeriod) -> std::result::Result<i64, CacheError> {
    let sample_period = sample_period.as_nanos();

    if sample_period > NANOS_PER_DAY || NANOS_PER_DAY % sample_period != 0 {
        return Err(CacheError::UnsupportedSamplePeriod(sample_period));
    }

    let bucket_period = if sample_period <= 1 {
        NANOS_PER_MILLI
    } else if sample_period <= 1_000 {
        NANOS_PER_SECOND
    } else if sample_period <= NANOS_PER_MILLI {
        NANOS_PER_HOUR
    } else {
        NANOS_PER_DAY
    };

    if bucket_period % sample_period != 0 {
        return Err(CacheError::UnsupportedSamplePeriod(sample_period));
    }

    Ok(bucket_period)
}

/// Cache store rooted at one directory
///
/// Cloning is cheap; clones share the registry of open bucket writers.
#[derive(Clone)]
pub struct CacheService {
    root: PathBuf,
    clear_timeout: Duration,
    clear_poll_interval: Duration,
    writers: WriterRegistry,
}

impl CacheService {
    /// Create a cache store from configuration
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            root: config.directory.clone(),
            clear_timeout: config.clear_timeout(),
            clear_poll_interval: config.clear_poll_interval(),
            writers: WriterRegistry::default(),
        }
    }

    /// Create a cache store with default retry settings
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self::new(&CacheConfig {
            directory: root.into(),
            ..CacheConfig::default()
        })
    }

    /// Override the delete retry window and interval
    pub fn with_clear_timeout(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.clear_timeout = timeout;
        self.clear_poll_interval = poll_interval;
        self
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fill `target` from the cache, starting at `begin`
    ///
    /// Returns the consolidated list of sub-ranges that were not cached; the
    /// matching parts of `target` are left in an unspecified state.
    pub async fn read(
        &self,
        item: &CatalogItem,
        begin: DateTime<Utc>,
        target: &mut [f64],
    ) -> Result<Vec<Interval>> {
        let sample_period = item.representation.sample_period.as_nanos();
        let bucket_period = bucket_period(item.representation.sample_period)?;
        let begin_ns = to_nanos(begin);
        let end_ns = begin_ns + sample_period * target.len() as i64;

        let mut uncached = Vec::new();

        for slice in PeriodIter::new(begin_ns, end_ns, bucket_period, PeriodAnchor::Aligned) {
            let requested = Interval::from_nanos(slice.begin(), slice.end());
            let first = ((slice.begin() - begin_ns) / sample_period) as usize;
            let count = (slice.duration / sample_period) as usize;

            let Some(target_slice) = target.get_mut(first..first + count) else {
                uncached.push(requested);
                continue;
            };

            let path = path::bucket_path(&self.root, item, from_nanos(slice.period_begin));
            let header = BucketHeader::new(slice.period_begin, bucket_period, sample_period);

            match read_bucket(&path, header, &slice, target_slice).await {
                Ok(missing) => {
                    let outcome = if missing.is_empty() {
                        "hit"
                    } else if missing.len() == 1 && missing[0] == requested {
                        "miss"
                    } else {
                        "partial"
                    };
                    metrics::record_cache_read(outcome);
                    uncached.extend(missing);
                }
                Err(CacheError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                    metrics::record_cache_read("miss");
                    uncached.push(requested);
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Cache bucket unreadable, treating as miss");
                    metrics::record_cache_read("error");
                    uncached.push(requested);
                }
            }
        }

        Ok(consolidate(uncached))
    }

    /// Store the parts of `source` (starting at `begin`) listed in `uncached`
    ///
    /// Buckets that cannot be written are skipped.
    pub async fn write(
        &self,
        item: &CatalogItem,
        begin: DateTime<Utc>,
        source: &[f64],
        uncached: &[Interval],
    ) -> Result<()> {
        let sample_period = item.representation.sample_period.as_nanos();
        let bucket_period = bucket_period(item.representation.sample_period)?;
        let begin_ns = to_nanos(begin);
        let end_ns = begin_ns + sample_period * source.len() as i64;

        for interval in uncached {
            let interval_begin = to_nanos(interval.begin).max(begin_ns);
            let interval_end = to_nanos(interval.end).min(end_ns);

            for slice in PeriodIter::new(interval_begin, interval_end, bucket_period, PeriodAnchor::Aligned) {
                let first = ((slice.begin() - begin_ns) / sample_period) as usize;
                let count = (slice.duration / sample_period) as usize;

                let Some(data) = source.get(first..first + count) else {
                    continue;
                };

                let path = path::bucket_path(&self.root, item, from_nanos(slice.period_begin));
                let header = BucketHeader::new(slice.period_begin, bucket_period, sample_period);

                match self.write_bucket(&path, header, &slice, data).await {
                    Ok(()) => metrics::record_cache_write("success"),
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "Skipping cache bucket");
                        metrics::record_cache_write("skipped");
                    }
                }
            }
        }

        Ok(())
    }

    async fn write_bucket(
        &self,
        path: &Path,
        header: BucketHeader,
        slice: &PeriodSlice,
        data: &[f64],
    ) -> std::result::Result<(), CacheError> {
        let mut writer = BucketWriter::open(path, header, &self.writers).await?;
        writer.write(slice, data).await?;
        writer.finish().await
    }

    /// Delete all bucket files of a catalog starting in `[begin, end)`
    ///
    /// Files that cannot be deleted right away are retried in the background
    /// until the clear timeout elapses. Returns the number of deleted files.
    pub async fn clear_range(
        &self,
        catalog_id: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let mut retries = Vec::new();
        let scanned = self
            .delete_matching(catalog_id, begin, end, cancel, &mut retries)
            .await;

        let mut deleted = match scanned {
            Ok(deleted) => deleted,
            Err(e) => {
                for retry in &retries {
                    retry.abort();
                }
                futures::future::join_all(retries).await;
                return Err(e);
            }
        };

        let mut failure = None;
        for result in futures::future::join_all(retries).await {
            match result {
                Ok(Ok(())) => deleted += 1,
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    failure.get_or_insert(PipelineError::TaskFailed(e.to_string()).into());
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        info!(catalog = catalog_id, deleted, "Cleared cache range");
        Ok(deleted)
    }

    /// Delete matching bucket files, spawning a retry for each busy one
    async fn delete_matching(
        &self,
        catalog_id: &str,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        cancel: &CancellationToken,
        retries: &mut Vec<JoinHandle<Result<()>>>,
    ) -> Result<usize> {
        let physical = physical_catalog_id(catalog_id);
        let mut day = round_down(begin, TimeDelta::days(1));
        let mut deleted = 0;

        while day < end {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let next = day + TimeDelta::days(1);
            let full_day = begin <= day && next <= end;
            let directory = path::day_directory(&self.root, &physical, day);

            let mut entries = match tokio::fs::read_dir(&directory).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    day = next;
                    continue;
                }
                Err(e) => return Err(CacheError::Io(e).into()),
            };

            while let Some(entry) = entries.next_entry().await.map_err(CacheError::Io)? {
                let file_name = entry.file_name();
                let Some(file_name) = file_name.to_str() else {
                    continue;
                };

                let Some(bucket_begin) = path::parse_bucket_file_name(file_name) else {
                    continue;
                };

                if !full_day && !(begin <= bucket_begin && bucket_begin < end) {
                    continue;
                }

                let file = entry.path();
                match tokio::fs::remove_file(&file).await {
                    Ok(()) => {
                        deleted += 1;
                        metrics::record_cache_delete("deleted");
                    }
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(path = %file.display(), error = %e, "Cache file busy, retrying delete");
                        metrics::record_cache_delete("retried");
                        retries.push(tokio::spawn(delete_with_retry(
                            file,
                            self.clear_timeout,
                            self.clear_poll_interval,
                            cancel.clone(),
                        )));
                    }
                }
            }

            day = next;
        }

        Ok(deleted)
    }
}

async fn read_bucket(
    path: &Path,
    header: BucketHeader,
    slice: &PeriodSlice,
    target: &mut [f64],
) -> std::result::Result<Vec<Interval>, CacheError> {
    let mut reader = BucketReader::open(path, header).await?;
    reader.read(slice, target).await
}

async fn delete_with_retry(
    path: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(poll_interval) => {}
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => debug!(path = %path.display(), error = %e, "Delete retry failed"),
        }
    }

    if tokio::fs::try_exists(&path).await.unwrap_or(true) {
        metrics::record_cache_delete("timeout");
        return Err(CacheError::ClearTimeout {
            path,
            timeout_ms: timeout.as_millis() as u64,
        }
        .into());
    }

    Ok(())
}
