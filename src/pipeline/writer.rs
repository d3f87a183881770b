//! Data writer capability and the controller driving it

use crate::error::{PipelineError, Result};
use crate::interval::{from_nanos, to_nanos, PeriodAnchor, PeriodIter, PeriodSlice};
use crate::pipe::PipeReader;
use crate::types::{CatalogItem, SamplePeriod};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::future::try_join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Receives the written fraction of an export, `0.0..=1.0`
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Decoded values of one item for one write call
#[derive(Debug, Clone)]
pub struct WriteRequest {
    /// Item the values belong to
    pub item: CatalogItem,
    /// One double per sample
    pub data: Vec<f64>,
}

/// A sink producing export files
///
/// Invoked as `open` → `write`* → `close` once per output file.
#[async_trait]
pub trait DataWriter: Send {
    /// Start a new file
    async fn open(
        &mut self,
        file_begin: DateTime<Utc>,
        file_period: TimeDelta,
        sample_period: SamplePeriod,
        items: &[CatalogItem],
    ) -> Result<()>;

    /// Append one chunk per item at `file_offset` from the file start
    async fn write(
        &mut self,
        file_offset: TimeDelta,
        requests: &[WriteRequest],
        progress: f64,
    ) -> Result<()>;

    /// Finish the current file
    async fn close(&mut self) -> Result<()>;
}

/// Consumes all item pipes in lock-step and feeds a [`DataWriter`]
pub struct DataWriterController {
    writer: Box<dyn DataWriter>,
    write_buffer_samples: usize,
}

impl DataWriterController {
    /// Create a controller writing at most `write_buffer_samples` per item and call
    pub fn new(writer: Box<dyn DataWriter>, write_buffer_samples: usize) -> Self {
        Self {
            writer,
            write_buffer_samples: write_buffer_samples.max(1),
        }
    }

    /// Write `[begin, end)`, cutting a new file every `file_period`
    ///
    /// A zero file period produces a single file for the whole range.
    #[allow(clippy::too_many_arguments)]
    pub async fn write(
        mut self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
        sample_period: SamplePeriod,
        file_period: TimeDelta,
        mut inputs: Vec<(CatalogItem, PipeReader)>,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let begin_ns = to_nanos(begin);
        let end_ns = to_nanos(end);
        let sp = sample_period.as_nanos();

        let file_period_ns = file_period.num_nanoseconds().unwrap_or(0);
        let period = if file_period_ns > 0 {
            file_period_ns
        } else {
            end_ns - begin_ns
        };

        let total_samples = ((end_ns - begin_ns) / sp).max(1) as usize;
        let items: Vec<CatalogItem> = inputs.iter().map(|(item, _)| item.clone()).collect();
        let mut written = 0usize;

        for slice in PeriodIter::new(begin_ns, end_ns, period, PeriodAnchor::Request) {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled.into());
            }

            let file_begin = from_nanos(slice.period_begin);
            debug!(file_begin = %file_begin, "Opening export file");

            self.writer
                .open(file_begin, TimeDelta::nanoseconds(period), sample_period, &items)
                .await?;

            let file = self
                .write_file(&slice, sample_period, &mut inputs, total_samples, &mut written, &progress)
                .await;

            // the open file is closed on every exit path, the first error wins
            let closed = self.writer.close().await;
            file?;
            closed?;
        }

        Ok(())
    }

    async fn write_file(
        &mut self,
        slice: &PeriodSlice,
        sample_period: SamplePeriod,
        inputs: &mut [(CatalogItem, PipeReader)],
        total_samples: usize,
        written: &mut usize,
        progress: &Option<ProgressCallback>,
    ) -> Result<()> {
        let sp = sample_period.as_nanos();
        let slice_samples = (slice.duration / sp) as usize;
        let mut done = 0usize;

        while done < slice_samples {
            let count = self.write_buffer_samples.min(slice_samples - done);

            // all pipes are read together, a blocked item must not stall the others
            let requests = try_join_all(inputs.iter_mut().map(|(item, reader)| async move {
                let data = reader.read_f64s(count).await?.ok_or(
                    PipelineError::UnexpectedEndOfStream {
                        expected: count * std::mem::size_of::<f64>(),
                        actual: 0,
                    },
                )?;

                Ok::<_, crate::error::Error>(WriteRequest {
                    item: item.clone(),
                    data,
                })
            }))
            .await?;

            *written += count;
            let fraction = *written as f64 / total_samples as f64;
            let file_offset = TimeDelta::nanoseconds(slice.offset + done as i64 * sp);

            self.writer.write(file_offset, &requests, fraction).await?;

            if let Some(progress) = progress {
                progress(fraction);
            }

            done += count;
        }

        Ok(())
    }
}

/// Consume every pipe without writing anything
pub async fn drain_all(readers: Vec<PipeReader>) -> Result<u64> {
    let drained = try_join_all(readers.into_iter().map(|mut reader| async move {
        reader.drain().await
    }))
    .await?;

    Ok(drained.into_iter().sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::pipe;
    use crate::types::{NexusDataType, Representation, RepresentationKind};
    use chrono::TimeZone;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorded {
        opened: Vec<DateTime<Utc>>,
        chunks: Vec<(TimeDelta, usize)>,
        closed: usize,
    }

    struct RecordingWriter(Arc<Mutex<Recorded>>);

    #[async_trait]
    impl DataWriter for RecordingWriter {
        async fn open(
            &mut self,
            file_begin: DateTime<Utc>,
            _file_period: TimeDelta,
            _sample_period: SamplePeriod,
            _items: &[CatalogItem],
        ) -> Result<()> {
            self.0.lock().opened.push(file_begin);
            Ok(())
        }

        async fn write(&mut self, file_offset: TimeDelta, requests: &[WriteRequest], _progress: f64) -> Result<()> {
            self.0.lock().chunks.push((file_offset, requests[0].data.len()));
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.0.lock().closed += 1;
            Ok(())
        }
    }

    fn item() -> CatalogItem {
        let representation = Representation::new(
            NexusDataType::FLOAT64,
            SamplePeriod::from_secs(1).unwrap(),
            RepresentationKind::Original,
        );
        CatalogItem::new("/A", "T1", representation, None).unwrap()
    }

    #[tokio::test]
    async fn test_file_cutting_and_chunking() {
        let cancel = CancellationToken::new();
        let (mut tx, rx) = pipe(1024, cancel.clone());
        let recorded = Arc::new(Mutex::new(Recorded::default()));

        let producer = tokio::spawn(async move {
            tx.write_f64s(&vec![1.0; 10]).await.unwrap();
            tx.complete().await.unwrap();
        });

        let begin = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let controller = DataWriterController::new(Box::new(RecordingWriter(Arc::clone(&recorded))), 4);

        controller
            .write(
                begin,
                begin + TimeDelta::seconds(10),
                SamplePeriod::from_secs(1).unwrap(),
                TimeDelta::seconds(5),
                vec![(item(), rx)],
                None,
                &cancel,
            )
            .await
            .unwrap();
        producer.await.unwrap();

        let recorded = recorded.lock();
        assert_eq!(recorded.opened, vec![begin, begin + TimeDelta::seconds(5)]);
        assert_eq!(recorded.closed, 2);
        assert_eq!(
            recorded.chunks,
            vec![
                (TimeDelta::zero(), 4),
                (TimeDelta::seconds(4), 1),
                (TimeDelta::zero(), 4),
                (TimeDelta::seconds(4), 1),
            ]
        );
    }

    #[tokio::test]
    async fn test_short_stream_fails() {
        let cancel = CancellationToken::new();
        let (mut tx, rx) = pipe(1024, cancel.clone());
        tx.write_f64s(&[1.0; 3]).await.unwrap();
        tx.complete().await.unwrap();

        let begin = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let controller = DataWriterController::new(Box::new(RecordingWriter(recorded)), 3);

        let result = controller
            .write(
                begin,
                begin + TimeDelta::seconds(6),
                SamplePeriod::from_secs(1).unwrap(),
                TimeDelta::zero(),
                vec![(item(), rx)],
                None,
                &cancel,
            )
            .await;

        assert!(matches!(
            result,
            Err(crate::error::Error::Pipeline(PipelineError::UnexpectedEndOfStream { .. }))
        ));
    }

    struct DiskFullWriter(Arc<Mutex<Recorded>>);

    #[async_trait]
    impl DataWriter for DiskFullWriter {
        async fn open(
            &mut self,
            file_begin: DateTime<Utc>,
            _file_period: TimeDelta,
            _sample_period: SamplePeriod,
            _items: &[CatalogItem],
        ) -> Result<()> {
            self.0.lock().opened.push(file_begin);
            Ok(())
        }

        async fn write(&mut self, _file_offset: TimeDelta, _requests: &[WriteRequest], _progress: f64) -> Result<()> {
            Err(crate::error::Error::extension("disk full"))
        }

        async fn close(&mut self) -> Result<()> {
            self.0.lock().closed += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_write_closes_file() {
        let cancel = CancellationToken::new();
        let (mut tx, rx) = pipe(1024, cancel.clone());
        tx.write_f64s(&[1.0; 4]).await.unwrap();
        tx.complete().await.unwrap();

        let begin = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let controller = DataWriterController::new(Box::new(DiskFullWriter(Arc::clone(&recorded))), 2);

        let result = controller
            .write(
                begin,
                begin + TimeDelta::seconds(4),
                SamplePeriod::from_secs(1).unwrap(),
                TimeDelta::zero(),
                vec![(item(), rx)],
                None,
                &cancel,
            )
            .await;

        assert!(matches!(
            result,
            Err(crate::error::Error::Pipeline(PipelineError::Extension(ref message))) if message == "disk full"
        ));

        let recorded = recorded.lock();
        assert_eq!(recorded.opened.len(), 1);
        assert_eq!(recorded.closed, 1);
    }

    #[tokio::test]
    async fn test_short_stream_closes_file() {
        let cancel = CancellationToken::new();
        let (mut tx, rx) = pipe(1024, cancel.clone());
        tx.write_f64s(&[1.0; 2]).await.unwrap();
        tx.complete().await.unwrap();

        let begin = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let controller = DataWriterController::new(Box::new(RecordingWriter(Arc::clone(&recorded))), 2);

        let result = controller
            .write(
                begin,
                begin + TimeDelta::seconds(4),
                SamplePeriod::from_secs(1).unwrap(),
                TimeDelta::seconds(2),
                vec![(item(), rx)],
                None,
                &cancel,
            )
            .await;

        assert!(result.is_err());
        let recorded = recorded.lock();
        assert_eq!(recorded.opened.len(), 2);
        assert_eq!(recorded.closed, 2);
    }

    #[tokio::test]
    async fn test_drain_all() {
        let cancel = CancellationToken::new();
        let (mut a_tx, a_rx) = pipe(16, cancel.clone());
        let (mut b_tx, b_rx) = pipe(16, cancel.clone());

        let producer = tokio::spawn(async move {
            a_tx.write_f64s(&[1.0; 10]).await.unwrap();
            a_tx.complete().await.unwrap();
            b_tx.write_f64s(&[2.0; 5]).await.unwrap();
            b_tx.complete().await.unwrap();
        });

        assert_eq!(drain_all(vec![a_rx, b_rx]).await.unwrap(), 120);
        producer.await.unwrap();
    }
}
