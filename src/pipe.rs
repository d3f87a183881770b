//! Bounded byte pipe between a reading task and its consumer
//!
//! One pipe carries the doubles of one catalog item. The writer suspends
//! while the pipe is full and the reader while it is empty; completing or
//! dropping the writer signals end of stream. Every wait observes the pipe's
//! cancellation token.

use crate::error::{PipelineError, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;

const SAMPLE_SIZE: usize = std::mem::size_of::<f64>();
const DRAIN_BUFFER_SIZE: usize = 8 * 1024;

/// Create a pipe holding at most `capacity` bytes in flight
pub fn pipe(capacity: usize, cancel: CancellationToken) -> (PipeWriter, PipeReader) {
    let (writer, reader) = tokio::io::duplex(capacity.max(SAMPLE_SIZE));

    (
        PipeWriter {
            stream: writer,
            cancel: cancel.clone(),
            written: 0,
        },
        PipeReader {
            stream: reader,
            cancel,
            read: 0,
        },
    )
}

/// Sending half of a pipe
#[derive(Debug)]
pub struct PipeWriter {
    stream: DuplexStream,
    cancel: CancellationToken,
    written: u64,
}

impl PipeWriter {
    /// Append doubles, suspending while the pipe is full
    pub async fn write_f64s(&mut self, values: &[f64]) -> Result<()> {
        let mut bytes = Vec::with_capacity(values.len() * SAMPLE_SIZE);
        for value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled.into()),
            result = self.stream.write_all(&bytes) => {
                result.map_err(|e| PipelineError::PipeClosed(e.to_string()))?;
                self.written += bytes.len() as u64;
                Ok(())
            }
        }
    }

    /// Bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Signal end of stream
    pub async fn complete(mut self) -> Result<()> {
        self.stream
            .shutdown()
            .await
            .map_err(|e| PipelineError::PipeClosed(e.to_string()).into())
    }
}

/// Receiving half of a pipe
#[derive(Debug)]
pub struct PipeReader {
    stream: DuplexStream,
    cancel: CancellationToken,
    read: u64,
}

impl PipeReader {
    /// Read exactly `count` doubles
    ///
    /// Returns `None` if the stream ended cleanly before the first byte and
    /// fails with `UnexpectedEndOfStream` if it ended part way.
    pub async fn read_f64s(&mut self, count: usize) -> Result<Option<Vec<f64>>> {
        let expected = count * SAMPLE_SIZE;
        let mut bytes = vec![0u8; expected];
        let mut filled = 0;

        while filled < expected {
            let n = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(PipelineError::Cancelled.into()),
                result = self.stream.read(&mut bytes[filled..]) => {
                    result.map_err(|e| PipelineError::PipeClosed(e.to_string()))?
                }
            };

            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(PipelineError::UnexpectedEndOfStream {
                    expected,
                    actual: filled,
                }
                .into());
            }

            filled += n;
        }

        self.read += filled as u64;

        let values = bytes
            .chunks_exact(SAMPLE_SIZE)
            .map(|chunk| {
                let mut buf = [0u8; SAMPLE_SIZE];
                buf.copy_from_slice(chunk);
                f64::from_le_bytes(buf)
            })
            .collect();

        Ok(Some(values))
    }

    /// Discard everything until the writer completes; returns the bytes discarded
    pub async fn drain(&mut self) -> Result<u64> {
        let mut buffer = vec![0u8; DRAIN_BUFFER_SIZE];
        let mut drained = 0u64;

        loop {
            let n = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(PipelineError::Cancelled.into()),
                result = self.stream.read(&mut buffer) => {
                    result.map_err(|e| PipelineError::PipeClosed(e.to_string()))?
                }
            };

            if n == 0 {
                self.read += drained;
                return Ok(drained);
            }
            drained += n as u64;
        }
    }

    /// Bytes read so far
    pub fn bytes_read(&self) -> u64 {
        self.read
    }
}
