//! Bucket file format
//!
//! A bucket file holds one bucket period of `f64` samples at a fixed sample
//! period plus the list of sub-ranges that actually contain cached data.
//!
//! # Binary Layout
//!
//! ```text
//! Offset        | Size        | Field
//! --------------|-------------|------------------------------
//!   0           |  4          | magic "NXC1"
//!   4           |  2          | version
//!   6           |  2          | reserved
//!   8           |  8          | bucket_begin (ns since epoch)
//!  16           |  8          | bucket_period (ns)
//!  24           |  8          | sample_period (ns)
//!  32           |  16         | reserved
//!  48           |  8 * n      | samples, n = bucket_period / sample_period
//!  48 + 8n      |  4          | interval count
//!  52 + 8n      |  16 * count | (begin, end) pairs, bucket-relative ns
//!  ...          |  8          | CRC-64/ECMA-182 of count + pairs
//! ```

use crate::error::CacheError;
use crate::interval::{consolidate, to_nanos, Interval, PeriodSlice};
use crc::{Crc, CRC_64_ECMA_182};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Magic bytes identifying a bucket file
pub const BUCKET_MAGIC: [u8; 4] = *b"NXC1";

/// Current bucket format version
pub const BUCKET_VERSION: u16 = 1;

/// Size of the fixed header in bytes
pub const HEADER_SIZE: u64 = 48;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);
const SAMPLE_SIZE: u64 = 8;

/// Open bucket writers of this process, keyed by file path
pub type WriterRegistry = Arc<DashMap<PathBuf, ()>>;

// =============================================================================
// Header
// =============================================================================

/// Fixed header at the start of every bucket file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketHeader {
    /// Format version
    pub version: u16,
    /// Bucket start (ns since epoch)
    pub bucket_begin: i64,
    /// Bucket length (ns)
    pub bucket_period: i64,
    /// Sample period (ns)
    pub sample_period: i64,
}

impl BucketHeader {
    /// Header for a new bucket file
    pub fn new(bucket_begin: i64, bucket_period: i64, sample_period: i64) -> Self {
        Self {
            version: BUCKET_VERSION,
            bucket_begin,
            bucket_period,
            sample_period,
        }
    }

    /// Number of samples in the data region
    pub fn sample_count(&self) -> u64 {
        (self.bucket_period / self.sample_period) as u64
    }

    /// Offset of the trailer
    pub fn data_end(&self) -> u64 {
        HEADER_SIZE + self.sample_count() * SAMPLE_SIZE
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; 48] {
        let mut bytes = [0u8; 48];

        bytes[0..4].copy_from_slice(&BUCKET_MAGIC);
        bytes[4..6].copy_from_slice(&self.version.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.bucket_begin.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.bucket_period.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.sample_period.to_le_bytes());

        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < HEADER_SIZE as usize {
            return Err(format!(
                "Invalid header size: {} bytes (expected {})",
                bytes.len(),
                HEADER_SIZE
            ));
        }

        if bytes[0..4] != BUCKET_MAGIC {
            return Err(format!("Invalid magic: {:?}", &bytes[0..4]));
        }

        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != BUCKET_VERSION {
            return Err(format!("Unsupported version: {}", version));
        }

        Ok(Self {
            version,
            bucket_begin: read_i64(&bytes[8..16]),
            bucket_period: read_i64(&bytes[16..24]),
            sample_period: read_i64(&bytes[24..32]),
        })
    }
}

fn read_i64(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    i64::from_le_bytes(buf)
}

// =============================================================================
// Trailer
// =============================================================================

fn encode_trailer(header: &BucketHeader, cached: &[Interval]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + cached.len() * 16 + 8);

    bytes.extend_from_slice(&(cached.len() as u32).to_le_bytes());
    for interval in cached {
        bytes.extend_from_slice(&(to_nanos(interval.begin) - header.bucket_begin).to_le_bytes());
        bytes.extend_from_slice(&(to_nanos(interval.end) - header.bucket_begin).to_le_bytes());
    }

    let checksum = CRC64.checksum(&bytes);
    bytes.extend_from_slice(&checksum.to_le_bytes());
    bytes
}

fn decode_trailer(header: &BucketHeader, bytes: &[u8]) -> Result<Vec<Interval>, String> {
    if bytes.len() < 12 {
        return Err(format!("Trailer too short: {} bytes", bytes.len()));
    }

    let count = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let expected = 4 + count * 16 + 8;
    if bytes.len() != expected {
        return Err(format!(
            "Trailer size mismatch: {} bytes (expected {})",
            bytes.len(),
            expected
        ));
    }

    let payload = &bytes[..expected - 8];
    let stored = u64::from_le_bytes([
        bytes[expected - 8],
        bytes[expected - 7],
        bytes[expected - 6],
        bytes[expected - 5],
        bytes[expected - 4],
        bytes[expected - 3],
        bytes[expected - 2],
        bytes[expected - 1],
    ]);
    let computed = CRC64.checksum(payload);
    if stored != computed {
        return Err(format!(
            "Checksum mismatch: stored {:016x}, computed {:016x}",
            stored, computed
        ));
    }

    let mut cached = Vec::with_capacity(count);
    for pair in payload[4..].chunks_exact(16) {
        let begin = read_i64(&pair[0..8]);
        let end = read_i64(&pair[8..16]);

        if begin < 0 || end < begin || end > header.bucket_period {
            return Err(format!("Interval [{}, {}) outside of bucket", begin, end));
        }

        cached.push(Interval::from_nanos(
            header.bucket_begin + begin,
            header.bucket_begin + end,
        ));
    }

    Ok(cached)
}

async fn read_layout(
    file: &mut File,
    path: &Path,
    expected: &BucketHeader,
) -> Result<Vec<Interval>, CacheError> {
    let corrupt = |reason: String| CacheError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let mut header_bytes = [0u8; HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0)).await?;
    file.read_exact(&mut header_bytes)
        .await
        .map_err(|e| corrupt(format!("Failed to read header: {}", e)))?;

    let header = BucketHeader::from_bytes(&header_bytes).map_err(corrupt)?;
    if header != *expected {
        return Err(corrupt(format!(
            "Header mismatch: found {:?}, expected {:?}",
            header, expected
        )));
    }

    let length = file.metadata().await?.len();
    if length < header.data_end() {
        return Err(corrupt(format!("File truncated at {} bytes", length)));
    }

    let mut trailer = Vec::with_capacity((length - header.data_end()) as usize);
    file.seek(SeekFrom::Start(header.data_end())).await?;
    file.read_to_end(&mut trailer).await?;

    decode_trailer(&header, &trailer).map_err(corrupt)
}

fn slice_interval(slice: &PeriodSlice) -> Interval {
    Interval::from_nanos(slice.begin(), slice.end())
}

// =============================================================================
// Reader
// =============================================================================

/// Read-only view of one bucket file
#[derive(Debug)]
pub struct BucketReader {
    file: File,
    header: BucketHeader,
    cached: Vec<Interval>,
}

impl BucketReader {
    /// Open and validate an existing bucket file
    pub async fn open(path: &Path, expected: BucketHeader) -> Result<Self, CacheError> {
        let mut file = File::open(path).await?;
        let cached = read_layout(&mut file, path, &expected).await?;

        Ok(Self {
            file,
            header: expected,
            cached,
        })
    }

    /// Sub-ranges of this bucket holding cached data
    pub fn cached(&self) -> &[Interval] {
        &self.cached
    }

    /// Copy the samples of `slice` into `target` and return the parts of
    /// `slice` that are not cached
    pub async fn read(
        &mut self,
        slice: &PeriodSlice,
        target: &mut [f64],
    ) -> Result<Vec<Interval>, CacheError> {
        let requested = slice_interval(slice);
        let missing = requested.difference(&self.cached);

        // nothing cached in this slice
        if missing.len() == 1 && missing[0] == requested {
            return Ok(missing);
        }

        let first = (slice.offset / self.header.sample_period) as u64;
        let mut bytes = vec![0u8; target.len() * SAMPLE_SIZE as usize];

        self.file
            .seek(SeekFrom::Start(HEADER_SIZE + first * SAMPLE_SIZE))
            .await?;
        self.file.read_exact(&mut bytes).await?;

        for (value, chunk) in target.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(chunk);
            *value = f64::from_le_bytes(buf);
        }

        Ok(missing)
    }
}

// =============================================================================
// Writer
// =============================================================================

struct WriterGuard {
    registry: WriterRegistry,
    path: PathBuf,
}

impl WriterGuard {
    fn acquire(registry: &WriterRegistry, path: &Path) -> Result<Self, CacheError> {
        match registry.entry(path.to_path_buf()) {
            Entry::Occupied(_) => Err(CacheError::InUse(path.to_path_buf())),
            Entry::Vacant(entry) => {
                entry.insert(());
                Ok(Self {
                    registry: Arc::clone(registry),
                    path: path.to_path_buf(),
                })
            }
        }
    }
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.path);
    }
}

/// Exclusive writer of one bucket file
pub struct BucketWriter {
    file: File,
    header: BucketHeader,
    cached: Vec<Interval>,
    _guard: WriterGuard,
}

impl BucketWriter {
    /// Open a bucket file for writing, creating it if necessary
    ///
    /// Fails with `InUse` if another writer of this process holds the file.
    pub async fn open(
        path: &Path,
        header: BucketHeader,
        registry: &WriterRegistry,
    ) -> Result<Self, CacheError> {
        let guard = WriterGuard::acquire(registry, path)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;

        let cached = if file.metadata().await?.len() == 0 {
            file.write_all(&header.to_bytes()).await?;
            file.set_len(header.data_end()).await?;
            Vec::new()
        } else {
            read_layout(&mut file, path, &header).await?
        };

        let mut writer = Self {
            file,
            header,
            cached,
            _guard: guard,
        };
        writer.write_trailer().await?;
        Ok(writer)
    }

    /// Store the samples of `slice` and mark it as cached
    pub async fn write(&mut self, slice: &PeriodSlice, source: &[f64]) -> Result<(), CacheError> {
        let first = (slice.offset / self.header.sample_period) as u64;

        let mut bytes = Vec::with_capacity(source.len() * SAMPLE_SIZE as usize);
        for value in source {
            bytes.extend_from_slice(&value.to_le_bytes());
        }

        self.file
            .seek(SeekFrom::Start(HEADER_SIZE + first * SAMPLE_SIZE))
            .await?;
        self.file.write_all(&bytes).await?;

        let mut cached = std::mem::take(&mut self.cached);
        cached.push(slice_interval(slice));
        self.cached = consolidate(cached);

        self.write_trailer().await
    }

    /// Flush all pending writes and release the file
    pub async fn finish(mut self) -> Result<(), CacheError> {
        self.file.flush().await?;
        Ok(())
    }

    async fn write_trailer(&mut self) -> Result<(), CacheError> {
        let trailer = encode_trailer(&self.header, &self.cached);

        self.file
            .seek(SeekFrom::Start(self.header.data_end()))
            .await?;
        self.file.write_all(&trailer).await?;
        self.file
            .set_len(self.header.data_end() + trailer.len() as u64)
            .await?;
        self.file.flush().await?;
        Ok(())
    }
}
