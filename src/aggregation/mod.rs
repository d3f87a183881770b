//! Resampling and aggregation engine
//!
//! Pure numeric transforms from a raw source buffer (little-endian elements
//! plus one status byte per element) to doubles:
//!
//! - [`decode`]: element-wise conversion, invalid samples become NaN
//! - [`resample`]: upsampling by integer block replication, no interpolation
//! - [`aggregate`]: block reduction with a quality gate
//!
//! # Quality Gate
//!
//! ```text
//! valid_count / block_size >= nan_threshold   -> reduce the block
//! otherwise (or no valid sample at all)      -> NaN
//! ```
//!
//! Output indices are independent and computed in parallel with rayon.
//!
//! # Example
//!
//! ```rust
//! use nexus_engine::aggregation::aggregate;
//! use nexus_engine::types::{NexusDataType, RepresentationKind};
//!
//! let data: Vec<u8> = [1.0f64, 2.0, 3.0, 4.0]
//!     .iter()
//!     .flat_map(|v| v.to_le_bytes())
//!     .collect();
//! let status = vec![1u8; 4];
//! let mut target = vec![0.0; 2];
//!
//! aggregate(
//!     RepresentationKind::Sum,
//!     NexusDataType::FLOAT64,
//!     &data,
//!     &status,
//!     2,
//!     0.99,
//!     &mut target,
//! )
//! .unwrap();
//!
//! assert_eq!(target, vec![3.0, 7.0]);
//! ```

pub mod functions;

use crate::error::AggregationError;
use crate::types::{NexusDataType, RepresentationKind};
use rayon::prelude::*;

/// Decode a raw buffer into doubles; a status byte other than `1` yields NaN
pub fn decode(
    data_type: NexusDataType,
    data: &[u8],
    status: &[u8],
) -> Result<Vec<f64>, AggregationError> {
    check_lengths(data_type, data, status)?;
    let element_size = data_type.element_size();

    Ok(data
        .par_chunks_exact(element_size)
        .zip(status.par_iter())
        .map(|(bytes, &s)| {
            if s == 1 {
                functions::decode_element(data_type, bytes)
            } else {
                f64::NAN
            }
        })
        .collect())
}

/// Nearest-block upsampling: `target[i] = source[(i + offset) / block_size]`
pub fn resample(
    source: &[f64],
    block_size: usize,
    offset: usize,
    target: &mut [f64],
) -> Result<(), AggregationError> {
    if block_size == 0 {
        return Err(AggregationError::InvalidBlockSize(block_size));
    }

    if let Some(last) = target.len().checked_sub(1) {
        let needed = (last + offset) / block_size + 1;
        if needed > source.len() {
            return Err(AggregationError::LengthMismatch(format!(
                "resampling {} values with offset {} needs {} source values, got {}",
                target.len(),
                offset,
                needed,
                source.len()
            )));
        }
    }

    target.par_iter_mut().enumerate().for_each(|(i, value)| {
        *value = source[(i + offset) / block_size];
    });

    Ok(())
}

/// Reduce consecutive blocks of `block_size` raw samples into `target`
///
/// `status` must hold at least `target.len() * block_size` entries and `data`
/// one element per status byte.
pub fn aggregate(
    kind: RepresentationKind,
    data_type: NexusDataType,
    data: &[u8],
    status: &[u8],
    block_size: usize,
    nan_threshold: f64,
    target: &mut [f64],
) -> Result<(), AggregationError> {
    if block_size == 0 {
        return Err(AggregationError::InvalidBlockSize(block_size));
    }
    check_lengths(data_type, data, status)?;

    if target.len() * block_size > status.len() {
        return Err(AggregationError::LengthMismatch(format!(
            "{} blocks of {} samples need {} source values, got {}",
            target.len(),
            block_size,
            target.len() * block_size,
            status.len()
        )));
    }

    let high_quality = |block_status: &[u8]| {
        let valid = block_status.iter().filter(|&&s| s == 1).count();
        valid > 0 && valid as f64 / block_size as f64 >= nan_threshold
    };

    match kind {
        RepresentationKind::MinBitwise | RepresentationKind::MaxBitwise => {
            if data_type.is_float() {
                return Err(AggregationError::UnsupportedRepresentationKind(format!(
                    "{} on {:?}",
                    kind, data_type
                )));
            }

            let element_size = data_type.element_size();

            target.par_iter_mut().enumerate().for_each(|(x, value)| {
                let block_status = &status[x * block_size..(x + 1) * block_size];
                let block_data = &data[x * block_size * element_size..(x + 1) * block_size * element_size];

                if !high_quality(block_status) {
                    *value = f64::NAN;
                    return;
                }

                let bits = block_data
                    .chunks_exact(element_size)
                    .zip(block_status)
                    .filter(|(_, &s)| s == 1)
                    .map(|(bytes, _)| functions::decode_bits(data_type, bytes));

                let reduced = if kind == RepresentationKind::MinBitwise {
                    functions::and_bits(bits)
                } else {
                    functions::or_bits(bits)
                };

                *value = reduced
                    .map(|bits| functions::bits_to_f64(data_type, bits))
                    .unwrap_or(f64::NAN);
            });
        }

        kind if kind.is_aggregation() => {
            let values = decode(data_type, data, status)?;

            target.par_iter_mut().enumerate().for_each(|(x, value)| {
                let block_status = &status[x * block_size..(x + 1) * block_size];
                let block_values = &values[x * block_size..(x + 1) * block_size];

                *value = if high_quality(block_status) {
                    functions::reduce(kind, block_values, block_status).unwrap_or(f64::NAN)
                } else {
                    f64::NAN
                };
            });
        }

        other => {
            return Err(AggregationError::UnsupportedRepresentationKind(
                other.to_string(),
            ))
        }
    }

    Ok(())
}

fn check_lengths(
    data_type: NexusDataType,
    data: &[u8],
    status: &[u8],
) -> Result<(), AggregationError> {
    if data.len() != status.len() * data_type.element_size() {
        return Err(AggregationError::LengthMismatch(format!(
            "{} data bytes for {} {:?} elements",
            data.len(),
            status.len(),
            data_type
        )));
    }
    Ok(())
}
