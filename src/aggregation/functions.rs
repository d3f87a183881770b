//! Block reduction kernels
//!
//! Each kernel reduces one block of samples to a single value. Samples whose
//! status byte is not `1` are skipped; callers apply the quality gate.

use crate::types::{NexusDataType, RepresentationKind};
use std::f64::consts::PI;

const DEGREES_TO_RADIANS: f64 = 2.0 * PI / 360.0;

// ============================================================================
// Decoding
// ============================================================================

/// Decode one little-endian element to a double
pub fn decode_element(data_type: NexusDataType, bytes: &[u8]) -> f64 {
    match data_type {
        NexusDataType::UINT8 => bytes[0] as f64,
        NexusDataType::INT8 => bytes[0] as i8 as f64,
        NexusDataType::UINT16 => u16::from_le_bytes([bytes[0], bytes[1]]) as f64,
        NexusDataType::INT16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f64,
        NexusDataType::UINT32 => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
        NexusDataType::INT32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
        NexusDataType::FLOAT32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
        NexusDataType::UINT64 => u64::from_le_bytes(eight(bytes)) as f64,
        NexusDataType::INT64 => i64::from_le_bytes(eight(bytes)) as f64,
        NexusDataType::FLOAT64 => f64::from_le_bytes(eight(bytes)),
    }
}

/// Raw bit pattern of one integer element, sign-extended for signed types
pub fn decode_bits(data_type: NexusDataType, bytes: &[u8]) -> u64 {
    match data_type {
        NexusDataType::UINT8 => bytes[0] as u64,
        NexusDataType::INT8 => bytes[0] as i8 as i64 as u64,
        NexusDataType::UINT16 => u16::from_le_bytes([bytes[0], bytes[1]]) as u64,
        NexusDataType::INT16 => i16::from_le_bytes([bytes[0], bytes[1]]) as i64 as u64,
        NexusDataType::UINT32 => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64,
        NexusDataType::INT32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64 as u64,
        NexusDataType::UINT64 | NexusDataType::INT64 => u64::from_le_bytes(eight(bytes)),
        // not reachable for bitwise kinds, rejected before reduction
        NexusDataType::FLOAT32 | NexusDataType::FLOAT64 => 0,
    }
}

/// Widen a reduced bit pattern to a double using the element's signedness
pub fn bits_to_f64(data_type: NexusDataType, bits: u64) -> f64 {
    match data_type {
        NexusDataType::INT8 | NexusDataType::INT16 | NexusDataType::INT32 | NexusDataType::INT64 => {
            bits as i64 as f64
        }
        _ => bits as f64,
    }
}

fn eight(bytes: &[u8]) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    buf
}

// ============================================================================
// Float Kernels
// ============================================================================

fn valid<'a>(values: &'a [f64], status: &'a [u8]) -> impl Iterator<Item = f64> + 'a {
    values
        .iter()
        .zip(status)
        .filter(|(_, &s)| s == 1)
        .map(|(&v, _)| v)
}

/// Sum of valid samples
pub fn sum(values: &[f64], status: &[u8]) -> f64 {
    valid(values, status).sum()
}

/// Running incremental mean
pub fn mean(values: &[f64], status: &[u8]) -> f64 {
    let mut mean = 0.0;
    let mut count = 0.0;

    for value in valid(values, status) {
        count += 1.0;
        mean += (value - mean) / count;
    }

    mean
}

/// Minimum; a NaN sample wins
pub fn min(values: &[f64], status: &[u8]) -> f64 {
    let mut result = f64::INFINITY;

    for value in valid(values, status) {
        if value.is_nan() {
            return f64::NAN;
        }
        if value < result {
            result = value;
        }
    }

    result
}

/// Maximum; a NaN sample wins
pub fn max(values: &[f64], status: &[u8]) -> f64 {
    let mut result = f64::NEG_INFINITY;

    for value in valid(values, status) {
        if value.is_nan() {
            return f64::NAN;
        }
        if value > result {
            result = value;
        }
    }

    result
}

/// Population standard deviation (Welford), NaN for fewer than two samples
pub fn std(values: &[f64], status: &[u8]) -> f64 {
    let mut count = 0.0;
    let mut mean = 0.0;
    let mut m2 = 0.0;

    for value in valid(values, status) {
        count += 1.0;
        let delta = value - mean;
        mean += delta / count;
        m2 += delta * (value - mean);
    }

    if count <= 1.0 {
        return f64::NAN;
    }

    (m2 / count).sqrt()
}

/// Root mean square
pub fn rms(values: &[f64], status: &[u8]) -> f64 {
    let mut mean_square = 0.0;
    let mut count = 0.0;

    for value in valid(values, status) {
        count += 1.0;
        mean_square += (value * value - mean_square) / count;
    }

    mean_square.sqrt()
}

/// Circular mean in degrees, normalized to `[0, 360)`
pub fn mean_polar_deg(values: &[f64], status: &[u8]) -> f64 {
    let mut sin = 0.0;
    let mut cos = 0.0;

    for value in valid(values, status) {
        let radians = value * DEGREES_TO_RADIANS;
        sin += radians.sin();
        cos += radians.cos();
    }

    let mut degrees = sin.atan2(cos) / DEGREES_TO_RADIANS;
    if degrees < 0.0 {
        degrees += 360.0;
    }

    // atan2 of a tiny negative angle rounds up to exactly 360
    if degrees >= 360.0 {
        degrees -= 360.0;
    }

    degrees
}

/// Reduce a block of decoded samples
///
/// Returns `None` for kinds that are not float reductions.
pub fn reduce(kind: RepresentationKind, values: &[f64], status: &[u8]) -> Option<f64> {
    Some(match kind {
        RepresentationKind::Sum => sum(values, status),
        RepresentationKind::Mean => mean(values, status),
        RepresentationKind::Min => min(values, status),
        RepresentationKind::Max => max(values, status),
        RepresentationKind::Std => std(values, status),
        RepresentationKind::Rms => rms(values, status),
        RepresentationKind::MeanPolarDeg => mean_polar_deg(values, status),
        _ => return None,
    })
}

// ============================================================================
// Bitwise Kernels
// ============================================================================

/// Bitwise AND of valid samples, seeded with the first valid sample
pub fn and_bits(bits: impl Iterator<Item = u64>) -> Option<u64> {
    bits.reduce(|acc, value| acc & value)
}

/// Bitwise OR of valid samples
pub fn or_bits(bits: impl Iterator<Item = u64>) -> Option<u64> {
    bits.reduce(|acc, value| acc | value)
}
