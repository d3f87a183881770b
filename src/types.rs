//! Core data model used throughout the data engine
//!
//! # Key Types
//!
//! - **`NexusDataType`**: Raw element type of a source buffer (encodes its bit width)
//! - **`SamplePeriod`**: Strictly positive sample period with nanosecond resolution
//! - **`RepresentationKind`**: Which transform produced a representation
//! - **`Representation`**: Data type + sample period + kind of one view of a resource
//! - **`CatalogItem`**: Catalog id + resource id + representation, i.e. one time series
//!
//! # Example
//!
//! ```rust
//! use nexus_engine::types::{
//!     CatalogItem, NexusDataType, Representation, RepresentationKind, SamplePeriod,
//! };
//!
//! let representation = Representation::new(
//!     NexusDataType::FLOAT64,
//!     SamplePeriod::from_secs(600).unwrap(),
//!     RepresentationKind::Mean,
//! );
//! assert_eq!(representation.id(), "10_min_mean");
//!
//! let item = CatalogItem::new("/IN_MEMORY/TEST", "T1", representation, None).unwrap();
//! assert_eq!(item.to_path(), "/IN_MEMORY/TEST/T1/10_min_mean");
//! ```

use crate::error::DataModelError;
use chrono::{DateTime, TimeDelta, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;

lazy_static! {
    /// Catalog identifiers are absolute paths of identifier segments
    static ref CATALOG_ID_EXPRESSION: Regex =
        Regex::new(r"^(?:/[a-zA-Z_][a-zA-Z_0-9]*)+$").unwrap();

    /// Resource identifiers and representation parameter keys
    static ref RESOURCE_ID_EXPRESSION: Regex =
        Regex::new(r"^[a-zA-Z_][a-zA-Z_0-9]*$").unwrap();
}

/// Nanoseconds in one day
pub const NANOS_PER_DAY: i64 = 86_400_000_000_000;

/// Representation parameters, ordered so that derived identifiers are stable
pub type Parameters = BTreeMap<String, String>;

// =============================================================================
// Data Type
// =============================================================================

/// Raw element type of a data buffer
///
/// The low byte holds the bit width, the high byte the numeric family
/// (1 = unsigned, 2 = signed, 3 = floating point).
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum NexusDataType {
    /// Unsigned 8-bit integer
    UINT8 = 0x108,
    /// Signed 8-bit integer
    INT8 = 0x208,
    /// Unsigned 16-bit integer
    UINT16 = 0x110,
    /// Signed 16-bit integer
    INT16 = 0x210,
    /// Unsigned 32-bit integer
    UINT32 = 0x120,
    /// Signed 32-bit integer
    INT32 = 0x220,
    /// Unsigned 64-bit integer
    UINT64 = 0x140,
    /// Signed 64-bit integer
    INT64 = 0x240,
    /// 32-bit floating point number
    FLOAT32 = 0x320,
    /// 64-bit floating point number
    FLOAT64 = 0x340,
}

impl NexusDataType {
    /// Encoded value
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Size of one element in bytes
    pub fn element_size(self) -> usize {
        ((self.code() & 0xFF) >> 3) as usize
    }

    /// True for FLOAT32 and FLOAT64
    pub fn is_float(self) -> bool {
        matches!(self, NexusDataType::FLOAT32 | NexusDataType::FLOAT64)
    }
}

impl TryFrom<u16> for NexusDataType {
    type Error = DataModelError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            0x108 => NexusDataType::UINT8,
            0x208 => NexusDataType::INT8,
            0x110 => NexusDataType::UINT16,
            0x210 => NexusDataType::INT16,
            0x120 => NexusDataType::UINT32,
            0x220 => NexusDataType::INT32,
            0x140 => NexusDataType::UINT64,
            0x240 => NexusDataType::INT64,
            0x320 => NexusDataType::FLOAT32,
            0x340 => NexusDataType::FLOAT64,
            other => return Err(DataModelError::UnknownDataType(other)),
        })
    }
}

// =============================================================================
// Sample Period
// =============================================================================

const UNIT_QUOTIENTS: [i64; 6] = [1000, 1000, 1000, 60, 60, 24];
const UNIT_POSTFIXES: [&str; 7] = ["ns", "us", "ms", "s", "min", "h", "d"];

/// Sample period of a representation, always > 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SamplePeriod(i64);

impl SamplePeriod {
    /// Create a sample period from nanoseconds
    pub fn from_nanos(nanos: i64) -> Result<Self, DataModelError> {
        if nanos <= 0 {
            return Err(DataModelError::InvalidSamplePeriod(nanos));
        }
        Ok(Self(nanos))
    }

    /// Create a sample period from milliseconds
    pub fn from_millis(millis: i64) -> Result<Self, DataModelError> {
        Self::from_nanos(millis.saturating_mul(1_000_000))
    }

    /// Create a sample period from seconds
    pub fn from_secs(secs: i64) -> Result<Self, DataModelError> {
        Self::from_nanos(secs.saturating_mul(1_000_000_000))
    }

    /// Create a sample period from a chrono delta
    pub fn from_delta(delta: TimeDelta) -> Result<Self, DataModelError> {
        let nanos = delta.num_nanoseconds().unwrap_or(i64::MAX);
        Self::from_nanos(nanos)
    }

    /// Period in nanoseconds
    pub fn as_nanos(&self) -> i64 {
        self.0
    }

    /// Period as chrono delta
    pub fn as_delta(&self) -> TimeDelta {
        TimeDelta::nanoseconds(self.0)
    }

    /// Period in seconds
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / 1e9
    }

    /// Human readable number with unit, e.g. `1_s`, `10_min`, `1500_ms`
    pub fn to_unit_string(&self) -> String {
        let mut value = self.0;

        for (quotient, postfix) in UNIT_QUOTIENTS.iter().zip(UNIT_POSTFIXES.iter()) {
            if value % quotient != 0 {
                return format!("{}_{}", value, postfix);
            }
            value /= quotient;
        }

        format!("{}_{}", value, UNIT_POSTFIXES[UNIT_POSTFIXES.len() - 1])
    }
}

impl fmt::Display for SamplePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_unit_string())
    }
}

// =============================================================================
// Representation
// =============================================================================

/// Which transform produced a representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepresentationKind {
    /// Data as delivered by the source
    Original = 0,
    /// Upsampled from a coarser base representation
    Resampled = 10,
    /// Arithmetic mean per block
    Mean = 20,
    /// Circular mean in degrees per block
    MeanPolarDeg = 30,
    /// Minimum per block
    Min = 40,
    /// Maximum per block
    Max = 50,
    /// Population standard deviation per block
    Std = 60,
    /// Root mean square per block
    Rms = 70,
    /// Bitwise AND per block
    MinBitwise = 80,
    /// Bitwise OR per block
    MaxBitwise = 90,
    /// Sum per block
    Sum = 100,
}

impl RepresentationKind {
    /// Snake case name used in identifiers and file names
    pub fn as_str(&self) -> &'static str {
        match self {
            RepresentationKind::Original => "original",
            RepresentationKind::Resampled => "resampled",
            RepresentationKind::Mean => "mean",
            RepresentationKind::MeanPolarDeg => "mean_polar_deg",
            RepresentationKind::Min => "min",
            RepresentationKind::Max => "max",
            RepresentationKind::Std => "std",
            RepresentationKind::Rms => "rms",
            RepresentationKind::MinBitwise => "min_bitwise",
            RepresentationKind::MaxBitwise => "max_bitwise",
            RepresentationKind::Sum => "sum",
        }
    }

    /// True for kinds produced by block reduction
    pub fn is_aggregation(&self) -> bool {
        !matches!(
            self,
            RepresentationKind::Original | RepresentationKind::Resampled
        )
    }

    /// True for kinds that reduce raw integer bit patterns
    pub fn is_bitwise(&self) -> bool {
        matches!(
            self,
            RepresentationKind::MinBitwise | RepresentationKind::MaxBitwise
        )
    }
}

impl fmt::Display for RepresentationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A representation is one view of a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Representation {
    /// Raw element type
    pub data_type: NexusDataType,
    /// Sample period
    pub sample_period: SamplePeriod,
    /// Transform that produced this representation
    pub kind: RepresentationKind,
    /// Optional parameter declarations
    pub parameters: Option<Parameters>,
}

impl Representation {
    /// Create a representation without parameters
    pub fn new(
        data_type: NexusDataType,
        sample_period: SamplePeriod,
        kind: RepresentationKind,
    ) -> Self {
        Self {
            data_type,
            sample_period,
            kind,
            parameters: None,
        }
    }

    /// Attach parameter declarations, validating their keys
    pub fn with_parameters(mut self, parameters: Parameters) -> Result<Self, DataModelError> {
        validate_parameter_keys(&parameters)?;
        self.parameters = Some(parameters);
        Ok(self)
    }

    /// Stable identifier derived from sample period and kind
    pub fn id(&self) -> String {
        let unit = self.sample_period.to_unit_string();

        match self.kind {
            RepresentationKind::Original => unit,
            kind => format!("{}_{}", unit, kind.as_str()),
        }
    }

    /// Size of one element in bytes
    pub fn element_size(&self) -> usize {
        self.data_type.element_size()
    }
}

// =============================================================================
// Catalog Item
// =============================================================================

/// One time series: catalog + resource + representation (+ parameter arguments)
///
/// Resolved once per request and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CatalogItem {
    /// Catalog identifier, e.g. `/A/B/C`
    pub catalog_id: String,
    /// Resource identifier, e.g. `T1`
    pub resource_id: String,
    /// Representation
    pub representation: Representation,
    /// Optional representation parameter arguments
    pub parameters: Option<Parameters>,
}

impl CatalogItem {
    /// Create a catalog item, validating all identifiers
    pub fn new(
        catalog_id: impl Into<String>,
        resource_id: impl Into<String>,
        representation: Representation,
        parameters: Option<Parameters>,
    ) -> Result<Self, DataModelError> {
        let catalog_id = catalog_id.into();
        let resource_id = resource_id.into();

        if !CATALOG_ID_EXPRESSION.is_match(&catalog_id) {
            return Err(DataModelError::InvalidIdentifier {
                kind: "catalog",
                id: catalog_id,
            });
        }

        if !RESOURCE_ID_EXPRESSION.is_match(&resource_id) {
            return Err(DataModelError::InvalidIdentifier {
                kind: "resource",
                id: resource_id,
            });
        }

        if let Some(parameters) = &parameters {
            validate_parameter_keys(parameters)?;
        }

        Ok(Self {
            catalog_id,
            resource_id,
            representation,
            parameters,
        })
    }

    /// `(k1=v1,k2=v2)` or empty string
    pub fn parameter_suffix(&self) -> String {
        match &self.parameters {
            Some(parameters) if !parameters.is_empty() => {
                let pairs: Vec<String> = parameters
                    .iter()
                    .map(|(key, value)| format!("{}={}", key, value))
                    .collect();
                format!("({})", pairs.join(","))
            }
            _ => String::new(),
        }
    }

    /// Fully qualified path of this item
    pub fn to_path(&self) -> String {
        format!(
            "{}/{}/{}{}",
            self.catalog_id,
            self.resource_id,
            self.representation.id(),
            self.parameter_suffix()
        )
    }

    /// Catalog id flattened into a single directory name (`/A/B` → `A_B`)
    pub fn physical_catalog_id(&self) -> String {
        physical_catalog_id(&self.catalog_id)
    }
}

impl fmt::Display for CatalogItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_path())
    }
}

/// Flatten a catalog id into a single directory name
pub fn physical_catalog_id(catalog_id: &str) -> String {
    catalog_id.trim_start_matches('/').replace('/', "_")
}

fn validate_parameter_keys(parameters: &Parameters) -> Result<(), DataModelError> {
    for key in parameters.keys() {
        if !RESOURCE_ID_EXPRESSION.is_match(key) {
            return Err(DataModelError::InvalidIdentifier {
                kind: "parameter",
                id: key.clone(),
            });
        }
    }
    Ok(())
}

// =============================================================================
// Buffers
// =============================================================================

/// Number of samples of `sample_period` in `[begin, end)`
pub fn element_count(begin: DateTime<Utc>, end: DateTime<Utc>, sample_period: SamplePeriod) -> usize {
    let span = crate::interval::to_nanos(end) - crate::interval::to_nanos(begin);
    if span <= 0 {
        return 0;
    }
    (span / sample_period.as_nanos()) as usize
}

/// Zeroed data and status buffers for reading `[begin, end)` of a representation
pub fn create_buffers(
    representation: &Representation,
    begin: DateTime<Utc>,
    end: DateTime<Utc>,
) -> (Vec<u8>, Vec<u8>) {
    let count = element_count(begin, end, representation.sample_period);
    let data = vec![0u8; count * representation.element_size()];
    let status = vec![0u8; count];
    (data, status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn float_rep(secs: i64, kind: RepresentationKind) -> Representation {
        Representation::new(
            NexusDataType::FLOAT64,
            SamplePeriod::from_secs(secs).unwrap(),
            kind,
        )
    }

    #[test]
    fn test_element_size() {
        assert_eq!(NexusDataType::UINT8.element_size(), 1);
        assert_eq!(NexusDataType::INT16.element_size(), 2);
        assert_eq!(NexusDataType::FLOAT32.element_size(), 4);
        assert_eq!(NexusDataType::INT64.element_size(), 8);
        assert_eq!(NexusDataType::FLOAT64.element_size(), 8);
    }

    #[test]
    fn test_data_type_round_trip_code() {
        assert_eq!(
            NexusDataType::try_from(0x220).unwrap(),
            NexusDataType::INT32
        );
        assert!(NexusDataType::try_from(0x999).is_err());
    }

    #[test]
    fn test_sample_period_must_be_positive() {
        assert!(SamplePeriod::from_nanos(0).is_err());
        assert!(SamplePeriod::from_nanos(-5).is_err());
        assert!(SamplePeriod::from_nanos(1).is_ok());
    }

    #[test]
    fn test_unit_string() {
        assert_eq!(SamplePeriod::from_nanos(1).unwrap().to_unit_string(), "1_ns");
        assert_eq!(SamplePeriod::from_nanos(1_500).unwrap().to_unit_string(), "1500_ns");
        assert_eq!(SamplePeriod::from_millis(1).unwrap().to_unit_string(), "1_ms");
        assert_eq!(SamplePeriod::from_millis(1_500).unwrap().to_unit_string(), "1500_ms");
        assert_eq!(SamplePeriod::from_secs(1).unwrap().to_unit_string(), "1_s");
        assert_eq!(SamplePeriod::from_secs(600).unwrap().to_unit_string(), "10_min");
        assert_eq!(SamplePeriod::from_secs(3600).unwrap().to_unit_string(), "1_h");
        assert_eq!(SamplePeriod::from_secs(86_400).unwrap().to_unit_string(), "1_d");
        assert_eq!(SamplePeriod::from_secs(2 * 86_400).unwrap().to_unit_string(), "2_d");
    }

    #[test]
    fn test_representation_id() {
        assert_eq!(float_rep(1, RepresentationKind::Original).id(), "1_s");
        assert_eq!(float_rep(600, RepresentationKind::Mean).id(), "10_min_mean");
        assert_eq!(
            float_rep(1, RepresentationKind::MeanPolarDeg).id(),
            "1_s_mean_polar_deg"
        );
        assert_eq!(
            float_rep(60, RepresentationKind::MinBitwise).id(),
            "1_min_min_bitwise"
        );
    }

    #[test]
    fn test_catalog_item_validation() {
        let rep = float_rep(1, RepresentationKind::Original);

        assert!(CatalogItem::new("/A/B", "T1", rep.clone(), None).is_ok());
        assert!(CatalogItem::new("A/B", "T1", rep.clone(), None).is_err());
        assert!(CatalogItem::new("/A/1B", "T1", rep.clone(), None).is_err());
        assert!(CatalogItem::new("/A/B", "1T", rep.clone(), None).is_err());

        let mut parameters = Parameters::new();
        parameters.insert("bad-key".to_string(), "x".to_string());
        assert!(CatalogItem::new("/A/B", "T1", rep, Some(parameters)).is_err());
    }

    #[test]
    fn test_catalog_item_path_with_parameters() {
        let mut parameters = Parameters::new();
        parameters.insert("zeta".to_string(), "2".to_string());
        parameters.insert("alpha".to_string(), "1".to_string());

        let item = CatalogItem::new(
            "/A/B/C",
            "T1",
            float_rep(1, RepresentationKind::Original),
            Some(parameters),
        )
        .unwrap();

        assert_eq!(item.parameter_suffix(), "(alpha=1,zeta=2)");
        assert_eq!(item.to_path(), "/A/B/C/T1/1_s(alpha=1,zeta=2)");
        assert_eq!(item.physical_catalog_id(), "A_B_C");
    }

    #[test]
    fn test_create_buffers() {
        let rep = Representation::new(
            NexusDataType::INT16,
            SamplePeriod::from_secs(1).unwrap(),
            RepresentationKind::Original,
        );
        let begin = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2020, 1, 1, 0, 1, 0).unwrap();

        let (data, status) = create_buffers(&rep, begin, end);
        assert_eq!(data.len(), 120);
        assert_eq!(status.len(), 60);
        assert!(status.iter().all(|&s| s == 0));
    }
}
