//! Bucket file naming
//!
//! ```text
//! {root}/{physical_catalog_id}/{yyyy-MM}/{dd}/{yyyy-MM-ddTHH-mm-ss-fffffff}_{resource}_{representation}{params}.cache
//! ```

use crate::types::CatalogItem;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};

/// Extension of every bucket file
pub const BUCKET_EXTENSION: &str = "cache";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";
const TIMESTAMP_SECONDS_LEN: usize = 19;
const TIMESTAMP_LEN: usize = TIMESTAMP_SECONDS_LEN + 8;

/// Bucket start formatted as `yyyy-MM-ddTHH-mm-ss-fffffff` (100 ns ticks)
pub fn format_timestamp(time: DateTime<Utc>) -> String {
    format!(
        "{}-{:07}",
        time.format(TIMESTAMP_FORMAT),
        time.timestamp_subsec_nanos() / 100
    )
}

/// Inverse of [`format_timestamp`]
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if value.len() != TIMESTAMP_LEN || !value.is_ascii() {
        return None;
    }

    let seconds = NaiveDateTime::parse_from_str(value.get(..TIMESTAMP_SECONDS_LEN)?, TIMESTAMP_FORMAT).ok()?;

    if value.as_bytes()[TIMESTAMP_SECONDS_LEN] != b'-' {
        return None;
    }
    let ticks: u32 = value.get(TIMESTAMP_SECONDS_LEN + 1..)?.parse().ok()?;

    let time = seconds.and_utc() + chrono::TimeDelta::nanoseconds(ticks as i64 * 100);
    Some(time)
}

/// Timestamp embedded in a bucket file name, if it is one
pub fn parse_bucket_file_name(file_name: &str) -> Option<DateTime<Utc>> {
    let stem = file_name.strip_suffix(BUCKET_EXTENSION)?.strip_suffix('.')?;
    let (timestamp, _) = stem.split_once('_')?;
    parse_timestamp(timestamp)
}

/// Directory holding all bucket files of one catalog for one calendar day
pub fn day_directory(root: &Path, physical_catalog_id: &str, day: DateTime<Utc>) -> PathBuf {
    root.join(physical_catalog_id)
        .join(day.format("%Y-%m").to_string())
        .join(day.format("%d").to_string())
}

/// Full path of the bucket file starting at `bucket_begin`
pub fn bucket_path(root: &Path, item: &CatalogItem, bucket_begin: DateTime<Utc>) -> PathBuf {
    let file_name = format!(
        "{}_{}_{}{}.{}",
        format_timestamp(bucket_begin),
        item.resource_id,
        item.representation.id(),
        item.parameter_suffix(),
        BUCKET_EXTENSION
    );

    day_directory(root, &item.physical_catalog_id(), bucket_begin).join(file_name)
}
