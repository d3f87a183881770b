//! Half-open time intervals and period iteration
//!
//! Everything that tracks gaps (cache reads, cache writes, export file
//! cutting) goes through this module:
//!
//! - [`Interval`] and [`consolidate`] merge `[begin, end)` ranges into a
//!   sorted, disjoint, non-adjacent list.
//! - [`PeriodIter`] walks a range in fixed-size periods (cache buckets or
//!   export files), yielding the period start, the offset into it and the
//!   duration covered.
//!
//! Times are UTC with nanosecond resolution; period math runs on `i64`
//! nanoseconds since the Unix epoch.

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use std::fmt;

/// Nanoseconds since the Unix epoch (saturating outside the representable range)
pub fn to_nanos(time: DateTime<Utc>) -> i64 {
    time.timestamp()
        .saturating_mul(1_000_000_000)
        .saturating_add(time.timestamp_subsec_nanos() as i64)
}

/// UTC timestamp from nanoseconds since the Unix epoch
pub fn from_nanos(nanos: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos)
}

/// Round `nanos` down to a multiple of `period`
pub fn floor_nanos(nanos: i64, period: i64) -> i64 {
    nanos.div_euclid(period) * period
}

/// Round `nanos` up to a multiple of `period`
pub fn ceil_nanos(nanos: i64, period: i64) -> i64 {
    let floor = floor_nanos(nanos, period);
    if floor == nanos {
        floor
    } else {
        floor + period
    }
}

/// Round a timestamp down to a multiple of `period`
pub fn round_down(time: DateTime<Utc>, period: TimeDelta) -> DateTime<Utc> {
    let period = period.num_nanoseconds().unwrap_or(i64::MAX).max(1);
    from_nanos(floor_nanos(to_nanos(time), period))
}

/// Round a timestamp up to a multiple of `period`
pub fn round_up(time: DateTime<Utc>, period: TimeDelta) -> DateTime<Utc> {
    let period = period.num_nanoseconds().unwrap_or(i64::MAX).max(1);
    from_nanos(ceil_nanos(to_nanos(time), period))
}

// =============================================================================
// Interval
// =============================================================================

/// Half-open time range `[begin, end)`, `begin <= end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Interval {
    /// Inclusive start
    pub begin: DateTime<Utc>,
    /// Exclusive end
    pub end: DateTime<Utc>,
}

impl Interval {
    /// Create an interval; `end` is clamped so that `begin <= end` holds
    pub fn new(begin: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            begin,
            end: end.max(begin),
        }
    }

    /// Create an interval from epoch nanoseconds
    pub fn from_nanos(begin: i64, end: i64) -> Self {
        Self::new(from_nanos(begin), from_nanos(end))
    }

    /// Length of the interval
    pub fn duration(&self) -> TimeDelta {
        self.end - self.begin
    }

    /// True for zero-length intervals
    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// True if `other` starts exactly where this one ends or vice versa
    pub fn is_adjacent(&self, other: &Interval) -> bool {
        self.end == other.begin || other.end == self.begin
    }

    /// Parts of this interval not covered by any of `covered`
    ///
    /// `covered` does not need to be sorted or disjoint.
    pub fn difference(&self, covered: &[Interval]) -> Vec<Interval> {
        let covered = consolidate(covered.to_vec());
        let mut missing = Vec::new();
        let mut cursor = self.begin;

        for part in covered {
            if part.end <= cursor {
                continue;
            }
            if part.begin >= self.end {
                break;
            }
            if part.begin > cursor {
                missing.push(Interval::new(cursor, part.begin));
            }
            cursor = cursor.max(part.end);
            if cursor >= self.end {
                break;
            }
        }

        if cursor < self.end {
            missing.push(Interval::new(cursor, self.end));
        }

        missing
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.begin.to_rfc3339(),
            self.end.to_rfc3339()
        )
    }
}

/// Merge intervals into a sorted, disjoint list with no adjacent entries
///
/// Empty intervals are dropped; overlapping and adjacent ones are merged.
pub fn consolidate(mut intervals: Vec<Interval>) -> Vec<Interval> {
    intervals.retain(|interval| !interval.is_empty());
    intervals.sort_by_key(|interval| interval.begin);

    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());

    for interval in intervals {
        match merged.last_mut() {
            Some(last) if interval.begin <= last.end => {
                last.end = last.end.max(interval.end);
            }
            _ => merged.push(interval),
        }
    }

    merged
}

// =============================================================================
// Period Iteration
// =============================================================================

/// How the start of each period is derived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodAnchor {
    /// Periods start at multiples of the period length (cache buckets)
    Aligned,
    /// Like `Aligned`, except that when the period equals the whole span the
    /// single period starts at the request begin (export files)
    Request,
}

/// One step of a period walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodSlice {
    /// Start of the period containing this slice (epoch nanoseconds)
    pub period_begin: i64,
    /// Offset of the slice within its period
    pub offset: i64,
    /// Length of the slice
    pub duration: i64,
}

impl PeriodSlice {
    /// Absolute start of the slice
    pub fn begin(&self) -> i64 {
        self.period_begin + self.offset
    }

    /// Absolute end of the slice
    pub fn end(&self) -> i64 {
        self.begin() + self.duration
    }
}

/// Walks `[begin, end)` in steps that never cross a period boundary
///
/// Slices are yielded in chronological order and cover the range exactly.
#[derive(Debug, Clone)]
pub struct PeriodIter {
    period: i64,
    cursor: i64,
    remaining: i64,
    fixed_begin: Option<i64>,
}

impl PeriodIter {
    /// Create a walk over `[begin, end)` (nanoseconds) with the given period
    pub fn new(begin: i64, end: i64, period: i64, anchor: PeriodAnchor) -> Self {
        let period = period.max(1);
        let total = (end - begin).max(0);

        // a single period covering the whole request is reused as is
        let fixed_begin = if period == total {
            match anchor {
                PeriodAnchor::Request => Some(begin),
                PeriodAnchor::Aligned if floor_nanos(begin, period) == begin => Some(begin),
                PeriodAnchor::Aligned => None,
            }
        } else {
            None
        };

        Self {
            period,
            cursor: begin,
            remaining: total,
            fixed_begin,
        }
    }
}

impl Iterator for PeriodIter {
    type Item = PeriodSlice;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining <= 0 {
            return None;
        }

        let period_begin = self
            .fixed_begin
            .unwrap_or_else(|| floor_nanos(self.cursor, self.period));
        let offset = self.cursor - period_begin;
        let remaining_in_period = self.period - offset;
        let duration = remaining_in_period.min(self.remaining);

        self.cursor += duration;
        self.remaining -= duration;

        Some(PeriodSlice {
            period_begin,
            offset,
            duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const HOUR: i64 = 3_600_000_000_000;

    fn iv(begin: i64, end: i64) -> Interval {
        Interval::from_nanos(begin, end)
    }

    #[test]
    fn test_adjacent_intervals_merge() {
        let merged = consolidate(vec![iv(0, 10), iv(10, 20)]);
        assert_eq!(merged, vec![iv(0, 20)]);
    }

    #[test]
    fn test_unsorted_and_overlapping() {
        let merged = consolidate(vec![iv(30, 40), iv(0, 10), iv(5, 12), iv(50, 60), iv(40, 45)]);
        assert_eq!(merged, vec![iv(0, 12), iv(30, 45), iv(50, 60)]);
    }

    #[test]
    fn test_empty_intervals_dropped() {
        let merged = consolidate(vec![iv(5, 5), iv(7, 9)]);
        assert_eq!(merged, vec![iv(7, 9)]);
        assert!(consolidate(vec![]).is_empty());
    }

    #[test]
    fn test_interval_clamps_end() {
        let interval = iv(10, 5);
        assert!(interval.is_empty());
        assert_eq!(interval.begin, interval.end);
    }

    #[test]
    fn test_difference() {
        let requested = iv(0, 100);
        let missing = requested.difference(&[iv(10, 20), iv(20, 30), iv(50, 200)]);
        assert_eq!(missing, vec![iv(0, 10), iv(30, 50)]);

        assert_eq!(requested.difference(&[]), vec![requested]);
        assert!(requested.difference(&[iv(-5, 105)]).is_empty());
    }

    #[test]
    fn test_rounding() {
        assert_eq!(floor_nanos(25, 10), 20);
        assert_eq!(floor_nanos(-5, 10), -10);
        assert_eq!(ceil_nanos(25, 10), 30);
        assert_eq!(ceil_nanos(30, 10), 30);
    }

    #[test]
    fn test_period_iter_crosses_boundaries() {
        let slices: Vec<_> = PeriodIter::new(HOUR / 2, 2 * HOUR + HOUR / 4, HOUR, PeriodAnchor::Aligned).collect();

        assert_eq!(slices.len(), 3);
        assert_eq!(slices[0], PeriodSlice { period_begin: 0, offset: HOUR / 2, duration: HOUR / 2 });
        assert_eq!(slices[1], PeriodSlice { period_begin: HOUR, offset: 0, duration: HOUR });
        assert_eq!(slices[2], PeriodSlice { period_begin: 2 * HOUR, offset: 0, duration: HOUR / 4 });
    }

    #[test]
    fn test_period_iter_whole_span_request_anchor() {
        let slices: Vec<_> = PeriodIter::new(HOUR / 2, HOUR / 2 + HOUR, HOUR, PeriodAnchor::Request).collect();
        assert_eq!(slices, vec![PeriodSlice { period_begin: HOUR / 2, offset: 0, duration: HOUR }]);
    }

    #[test]
    fn test_period_iter_whole_span_aligned_anchor_never_straddles() {
        let slices: Vec<_> = PeriodIter::new(HOUR / 2, HOUR / 2 + HOUR, HOUR, PeriodAnchor::Aligned).collect();
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].period_begin, 0);
        assert_eq!(slices[1].period_begin, HOUR);
    }

    #[test]
    fn test_period_iter_empty_range() {
        assert_eq!(PeriodIter::new(10, 10, HOUR, PeriodAnchor::Aligned).count(), 0);
    }

    proptest! {
        #[test]
        fn prop_consolidate_sorted_disjoint_non_adjacent(
            raw in prop::collection::vec((0i64..1000, 0i64..50), 0..40)
        ) {
            let intervals: Vec<Interval> = raw.iter().map(|(b, len)| iv(*b, b + len)).collect();
            let merged = consolidate(intervals.clone());

            for pair in merged.windows(2) {
                prop_assert!(pair[0].end < pair[1].begin);
            }
            for interval in &merged {
                prop_assert!(!interval.is_empty());
            }

            // every input point stays covered
            for input in intervals.iter().filter(|i| !i.is_empty()) {
                prop_assert!(merged.iter().any(|m| m.begin <= input.begin && input.end <= m.end));
            }
        }

        #[test]
        fn prop_period_iter_covers_range(begin in -5_000i64..5_000, len in 0i64..10_000, period in 1i64..700) {
            let slices: Vec<_> = PeriodIter::new(begin, begin + len, period, PeriodAnchor::Aligned).collect();
            let mut cursor = begin;

            for slice in &slices {
                prop_assert_eq!(slice.begin(), cursor);
                prop_assert!(slice.offset + slice.duration <= period);
                prop_assert!(slice.duration > 0);
                cursor = slice.end();
            }
            prop_assert_eq!(cursor, begin + len);
        }
    }
}
