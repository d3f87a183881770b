//! Metrics and telemetry for the data engine
//!
//! This module provides Prometheus metrics for cache effectiveness,
//! memory pressure and export throughput.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

lazy_static! {
    // === Cache ===

    /// Bucket reads by outcome (hit, partial, miss, error)
    pub static ref CACHE_READS_TOTAL: CounterVec = register_counter_vec!(
        "nexus_cache_reads_total",
        "Cache bucket reads by outcome",
        &["outcome"]
    ).unwrap();

    /// Bucket writes by outcome (success, skipped)
    pub static ref CACHE_WRITES_TOTAL: CounterVec = register_counter_vec!(
        "nexus_cache_writes_total",
        "Cache bucket writes by outcome",
        &["outcome"]
    ).unwrap();

    /// Bucket deletes by outcome (deleted, retried, timeout)
    pub static ref CACHE_DELETES_TOTAL: CounterVec = register_counter_vec!(
        "nexus_cache_deletes_total",
        "Cache bucket deletes by outcome",
        &["outcome"]
    ).unwrap();

    // === Allocator ===

    /// Bytes currently granted
    pub static ref ALLOCATOR_CONSUMED_BYTES: Gauge = register_gauge!(
        "nexus_allocator_consumed_bytes",
        "Decoded buffer bytes currently granted"
    ).unwrap();

    /// Callers currently parked
    pub static ref ALLOCATOR_WAITERS: Gauge = register_gauge!(
        "nexus_allocator_waiters",
        "Callers waiting for buffer memory"
    ).unwrap();

    /// Allocation attempts by outcome (granted, waited, timeout, cancelled)
    pub static ref ALLOCATIONS_TOTAL: CounterVec = register_counter_vec!(
        "nexus_allocations_total",
        "Allocation attempts by outcome",
        &["outcome"]
    ).unwrap();

    // === Pipeline ===

    /// Source read calls by outcome
    pub static ref SOURCE_READS_TOTAL: CounterVec = register_counter_vec!(
        "nexus_source_reads_total",
        "Data source read calls by outcome",
        &["outcome"]
    ).unwrap();

    /// Exports by outcome (completed, cancelled, faulted)
    pub static ref EXPORTS_TOTAL: CounterVec = register_counter_vec!(
        "nexus_exports_total",
        "Exports by outcome",
        &["outcome"]
    ).unwrap();

    /// Export duration
    pub static ref EXPORT_DURATION: HistogramVec = register_histogram_vec!(
        "nexus_export_duration_seconds",
        "Export latency in seconds",
        &["outcome"],
        vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]
    ).unwrap();
}

/// Get metrics in Prometheus text format
///
/// # Returns
///
/// Result containing the formatted metrics string, or an error if encoding fails
pub fn gather_metrics() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
}

/// Record the outcome of one bucket read
#[inline]
pub fn record_cache_read(outcome: &str) {
    CACHE_READS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record the outcome of one bucket write
#[inline]
pub fn record_cache_write(outcome: &str) {
    CACHE_WRITES_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record the outcome of one bucket delete
#[inline]
pub fn record_cache_delete(outcome: &str) {
    CACHE_DELETES_TOTAL.with_label_values(&[outcome]).inc();
}

/// Update allocator gauges
#[inline]
pub fn update_allocator(consumed: usize, waiters: usize) {
    ALLOCATOR_CONSUMED_BYTES.set(consumed as f64);
    ALLOCATOR_WAITERS.set(waiters as f64);
}

/// Record the outcome of one allocation attempt
#[inline]
pub fn record_allocation(outcome: &str) {
    ALLOCATIONS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record a data source read call
#[inline]
pub fn record_source_read(success: bool) {
    let outcome = if success { "success" } else { "error" };
    SOURCE_READS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record a finished export
#[inline]
pub fn record_export(outcome: &str, duration_secs: f64) {
    EXPORTS_TOTAL.with_label_values(&[outcome]).inc();
    EXPORT_DURATION
        .with_label_values(&[outcome])
        .observe(duration_secs);
}
