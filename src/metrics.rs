// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the tag cache.
//!
//! Uses the `metrics` crate facade. The host application installs the
//! exporter (Prometheus, OTEL, ...).
//!
//! # Metric Naming Convention
//! - `tag_cache_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `operation`: save, load, test, remove, clean, touch, metadata, gc
//! - `status`: success, miss, error
//! - `node`: primary, replica

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::compression::CompressionStats;

/// Record the outcome of a public operation
pub fn record_operation(operation: &str, status: &str) {
    counter!(
        "tag_cache_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "tag_cache_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A read that had to go back to the primary (`miss` or `loading`)
pub fn record_replica_fallback(reason: &str) {
    counter!(
        "tag_cache_replica_fallbacks_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// An atomic section was aborted because the entry or a tag set changed
/// underneath it
pub fn record_conflict(operation: &str) {
    counter!(
        "tag_cache_atomic_conflicts_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Script was missing from the server cache and had to be sent in full
pub fn record_script_reload(script: &str) {
    counter!(
        "tag_cache_script_reloads_total",
        "script" => script.to_string()
    )
    .increment(1);
}

/// Entries removed by a clean call
pub fn record_clean(mode: &str, removed: usize) {
    counter!(
        "tag_cache_cleaned_entries_total",
        "mode" => mode.to_string()
    )
    .increment(removed as u64);
}

/// Results of one garbage collection pass
pub fn record_gc(
    tags_scanned: usize,
    ids_swept: usize,
    tags_dropped: usize,
    existence_checks: usize,
    duration: Duration,
) {
    counter!("tag_cache_gc_tags_scanned_total").increment(tags_scanned as u64);
    counter!("tag_cache_gc_ids_swept_total").increment(ids_swept as u64);
    counter!("tag_cache_gc_tags_dropped_total").increment(tags_dropped as u64);
    counter!("tag_cache_gc_existence_checks_total").increment(existence_checks as u64);
    histogram!("tag_cache_gc_seconds").record(duration.as_secs_f64());
}

/// Bytes saved by the compression envelope
pub fn record_compression(codec: &str, stats: &CompressionStats) {
    counter!(
        "tag_cache_compressed_bytes_in_total",
        "codec" => codec.to_string()
    )
    .increment(stats.original_bytes as u64);
    counter!(
        "tag_cache_compressed_bytes_out_total",
        "codec" => codec.to_string()
    )
    .increment(stats.compressed_bytes as u64);
}

/// Record a failed connection attempt
pub fn record_connection_error(node: &str) {
    counter!(
        "tag_cache_connection_errors_total",
        "node" => node.to_string()
    )
    .increment(1);
}

/// 1 when reads go to a replica, 0 when they go to the primary
pub fn set_replica_active(active: bool) {
    gauge!("tag_cache_replica_active").set(if active { 1.0 } else { 0.0 });
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}

/// Convenience macro for timing operations
#[macro_export]
macro_rules! time_operation {
    ($op:expr) => {
        $crate::metrics::LatencyTimer::new($op)
    };
}
