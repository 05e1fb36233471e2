//! Metrics for observability.
//!
//! All metrics are prefixed with `sync_` and follow Prometheus conventions:
//! counters end in `_total`, gauges represent current state, histograms
//! track distributions.

use metrics::{counter, gauge, histogram};

use crate::result::SynchronizationResult;

/// Record the outcome of one synchronization run.
pub fn record_run(source: &str, result: &SynchronizationResult) {
    counter!("sync_runs_total", "source" => source.to_string()).increment(1);
    counter!("sync_entries_added_total", "source" => source.to_string())
        .increment(result.added_entries);
    counter!("sync_entries_modified_total", "source" => source.to_string())
        .increment(result.modified_entries);
    counter!("sync_entries_deleted_total", "source" => source.to_string())
        .increment(result.deleted_entries);
    counter!("sync_entries_failed_total", "source" => source.to_string())
        .increment(result.failed_entries);
    histogram!("sync_run_duration_seconds", "source" => source.to_string())
        .record(result.duration.as_secs_f64());
    gauge!("sync_target_entries", "source" => source.to_string())
        .set(result.target_entries as f64);
}

/// Record a run that terminated with an error.
pub fn record_run_error(source: &str) {
    counter!("sync_run_errors_total", "source" => source.to_string()).increment(1);
}

/// Record records pulled from a feed.
pub fn record_records_pulled(source: &str, count: usize) {
    counter!("sync_records_pulled_total", "source" => source.to_string())
        .increment(count as u64);
}

/// Record one record applied to a destination.
pub fn record_record_applied(source: &str, action: &str) {
    counter!("sync_records_applied_total", "source" => source.to_string(), "action" => action.to_string())
        .increment(1);
}

/// Record one record whose destination write failed.
pub fn record_record_failed(source: &str) {
    counter!("sync_records_failed_total", "source" => source.to_string()).increment(1);
}

/// Record one poll loop tick.
pub fn record_poll_tick(source: &str) {
    counter!("sync_poll_ticks_total", "source" => source.to_string()).increment(1);
}

/// Record a tracker write retry (SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_tracker_retry(operation: &str) {
    counter!("sync_tracker_retries_total", "operation" => operation.to_string()).increment(1);
}
