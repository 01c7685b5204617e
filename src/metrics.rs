//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics through the `metrics` facade for:
//! - Endpoint connections
//! - Bulk copy throughput and failures
//! - Index replication
//! - Change-log apply rate, skips and lag
//! - Checkpoint persistence
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `oplog_sync_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use oplog_sync::metrics;
//!
//! metrics::record_documents_copied("app.users", 10_000);
//! metrics::record_oplog_entry_applied("insert");
//! ```

use crate::oplog::Timestamp;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a connection attempt to the source or destination.
pub fn record_connection(role: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("oplog_sync_connections_total", "role" => role.to_string(), "status" => status).increment(1);
}

/// Current checkpoint as seconds since epoch.
pub fn set_checkpoint(ts: Timestamp) {
    gauge!("oplog_sync_checkpoint_seconds").set(f64::from(ts.time));
}

/// Record an index ensured on the destination.
pub fn record_index_created(namespace: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("oplog_sync_indexes_total", "namespace" => namespace.to_string(), "status" => status).increment(1);
}

/// Record documents inserted by the bulk copy.
pub fn record_documents_copied(namespace: &str, count: u64) {
    counter!("oplog_sync_documents_copied_total", "namespace" => namespace.to_string()).increment(count);
}

/// Record per-document insert failures during the bulk copy.
pub fn record_document_copy_failures(namespace: &str, count: u64) {
    if count > 0 {
        counter!("oplog_sync_document_copy_failures_total", "namespace" => namespace.to_string()).increment(count);
    }
}

/// Record copy progress for a collection.
pub fn set_copy_progress(namespace: &str, percent: f64) {
    gauge!("oplog_sync_copy_progress_percent", "namespace" => namespace.to_string()).set(percent);
}

/// Record the outcome of syncing one collection.
pub fn record_collection_sync(namespace: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("oplog_sync_collections_total", "status" => status).increment(1);
    histogram!("oplog_sync_collection_sync_duration_seconds", "namespace" => namespace.to_string())
        .record(duration.as_secs_f64());
}

/// Record initial sync completion.
pub fn record_initial_sync_complete(collections_synced: usize, collections_failed: usize, duration: Duration) {
    gauge!("oplog_sync_initial_sync_collections", "status" => "success").set(collections_synced as f64);
    gauge!("oplog_sync_initial_sync_collections", "status" => "failure").set(collections_failed as f64);
    histogram!("oplog_sync_initial_sync_duration_seconds").record(duration.as_secs_f64());
}

/// Record raw entries read from the change log.
pub fn record_oplog_entries_read(count: usize) {
    counter!("oplog_sync_oplog_entries_read_total").increment(count as u64);
}

/// Record an entry applied to the destination.
pub fn record_oplog_entry_applied(kind: &str) {
    counter!("oplog_sync_oplog_entries_applied_total", "op" => kind.to_string()).increment(1);
}

/// Record an entry that was skipped (internal namespace, malformed, rejected).
pub fn record_oplog_entry_skipped(reason: &str) {
    counter!("oplog_sync_oplog_entries_skipped_total", "reason" => reason.to_string()).increment(1);
}

/// Record a transient apply failure that will be retried.
pub fn record_apply_retry(kind: &str) {
    counter!("oplog_sync_apply_retries_total", "op" => kind.to_string()).increment(1);
}

/// Record how long one entry took to apply.
pub fn record_apply_latency(duration: Duration) {
    histogram!("oplog_sync_apply_duration_seconds").record(duration.as_secs_f64());
}

/// Seconds between the last applied entry and now.
pub fn record_replication_lag(lag_secs: u64) {
    gauge!("oplog_sync_replication_lag_seconds").set(lag_secs as f64);
}

/// Record a change-log tail reconnect attempt.
pub fn record_tail_reconnect(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("oplog_sync_tail_reconnects_total", "status" => status).increment(1);
}

/// Gauge for tail state.
pub fn set_tail_state(state: &str) {
    let value = match state {
        "Idle" => 0.0,
        "Tailing" => 1.0,
        "Disconnected" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("oplog_sync_tail_state").set(value);
}

/// Record checkpoint flush batch (debounced writes).
pub fn record_checkpoint_flush(flushed: usize, errors: usize) {
    counter!("oplog_sync_checkpoint_flushes_total").increment(1);
    counter!("oplog_sync_checkpoint_flushed_count").increment(flushed as u64);
    if errors > 0 {
        counter!("oplog_sync_checkpoint_flush_errors_total").increment(errors as u64);
    }
}

/// Record checkpoint SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn checkpoint_store_retries_total(operation: &str) {
    counter!("oplog_sync_checkpoint_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record errors by type.
pub fn record_error(error_type: &str) {
    counter!("oplog_sync_errors_total", "error_type" => error_type.to_string()).increment(1);
}

/// Gauge for synchronizer state.
pub fn set_sync_state(state: &str) {
    let value = match state {
        "Ready" => 0.0,
        "InitialSync" => 1.0,
        "Tailing" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("oplog_sync_state").set(value);
}
