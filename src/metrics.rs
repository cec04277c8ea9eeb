//! Channel, sync and stream metrics
//!
//! Thin helpers over the `metrics` facade so call sites stay one line. No
//! recorder is installed by this crate; without one the macros are no-ops.
//!
//! # Metrics
//!
//! - `chatlink_reconnect_attempts_total`: Counter of scheduled reconnects
//! - `chatlink_requests_total`: Counter of correlated requests by outcome
//! - `chatlink_request_duration_seconds`: Histogram of request round-trips
//! - `chatlink_outbound_dropped_total`: Counter of frames dropped by reason
//! - `chatlink_sync_flushes_total`: Counter of flushes by outcome
//! - `chatlink_pending_changes`: Gauge of unacknowledged mutations
//! - `chatlink_merge_conflicts_total`: Counter of remote fields skipped on merge
//! - `chatlink_stream_fragments_total`: Counter of fragments revealed

use metrics::{counter, gauge, histogram, increment_counter};
use std::time::Duration;

/// Record that a reconnect attempt was scheduled.
pub fn record_reconnect_attempt(attempt: u32) {
    increment_counter!("chatlink_reconnect_attempts_total", "attempt" => attempt.to_string());
}

/// Record the outcome of a correlated request.
pub fn record_request(request_type: &str, outcome: &'static str, elapsed: Duration) {
    increment_counter!(
        "chatlink_requests_total",
        "type" => request_type.to_string(),
        "outcome" => outcome
    );
    histogram!("chatlink_request_duration_seconds", elapsed.as_secs_f64());
}

/// Record outbound frames dropped before transmission.
pub fn record_dropped(reason: &'static str, count: usize) {
    counter!("chatlink_outbound_dropped_total", count as u64, "reason" => reason);
}

/// Record the outcome of a sync flush.
pub fn record_flush(outcome: &'static str) {
    increment_counter!("chatlink_sync_flushes_total", "outcome" => outcome);
}

/// Publish the current pending change count.
pub fn set_pending_changes(count: usize) {
    gauge!("chatlink_pending_changes", count as f64);
}

/// Record remote fields skipped because they are pending locally.
pub fn record_merge_conflicts(count: usize) {
    counter!("chatlink_merge_conflicts_total", count as u64);
}

/// Record one fragment revealed by a stream formatter.
pub fn record_fragment() {
    increment_counter!("chatlink_stream_fragments_total");
}
