//! Prometheus metrics for the maintenance service
//!
//! Uses the `metrics` crate; the binary installs the Prometheus exporter,
//! which serves GET /metrics on its own listener.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;

/// Install the Prometheus exporter as the global recorder, listening on `port`
pub fn init_metrics(port: u16) -> Result<(), BuildError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new().with_http_listener(addr).install()
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record the end state of one repair attempt
pub fn record_repair_outcome(outcome: &'static str) {
    counter!("repair_segments_total", "outcome" => outcome).increment(1);
}

/// Record a failed repair attempt
pub fn record_repair_failure(kind: &'static str, retryable: bool) {
    counter!(
        "repair_failures_total",
        "kind" => kind,
        "retryable" => if retryable { "true" } else { "false" }
    )
    .increment(1);
}

/// Record a job put back on the queue
pub fn record_repair_retry() {
    counter!("repair_retries_total").increment(1);
}

/// Record how long one repair attempt took
pub fn record_repair_duration(duration_secs: f64) {
    histogram!("repair_job_duration_seconds").record(duration_secs);
}

/// Record one piece transfer
pub fn record_piece_transfer(direction: &'static str, result: &'static str) {
    counter!("repair_piece_transfers_total", "direction" => direction, "result" => result)
        .increment(1);
}

/// Record bytes moved during repair
pub fn record_repair_bytes(direction: &'static str, bytes: u64) {
    counter!("repair_bytes_total", "direction" => direction).increment(bytes);
}

/// Record how healthy a segment was when its repair started
pub fn record_segment_health(healthy: usize, optimal: u16) {
    histogram!("repair_segment_healthy_pieces").record(healthy as f64);
    histogram!("repair_segment_missing_pieces")
        .record((optimal as f64 - healthy as f64).max(0.0));
}

/// Record repairs currently in flight
pub fn set_active_repairs(count: usize) {
    gauge!("repair_active_jobs").set(count as f64);
}
