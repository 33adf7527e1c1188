//! Transport observability metrics
//!
//! Thin wrappers over the `metrics` facade. No recorder is installed
//! here; deployments that want the numbers install their own exporter.

use std::time::Duration;

/// Record a completed request attempt
pub fn record_request(name: &str, outcome: &'static str) {
    metrics::counter!(
        "keel_requests_total",
        "name" => name.to_string(),
        "outcome" => outcome,
    )
    .increment(1);
}

/// Record the duration of a request attempt
pub fn record_request_duration(name: &str, duration: Duration) {
    metrics::histogram!(
        "keel_request_duration_seconds",
        "name" => name.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Record a retry of a failed attempt
pub fn record_retry(name: &str) {
    metrics::counter!("keel_request_retries_total", "name" => name.to_string()).increment(1);
}

/// Record a node health transition
pub fn update_node_state(node_id: &str, alive: bool) {
    metrics::gauge!(
        "keel_node_alive",
        "node_id" => node_id.to_string(),
    )
    .set(if alive { 1.0 } else { 0.0 });
}

/// Record a resurrection attempt and its outcome
pub fn record_resurrect(strategy: &'static str, is_alive: bool) {
    metrics::counter!(
        "keel_resurrects_total",
        "strategy" => strategy,
        "outcome" => if is_alive { "alive" } else { "dead" },
    )
    .increment(1);
}

/// Record a cluster discovery attempt
pub fn record_sniff(reason: &'static str, ok: bool) {
    metrics::counter!(
        "keel_sniffs_total",
        "reason" => reason,
        "outcome" => if ok { "ok" } else { "error" },
    )
    .increment(1);
}
