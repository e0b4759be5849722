//! Metrics definitions for the room service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `room_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded by code:
//! - `event`: 3 values (peer-join, peer-left, new-producer)
//! - `operation`: 6 values (negotiation operations plus unregister)
//! - `status`: bounded by `RoomError::metric_label` plus `success`
//! - `actor_type`: 2 values (room, connection)
//! - `endpoint`: the fixed route table, anything else is `/other`

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle for `/metrics`.
///
/// # Errors
///
/// Returns error if the recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    builder()?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

/// Build a recorder handle without installing it globally.
///
/// Test servers use this so several can coexist in one process.
///
/// # Errors
///
/// Returns error if the bucket configuration is rejected.
pub fn detached_metrics_handle() -> Result<PrometheusHandle, String> {
    Ok(builder()?.build_recorder().handle())
}

fn builder() -> Result<PrometheusBuilder, String> {
    PrometheusBuilder::new()
        // Engine round trips are in-process or on the local network
        .set_buckets_for_metric(
            Matcher::Prefix("room_negotiation".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set negotiation buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Full("room_http_request_duration_seconds".to_string()),
            &[
                0.005, 0.010, 0.025, 0.050, 0.100, 0.200, 0.500, 1.000, 2.000, 5.000,
            ],
        )
        .map_err(|e| format!("Failed to set HTTP buckets: {e}"))
}

/// Set the number of registered peers.
///
/// Metric: `room_peers_active`
pub fn set_peers_active(count: usize) {
    // usize to f64 conversion is safe for realistic peer counts
    #[allow(clippy::cast_precision_loss)]
    gauge!("room_peers_active").set(count as f64);
}

/// Record one event fanned out to one recipient.
///
/// Metric: `room_events_broadcast_total`
/// Labels: `event`
pub fn record_event_broadcast(event: &'static str) {
    counter!("room_events_broadcast_total", "event" => event).increment(1);
}

/// Record a recipient disconnected because its event queue was full.
///
/// Metric: `room_events_dropped_total`
pub fn record_event_dropped() {
    counter!("room_events_dropped_total").increment(1);
}

/// Record a negotiation operation outcome and duration.
///
/// Metrics: `room_negotiation_total`, `room_negotiation_duration_seconds`
/// Labels: `operation`, `status`
pub fn record_negotiation(operation: &'static str, status: &'static str, duration: Duration) {
    histogram!("room_negotiation_duration_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
    counter!("room_negotiation_total", "operation" => operation, "status" => status)
        .increment(1);
}

/// Record one HTTP request.
///
/// Metrics: `room_http_requests_total`, `room_http_request_duration_seconds`
/// Labels: `method`, `endpoint`, `status`
pub fn record_http_request(method: &str, path: &str, status_code: u16, duration: Duration) {
    let endpoint = normalize_endpoint(path);
    let status = categorize_status_code(status_code);

    histogram!("room_http_request_duration_seconds",
        "method" => method.to_string(),
        "endpoint" => endpoint,
        "status" => status
    )
    .record(duration.as_secs_f64());

    counter!("room_http_requests_total",
        "method" => method.to_string(),
        "endpoint" => endpoint,
        "status_code" => status_code.to_string()
    )
    .increment(1);
}

fn categorize_status_code(status_code: u16) -> &'static str {
    match status_code {
        200..=299 => "success",
        408 | 504 => "timeout",
        _ => "error",
    }
}

const KNOWN_ENDPOINTS: &[&str] = &[
    "/health",
    "/ready",
    "/metrics",
    "/room",
    "/peers",
    "/capabilities",
    "/rtp_capabilities",
    "/create_transport",
    "/transport_connect",
    "/transport_produce",
    "/transport_consume",
    "/control",
    "/control_producer",
    "/control_consumer",
];

fn normalize_endpoint(path: &str) -> &'static str {
    KNOWN_ENDPOINTS
        .iter()
        .find(|known| **known == path)
        .copied()
        .unwrap_or("/other")
}

/// Record an actor panic.
///
/// Metric: `room_actor_panics_total`
/// Labels: `actor_type`
///
/// Any non-zero value indicates a bug.
pub fn record_actor_panic(actor_type: &'static str) {
    counter!("room_actor_panics_total", "actor_type" => actor_type).increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    // These run against the global no-op recorder; they only exercise the
    // recording paths.

    #[test]
    fn test_recording_without_recorder_does_not_panic() {
        set_peers_active(0);
        set_peers_active(42);
        record_event_broadcast("peer-join");
        record_event_broadcast("new-producer");
        record_event_dropped();
        record_negotiation("produce", "success", Duration::from_millis(3));
        record_negotiation("consume", "unsupported", Duration::from_millis(1));
        record_actor_panic("connection");
        record_http_request("POST", "/transport_produce", 200, Duration::from_millis(2));
    }

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("/peers"), "/peers");
        assert_eq!(normalize_endpoint("/control_consumer"), "/control_consumer");
        assert_eq!(normalize_endpoint("/peers/abc"), "/other");
        assert_eq!(normalize_endpoint("/"), "/other");
    }

    #[test]
    fn test_categorize_status_code() {
        assert_eq!(categorize_status_code(200), "success");
        assert_eq!(categorize_status_code(412), "error");
        assert_eq!(categorize_status_code(504), "timeout");
    }

    #[test]
    fn test_detached_handle_renders() {
        let handle = detached_metrics_handle().unwrap();
        // Nothing was recorded through this handle's recorder.
        assert!(!handle.render().contains("room_peers_active"));
    }
}
