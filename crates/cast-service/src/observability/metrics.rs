//! Metrics definitions for the cast service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `cast_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `method`: 6 signaling methods
//! - `status`: success, error, timeout
//! - `event`: 3 server event names
//! - `outcome`: bounded by code (started, not_ready, already_running, failed,
//!   cancelled for bridge starts; ready, failed, timeout for encoder spawns)
//! - `actor_type`: 2 values (session, bridge)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// # Errors
///
/// Returns error if a recorder is already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Signaling requests are short engine round-trips
        .set_buckets_for_metric(
            Matcher::Prefix("cast_signaling".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 5.000,
            ],
        )
        .map_err(|e| format!("Failed to set signaling latency buckets: {e}"))?
        // Bridge start includes encoder readiness and warm-up
        .set_buckets_for_metric(
            Matcher::Prefix("cast_bridge".to_string()),
            &[0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000, 30.000],
        )
        .map_err(|e| format!("Failed to set bridge duration buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Session & Producer Metrics (Gauges)
// ============================================================================

/// Metric: `cast_sessions_active`
pub fn set_sessions_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("cast_sessions_active").set(count as f64);
}

/// Metric: `cast_producers_active`
pub fn set_producers_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("cast_producers_active").set(count as f64);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `cast_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("cast_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

/// Metric: `cast_actor_panics_total`
/// Labels: `actor_type`
pub fn record_actor_panic(actor_type: &str) {
    counter!("cast_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

// ============================================================================
// Signaling Metrics
// ============================================================================

/// Record a signaling request.
///
/// Metrics: `cast_signaling_requests_total` (labels: `method`, `status`),
/// `cast_signaling_latency_seconds` (labels: `method`)
pub fn record_signaling_request(method: &str, status: &str, duration: Duration) {
    counter!("cast_signaling_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("cast_signaling_latency_seconds", "method" => method.to_string())
        .record(duration.as_secs_f64());
}

/// Record a server event dropped because a client's queue was full.
///
/// Metric: `cast_events_dropped_total`
/// Labels: `event`
pub fn record_event_dropped(event: &str) {
    counter!("cast_events_dropped_total", "event" => event.to_string()).increment(1);
}

// ============================================================================
// Bridge Metrics
// ============================================================================

/// Record the outcome of a start-compositing request.
///
/// Metric: `cast_bridge_starts_total`
/// Labels: `outcome`
pub fn record_bridge_start(outcome: &str) {
    counter!("cast_bridge_starts_total", "outcome" => outcome.to_string()).increment(1);
}

/// Metric: `cast_bridge_start_duration_seconds`
pub fn record_bridge_start_duration(duration: Duration) {
    histogram!("cast_bridge_start_duration_seconds").record(duration.as_secs_f64());
}

/// Metric: `cast_bridge_streams`
pub fn set_bridge_streams(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("cast_bridge_streams").set(count as f64);
}

/// Record an encoder spawn attempt.
///
/// Metric: `cast_encoder_spawn_attempts_total`
/// Labels: `outcome` (ready, failed, timeout)
pub fn record_encoder_spawn(outcome: &str) {
    counter!("cast_encoder_spawn_attempts_total", "outcome" => outcome.to_string()).increment(1);
}

/// Metric: `cast_encoder_exits_total`
pub fn record_encoder_exit(expected: bool) {
    counter!("cast_encoder_exits_total", "expected" => expected.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::DebuggingRecorder;

    // These execute the recording functions against the global no-op
    // recorder; values are not asserted.

    #[test]
    fn test_gauges() {
        set_sessions_active(0);
        set_sessions_active(2);
        set_producers_active(4);
        set_actor_mailbox_depth("session", 3);
        set_bridge_streams(4);
    }

    #[test]
    fn test_counters_and_histograms() {
        record_signaling_request("produce", "success", Duration::from_millis(3));
        record_signaling_request("consume", "timeout", Duration::from_secs(10));
        record_event_dropped("new-producer");
        record_bridge_start("not_ready");
        record_bridge_start_duration(Duration::from_secs(2));
        record_encoder_spawn("ready");
        record_encoder_exit(false);
        record_actor_panic("session");
    }

    #[test]
    fn test_metric_names_use_service_prefix() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        // Local recorder: no interference with other tests
        metrics::with_local_recorder(&recorder, || {
            set_sessions_active(2);
            record_signaling_request("produce", "success", Duration::from_millis(3));
            record_event_dropped("new-producer");
            record_bridge_start("started");
            record_encoder_spawn("ready");
        });

        let names: Vec<String> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, _)| key.key().name().to_string())
            .collect();

        assert!(names.len() >= 6, "expected every metric recorded, got {names:?}");
        assert!(names.iter().all(|name| name.starts_with("cast_")), "{names:?}");
        assert!(names.contains(&"cast_signaling_latency_seconds".to_string()));
    }
}
