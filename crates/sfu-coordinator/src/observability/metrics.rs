//! Metrics definitions for the SFU coordinator.
//!
//! All metrics follow Prometheus naming conventions:
//! - `sfu_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `actor_type`: 3 values (registry, room, peer)
//! - `action`: bounded by the signaling protocol (~10 values)
//! - `operation`: bounded by media-engine calls (8 values)
//! - `status`: success, error, timeout
//! - `code`: bounded by error codes (7 values)

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize the Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if the Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Signaling round trips stay well under 100ms unless the engine is slow
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_message".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set message latency buckets: {e}"))?
        // Engine calls can take seconds before the timeout fires
        .set_buckets_for_metric(
            Matcher::Prefix("sfu_media_call".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000,
                10.000,
            ],
        )
        .map_err(|e| format!("Failed to set media call buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Room & Connection Metrics (Gauges)
// ============================================================================

/// Set the number of rooms held by the registry.
///
/// Metric: `sfu_rooms_active`
pub fn set_rooms_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_rooms_active").set(count as f64);
}

/// Set the number of open signaling connections.
///
/// Metric: `sfu_connections_active`
pub fn set_connections_active(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_connections_active").set(count as f64);
}

/// Set the mailbox depth for an actor type.
///
/// Metric: `sfu_actor_mailbox_depth`
/// Labels: `actor_type`
pub fn set_actor_mailbox_depth(actor_type: &str, depth: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("sfu_actor_mailbox_depth", "actor_type" => actor_type.to_string()).set(depth as f64);
}

// ============================================================================
// Latency Metrics (Histograms)
// ============================================================================

/// Record signaling message processing latency.
///
/// Metric: `sfu_message_latency_seconds`
/// Labels: `action`
pub fn record_message_latency(action: &str, duration: Duration) {
    histogram!("sfu_message_latency_seconds", "action" => action.to_string())
        .record(duration.as_secs_f64());
}

/// Record a media-engine call.
///
/// Metrics: `sfu_media_call_latency_seconds`, `sfu_media_calls_total`
/// Labels: `operation`, `status` (counter only)
pub fn record_media_call(operation: &str, status: &str, duration: Duration) {
    histogram!("sfu_media_call_latency_seconds", "operation" => operation.to_string())
        .record(duration.as_secs_f64());
    counter!(
        "sfu_media_calls_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

// ============================================================================
// Counters
// ============================================================================

/// Record a request rejected with an `error` message.
///
/// Metric: `sfu_rejections_total`
/// Labels: `code`
pub fn record_rejection(code: i32) {
    counter!("sfu_rejections_total", "code" => code.to_string()).increment(1);
}

/// Record a media-engine resource exhaustion.
///
/// Metric: `sfu_media_exhausted_total`
///
/// Operators should alert on any increase.
pub fn record_media_exhausted(operation: &str) {
    counter!("sfu_media_exhausted_total", "operation" => operation.to_string()).increment(1);
}

/// Record an outbound message dropped because a peer's queue was full.
///
/// Metric: `sfu_messages_dropped_total`
/// Labels: `actor_type`
pub fn record_message_dropped(actor_type: &str) {
    counter!("sfu_messages_dropped_total", "actor_type" => actor_type.to_string()).increment(1);
}

/// Record an actor task that ended in a panic.
///
/// Metric: `sfu_actor_panics_total`
/// Labels: `actor_type`
pub fn record_actor_panic(actor_type: &str) {
    counter!("sfu_actor_panics_total", "actor_type" => actor_type.to_string()).increment(1);
}

/// Record a room lifecycle event.
///
/// Metric: `sfu_room_events_total`
/// Labels: `event` (created, emptied, ended)
pub fn record_room_event(event: &str) {
    counter!("sfu_room_events_total", "event" => event.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // The recording functions must not panic without an installed recorder.
    #[test]
    fn test_gauges_without_recorder() {
        set_rooms_active(3);
        set_connections_active(12);
        set_actor_mailbox_depth("room", 7);
    }

    #[test]
    fn test_histograms_without_recorder() {
        record_message_latency("joinRoom", Duration::from_millis(4));
        record_media_call("produce", "success", Duration::from_millis(12));
        record_media_call("consume", "timeout", Duration::from_secs(10));
    }

    #[test]
    fn test_counters_without_recorder() {
        record_rejection(3);
        record_media_exhausted("createTransport");
        record_message_dropped("peer");
        record_actor_panic("room");
        record_room_event("created");
    }

    #[test]
    fn test_metrics_reach_installed_recorder() {
        use metrics_util::debugging::DebuggingRecorder;

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            set_rooms_active(2);
            record_rejection(7);
            record_media_call("consume", "timeout", Duration::from_secs(10));
        });

        let names: Vec<String> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, ..)| key.key().name().to_string())
            .collect();
        for expected in [
            "sfu_rooms_active",
            "sfu_rejections_total",
            "sfu_media_call_latency_seconds",
            "sfu_media_calls_total",
        ] {
            assert!(
                names.iter().any(|name| name == expected),
                "{expected} not recorded: {names:?}"
            );
        }
    }
}
