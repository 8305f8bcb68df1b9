//! Observability for the SFU coordinator.
//!
//! All instrumentation uses `#[instrument(skip_all)]` with explicit fields.
//! Client payloads (SDP-like parameters, capabilities) are never logged.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `sfu_rooms_active` | Gauge | none | Rooms held by the registry |
//! | `sfu_connections_active` | Gauge | none | Open signaling connections |
//! | `sfu_actor_mailbox_depth` | Gauge | `actor_type` | Backpressure indicator |
//! | `sfu_message_latency_seconds` | Histogram | `action` | Signaling request handling time |
//! | `sfu_media_call_latency_seconds` | Histogram | `operation` | Media-engine call time |
//! | `sfu_media_calls_total` | Counter | `operation`, `status` | Media-engine call outcomes |
//! | `sfu_rejections_total` | Counter | `code` | `error` replies sent to peers |
//! | `sfu_media_exhausted_total` | Counter | `operation` | Engine resource exhaustion |
//! | `sfu_messages_dropped_total` | Counter | `actor_type` | Broadcasts dropped on full queues |
//! | `sfu_actor_panics_total` | Counter | `actor_type` | Actor tasks that panicked |
//! | `sfu_room_events_total` | Counter | `event` | Room created / emptied / ended |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState, Phase};
pub use metrics::{
    init_metrics_recorder, record_actor_panic, record_media_call, record_media_exhausted,
    record_message_dropped, record_message_latency, record_rejection, record_room_event,
    set_actor_mailbox_depth, set_connections_active, set_rooms_active,
};
