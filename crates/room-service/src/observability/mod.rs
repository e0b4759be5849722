//! Observability for the room service.
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `room_peers_active` | Gauge | none | Registered peers |
//! | `room_events_broadcast_total` | Counter | `event` | Events enqueued to recipients |
//! | `room_events_dropped_total` | Counter | none | Recipients cut off for a full queue |
//! | `room_negotiation_total` | Counter | `operation`, `status` | Negotiation outcomes |
//! | `room_negotiation_duration_seconds` | Histogram | `operation` | Negotiation latency |
//! | `room_actor_panics_total` | Counter | `actor_type` | Actor task panics |
//! | `room_http_requests_total` | Counter | `method`, `endpoint`, `status_code` | HTTP requests |
//! | `room_http_request_duration_seconds` | Histogram | `method`, `endpoint`, `status` | HTTP latency |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::{
    detached_metrics_handle, init_metrics_recorder, record_actor_panic, record_event_broadcast,
    record_event_dropped, record_http_request, record_negotiation, set_peers_active,
};
