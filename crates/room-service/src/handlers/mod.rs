//! HTTP and WebSocket handlers for the room service.

pub mod media;
pub mod metrics;
pub mod peers;
pub mod signaling;

pub use media::{
    capabilities, control, control_consumer, control_producer, create_transport,
    transport_connect, transport_consume, transport_produce,
};
pub use metrics::metrics_handler;
pub use peers::list_peers;
pub use signaling::room_socket;

use crate::errors::RoomError;
use serde::de::DeserializeOwned;

/// Deserialize a JSON body by hand so a malformed body is a 400 with the
/// error envelope instead of axum's default 422.
pub(crate) fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, RoomError> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::debug!(target: "room.handlers", error = %e, "Invalid request body");
        RoomError::BadRequest(format!("Invalid request body: {e}"))
    })
}
