//! Snapshot endpoint.

use crate::errors::RoomError;
use crate::routes::AppState;
use axum::{extract::State, Json};
use common::protocol::PeerSnapshot;
use std::sync::Arc;
use tracing::instrument;

/// Handler for GET /peers
///
/// Point-in-time copy of every peer with its transport, producer and
/// consumer ids, in join order. Clients merge this with the event stream.
#[instrument(skip_all, name = "room.peers.list")]
pub async fn list_peers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<PeerSnapshot>>, RoomError> {
    let peers = state.negotiator.list_peers().await?;
    Ok(Json(peers))
}
