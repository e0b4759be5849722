//! Signaling WebSocket (`GET /room`).
//!
//! One socket per peer. Upgrading registers a fresh peer; the connection
//! actor owns the write half and sends `welcome` first, then the room's
//! events. This handler keeps the read half: client frames are ignored, and
//! a close, a read error or the connection actor giving up unregisters the
//! peer.

use crate::actors::EventSink;
use crate::errors::RoomError;
use crate::routes::AppState;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use common::events::ServerFrame;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Handler for GET /room
pub async fn room_socket(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

/// Write half of a signaling socket.
struct WebSocketSink {
    sender: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl EventSink for WebSocketSink {
    async fn deliver(&mut self, frame: &ServerFrame) -> Result<(), RoomError> {
        let text = serde_json::to_string(frame)
            .map_err(|e| RoomError::Internal(format!("frame encode failed: {e}")))?;
        self.sender
            .send(Message::Text(text))
            .await
            .map_err(|e| RoomError::Internal(format!("socket write failed: {e}")))
    }

    async fn close(&mut self, reason: &str) {
        let frame = CloseFrame {
            code: close_code::AWAY,
            reason: reason.to_string().into(),
        };
        // The peer may already be gone.
        let _ = self.sender.send(Message::Close(Some(frame))).await;
        let _ = self.sender.close().await;
    }
}

async fn handle_socket(state: Arc<AppState>, socket: WebSocket) {
    let (sender, mut receiver) = socket.split();

    let (peer_id, connection) = match state
        .negotiator
        .connect_peer(Box::new(WebSocketSink { sender }))
        .await
    {
        Ok(joined) => joined,
        Err(e) => {
            warn!(target: "room.signaling", error = %e, "Failed to register peer");
            return;
        }
    };

    info!(target: "room.signaling", peer_id = %peer_id, "Signaling connection opened");

    loop {
        tokio::select! {
            () = connection.closed() => {
                debug!(
                    target: "room.signaling",
                    peer_id = %peer_id,
                    "Connection actor closed the socket"
                );
                break;
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(
                            target: "room.signaling",
                            peer_id = %peer_id,
                            error = %e,
                            "Socket read failed"
                        );
                        break;
                    }
                    // Client frames carry nothing the room acts on.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    if let Err(e) = state.negotiator.disconnect_peer(&peer_id).await {
        warn!(
            target: "room.signaling",
            peer_id = %peer_id,
            error = %e,
            "Failed to unregister peer"
        );
    }
    info!(target: "room.signaling", peer_id = %peer_id, "Signaling connection closed");
}
