//! Signaling stream client.
//!
//! Opens the `/room` WebSocket, reads the `welcome` frame to learn the
//! participant's own id, then yields [`PeerChangeEvent`]s in the order the
//! server wrote them.

use crate::errors::ClientError;
use common::events::{PeerChangeEvent, ServerFrame};
use common::types::PeerId;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Decode one text frame.
pub fn parse_frame(text: &str) -> Result<ServerFrame, ClientError> {
    serde_json::from_str(text)
        .map_err(|e| ClientError::Protocol(format!("invalid signaling frame: {e}")))
}

/// An open signaling connection.
pub struct SignalingStream {
    socket: Socket,
    peer_id: PeerId,
}

impl SignalingStream {
    /// Connect and wait for the `welcome` frame.
    ///
    /// # Errors
    ///
    /// - `ClientError::Transport` if the socket cannot be opened
    /// - `ClientError::Protocol` if the first frame is not `welcome`
    pub async fn connect(ws_url: &str) -> Result<Self, ClientError> {
        let (mut socket, _response) = connect_async(ws_url).await?;

        let peer_id = loop {
            match next_frame(&mut socket).await? {
                Some(ServerFrame::Welcome { socket_id }) => break socket_id,
                Some(other) => {
                    return Err(ClientError::Protocol(format!(
                        "expected welcome, got {other:?}"
                    )))
                }
                None => {
                    return Err(ClientError::Transport(
                        "socket closed before welcome".to_string(),
                    ))
                }
            }
        };

        info!(target: "client.signaling", peer_id = %peer_id, url = ws_url, "Signaling connected");
        Ok(Self { socket, peer_id })
    }

    /// Own id assigned by the server.
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Next change event; `None` once the server closed the stream.
    ///
    /// # Errors
    ///
    /// Socket failures and undecodable frames. A second `welcome` is a
    /// protocol error.
    pub async fn next_event(&mut self) -> Result<Option<PeerChangeEvent>, ClientError> {
        match next_frame(&mut self.socket).await? {
            Some(ServerFrame::Welcome { .. }) => Err(ClientError::Protocol(
                "welcome received twice".to_string(),
            )),
            Some(frame) => Ok(frame.into_change()),
            None => Ok(None),
        }
    }

    /// Close the socket.
    pub async fn close(mut self) {
        // The server may already have dropped it.
        let _ = self.socket.close(None).await;
    }
}

async fn next_frame(socket: &mut Socket) -> Result<Option<ServerFrame>, ClientError> {
    while let Some(message) = socket.next().await {
        match message? {
            Message::Text(text) => return parse_frame(&text).map(Some),
            Message::Close(frame) => {
                debug!(target: "client.signaling", ?frame, "Server closed signaling socket");
                return Ok(None);
            }
            Message::Ping(payload) => {
                socket.send(Message::Pong(payload)).await?;
            }
            Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {}
        }
    }
    Ok(None)
}
