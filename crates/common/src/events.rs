//! Signaling event stream messages.
//!
//! Frames on the `/room` WebSocket are JSON objects tagged by `event`:
//!
//! ```json
//! {"event": "welcome", "socketId": "…"}
//! {"event": "peer-join", "socketId": "…"}
//! {"event": "peer-left", "socketId": "…"}
//! {"event": "new-producer", "socketId": "…", "producerId": "…"}
//! ```
//!
//! `welcome` is sent exactly once, first, and carries the recipient's own id.

use crate::types::{PeerId, ProducerId};
use serde::{Deserialize, Serialize};

/// Immutable notification of a change in room membership or publications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum PeerChangeEvent {
    /// A peer connected.
    #[serde(rename_all = "camelCase")]
    PeerJoin { socket_id: PeerId },
    /// A peer disconnected and all of its producers are gone.
    #[serde(rename_all = "camelCase")]
    PeerLeft { socket_id: PeerId },
    /// A peer published a new stream.
    #[serde(rename_all = "camelCase")]
    NewProducer {
        socket_id: PeerId,
        producer_id: ProducerId,
    },
}

impl PeerChangeEvent {
    /// The peer this event is about.
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        match self {
            PeerChangeEvent::PeerJoin { socket_id }
            | PeerChangeEvent::PeerLeft { socket_id }
            | PeerChangeEvent::NewProducer { socket_id, .. } => socket_id,
        }
    }

    /// Returns the event name as a string for logs and metric labels.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            PeerChangeEvent::PeerJoin { .. } => "peer-join",
            PeerChangeEvent::PeerLeft { .. } => "peer-left",
            PeerChangeEvent::NewProducer { .. } => "new-producer",
        }
    }
}

/// Any frame the server writes to the signaling socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerFrame {
    /// First frame on every connection: the recipient's own id.
    #[serde(rename_all = "camelCase")]
    Welcome { socket_id: PeerId },
    #[serde(rename_all = "camelCase")]
    PeerJoin { socket_id: PeerId },
    #[serde(rename_all = "camelCase")]
    PeerLeft { socket_id: PeerId },
    #[serde(rename_all = "camelCase")]
    NewProducer {
        socket_id: PeerId,
        producer_id: ProducerId,
    },
}

impl ServerFrame {
    /// Convert to a change event; `None` for the welcome frame.
    #[must_use]
    pub fn into_change(self) -> Option<PeerChangeEvent> {
        match self {
            ServerFrame::Welcome { .. } => None,
            ServerFrame::PeerJoin { socket_id } => Some(PeerChangeEvent::PeerJoin { socket_id }),
            ServerFrame::PeerLeft { socket_id } => Some(PeerChangeEvent::PeerLeft { socket_id }),
            ServerFrame::NewProducer {
                socket_id,
                producer_id,
            } => Some(PeerChangeEvent::NewProducer {
                socket_id,
                producer_id,
            }),
        }
    }
}

impl From<PeerChangeEvent> for ServerFrame {
    fn from(event: PeerChangeEvent) -> Self {
        match event {
            PeerChangeEvent::PeerJoin { socket_id } => ServerFrame::PeerJoin { socket_id },
            PeerChangeEvent::PeerLeft { socket_id } => ServerFrame::PeerLeft { socket_id },
            PeerChangeEvent::NewProducer {
                socket_id,
                producer_id,
            } => ServerFrame::NewProducer {
                socket_id,
                producer_id,
            },
        }
    }
}
