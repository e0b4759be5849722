//! Message types for actor communication.
//!
//! Requests to the room actor carry a `oneshot` sender for the reply.

use crate::directory::{
    ConsumerRecord, Peer, PeerRemoval, ProducerRecord, ProducerRemoval, TransportRecord,
    TransportReplacement,
};
use crate::errors::RoomError;

use super::connection::{ConnectionActorHandle, EventSink};

use common::events::ServerFrame;
use common::protocol::PeerSnapshot;
use common::types::{ConsumerId, Direction, EntityKind, PeerId, ProducerId, TransportId};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};

/// Per-peer negotiation lock.
pub type PeerLock = Arc<Mutex<()>>;

/// Messages sent to `RoomActor`.
pub enum RoomMessage {
    /// Register a peer and start its connection actor.
    Join {
        peer_id: PeerId,
        sink: Box<dyn EventSink>,
        respond_to: oneshot::Sender<Result<ConnectionActorHandle, RoomError>>,
    },

    /// Remove a peer. `None` if it was already gone.
    Leave {
        peer_id: PeerId,
        respond_to: oneshot::Sender<Option<PeerRemoval>>,
    },

    /// Fetch the peer's negotiation lock.
    PeerLock {
        peer_id: PeerId,
        respond_to: oneshot::Sender<Option<PeerLock>>,
    },

    SetTransport {
        peer_id: PeerId,
        record: TransportRecord,
        respond_to: oneshot::Sender<Result<TransportReplacement, RoomError>>,
    },

    MarkConnected {
        peer_id: PeerId,
        direction: Direction,
        transport_id: TransportId,
        respond_to: oneshot::Sender<Result<(), RoomError>>,
    },

    /// Append a producer and broadcast `new-producer` before replying.
    AddProducer {
        peer_id: PeerId,
        record: ProducerRecord,
        respond_to: oneshot::Sender<Result<(), RoomError>>,
    },

    AddConsumer {
        peer_id: PeerId,
        record: ConsumerRecord,
        respond_to: oneshot::Sender<Result<(), RoomError>>,
    },

    RemoveProducer {
        peer_id: PeerId,
        producer_id: ProducerId,
        respond_to: oneshot::Sender<Result<ProducerRemoval, RoomError>>,
    },

    RemoveConsumer {
        peer_id: PeerId,
        consumer_id: ConsumerId,
        respond_to: oneshot::Sender<Result<ConsumerRecord, RoomError>>,
    },

    SetPaused {
        peer_id: PeerId,
        kind: EntityKind,
        entity_id: String,
        paused: bool,
        respond_to: oneshot::Sender<Result<(), RoomError>>,
    },

    /// Copy of one peer.
    FindPeer {
        peer_id: PeerId,
        respond_to: oneshot::Sender<Option<Peer>>,
    },

    /// Locate a producer anywhere in the room.
    FindProducer {
        producer_id: ProducerId,
        respond_to: oneshot::Sender<Option<(PeerId, ProducerRecord)>>,
    },

    ListPeers {
        respond_to: oneshot::Sender<Vec<PeerSnapshot>>,
    },

    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },

    /// Retire every peer, stop the connection actors and exit. The reply
    /// carries what each retired peer still owns in the engine.
    Shutdown {
        respond_to: oneshot::Sender<Vec<PeerRemoval>>,
    },
}

impl fmt::Debug for RoomMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoomMessage::Join { .. } => "Join",
            RoomMessage::Leave { .. } => "Leave",
            RoomMessage::PeerLock { .. } => "PeerLock",
            RoomMessage::SetTransport { .. } => "SetTransport",
            RoomMessage::MarkConnected { .. } => "MarkConnected",
            RoomMessage::AddProducer { .. } => "AddProducer",
            RoomMessage::AddConsumer { .. } => "AddConsumer",
            RoomMessage::RemoveProducer { .. } => "RemoveProducer",
            RoomMessage::RemoveConsumer { .. } => "RemoveConsumer",
            RoomMessage::SetPaused { .. } => "SetPaused",
            RoomMessage::FindPeer { .. } => "FindPeer",
            RoomMessage::FindProducer { .. } => "FindProducer",
            RoomMessage::ListPeers { .. } => "ListPeers",
            RoomMessage::GetState { .. } => "GetState",
            RoomMessage::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

/// Messages sent to `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Write a frame to the connection.
    Deliver { frame: ServerFrame },

    /// Close the connection after everything queued before it.
    Close { reason: String },

    /// Liveness round trip.
    Ping { respond_to: oneshot::Sender<()> },
}

/// Room status for health checks and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomState {
    pub peers: usize,
    pub connections: usize,
    pub events_broadcast: u64,
    pub recipients_dropped: u64,
}
