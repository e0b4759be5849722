//! Peer directory: the authoritative registry of who is in the room.
//!
//! One [`Peer`] per live signaling connection, holding at most one transport
//! per direction plus the producers and consumers the peer owns. The
//! directory only tracks references. It never talks to the media engine, so
//! every mutation that detaches engine entities hands them back to the caller
//! to close.
//!
//! The directory is owned by the room actor, which makes it the single writer.

use crate::errors::RoomError;
use chrono::{DateTime, Utc};
use common::protocol::{ConsumerDescriptor, PeerSnapshot};
use common::types::{
    ConsumerId, Direction, EntityKind, MediaKind, PeerId, ProducerId, TransportId,
};
use serde_json::Value;
use std::collections::HashMap;

/// A transport owned by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRecord {
    pub id: TransportId,
    pub direction: Direction,
    pub connected: bool,
}

impl TransportRecord {
    /// A freshly created, not yet connected transport.
    #[must_use]
    pub fn new(id: TransportId, direction: Direction) -> Self {
        Self {
            id,
            direction,
            connected: false,
        }
    }
}

/// A published stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub transport_id: TransportId,
    pub paused: bool,
}

/// A subscription to another peer's producer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerRecord {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub transport_id: TransportId,
    pub rtp_parameters: Value,
    pub paused: bool,
}

impl ConsumerRecord {
    /// Wire descriptor returned by `transport_consume`.
    #[must_use]
    pub fn descriptor(&self) -> ConsumerDescriptor {
        ConsumerDescriptor {
            id: self.id.clone(),
            producer_id: self.producer_id.clone(),
            kind: self.kind,
            rtp_parameters: self.rtp_parameters.clone(),
            paused: self.paused,
        }
    }
}

/// A connected participant.
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub id: PeerId,
    pub joined_at: DateTime<Utc>,
    pub send_transport: Option<TransportRecord>,
    pub recv_transport: Option<TransportRecord>,
    pub producers: Vec<ProducerRecord>,
    pub consumers: Vec<ConsumerRecord>,
    join_seq: u64,
}

impl Peer {
    fn new(id: PeerId, join_seq: u64) -> Self {
        Self {
            id,
            joined_at: Utc::now(),
            send_transport: None,
            recv_transport: None,
            producers: Vec::new(),
            consumers: Vec::new(),
            join_seq,
        }
    }

    /// The peer's transport for `direction`, if any.
    #[must_use]
    pub fn transport(&self, direction: Direction) -> Option<&TransportRecord> {
        match direction {
            Direction::Send => self.send_transport.as_ref(),
            Direction::Recv => self.recv_transport.as_ref(),
        }
    }

    fn transport_mut(&mut self, direction: Direction) -> &mut Option<TransportRecord> {
        match direction {
            Direction::Send => &mut self.send_transport,
            Direction::Recv => &mut self.recv_transport,
        }
    }

    /// Existing consumer of `producer_id`, if this peer already subscribed.
    #[must_use]
    pub fn consumer_of(&self, producer_id: &ProducerId) -> Option<&ConsumerRecord> {
        self.consumers.iter().find(|c| &c.producer_id == producer_id)
    }

    /// Time since the peer registered.
    #[must_use]
    pub fn connected_for(&self) -> chrono::Duration {
        Utc::now().signed_duration_since(self.joined_at)
    }

    /// Whether this peer owns the producer.
    #[must_use]
    pub fn owns_producer(&self, producer_id: &ProducerId) -> bool {
        self.producers.iter().any(|p| &p.id == producer_id)
    }

    /// Whether this peer owns the consumer.
    #[must_use]
    pub fn owns_consumer(&self, consumer_id: &ConsumerId) -> bool {
        self.consumers.iter().any(|c| &c.id == consumer_id)
    }

    /// Point-in-time wire view.
    #[must_use]
    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            socket_id: self.id.clone(),
            produce_transport: self.send_transport.as_ref().map(|t| t.id.clone()),
            consume_transport: self.recv_transport.as_ref().map(|t| t.id.clone()),
            producers: self.producers.iter().map(|p| p.id.clone()).collect(),
            consumers: self.consumers.iter().map(|c| c.id.clone()).collect(),
        }
    }
}

/// Consumer records of other peers that referenced a removed producer.
pub type OrphanedConsumers = Vec<(PeerId, ConsumerRecord)>;

/// What `unregister` took out of the directory.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRemoval {
    pub peer: Peer,
    pub orphaned_consumers: OrphanedConsumers,
}

/// What `set_transport` displaced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportReplacement {
    pub previous: Option<TransportRecord>,
    pub detached_producers: Vec<ProducerRecord>,
    pub detached_consumers: Vec<ConsumerRecord>,
    pub orphaned_consumers: OrphanedConsumers,
}

/// What `remove_producer` took out of the directory.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerRemoval {
    pub producer: ProducerRecord,
    pub orphaned_consumers: OrphanedConsumers,
}

/// The room's peer registry.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: HashMap<PeerId, Peer>,
    next_seq: u64,
}

fn peer_not_found(peer_id: &PeerId) -> RoomError {
    RoomError::NotFound(format!("Peer {peer_id} not found"))
}

impl PeerDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    #[must_use]
    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Add a peer. Fails with `Conflict` if the id is already present.
    pub fn register(&mut self, peer_id: PeerId) -> Result<(), RoomError> {
        if self.peers.contains_key(&peer_id) {
            return Err(RoomError::Conflict(format!(
                "Peer {peer_id} already registered"
            )));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.peers.insert(peer_id.clone(), Peer::new(peer_id, seq));
        Ok(())
    }

    /// Remove a peer and every consumer other peers held on its producers.
    ///
    /// Returns `None` if the peer was not present.
    pub fn unregister(&mut self, peer_id: &PeerId) -> Option<PeerRemoval> {
        let peer = self.peers.remove(peer_id)?;
        let producer_ids: Vec<ProducerId> = peer.producers.iter().map(|p| p.id.clone()).collect();
        let orphaned_consumers = self.detach_consumers_of(&producer_ids);
        Some(PeerRemoval {
            peer,
            orphaned_consumers,
        })
    }

    /// Remove every peer, in join order.
    ///
    /// Consumers of a departing producer are reported once: either under
    /// their owner's removal or as an orphan of an earlier one, never both.
    pub fn unregister_all(&mut self) -> Vec<PeerRemoval> {
        let mut ids: Vec<(u64, PeerId)> = self
            .peers
            .values()
            .map(|p| (p.join_seq, p.id.clone()))
            .collect();
        ids.sort_by_key(|(seq, _)| *seq);
        ids.into_iter()
            .filter_map(|(_, id)| self.unregister(&id))
            .collect()
    }

    /// Store a transport, replacing any previous one of the same direction.
    ///
    /// Producers or consumers bound to the replaced transport are detached
    /// and returned along with it. Closing them is the caller's job.
    pub fn set_transport(
        &mut self,
        peer_id: &PeerId,
        record: TransportRecord,
    ) -> Result<TransportReplacement, RoomError> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| peer_not_found(peer_id))?;

        let direction = record.direction;
        let previous = peer.transport_mut(direction).replace(record);
        let mut replacement = TransportReplacement {
            previous,
            ..TransportReplacement::default()
        };

        if let Some(old) = &replacement.previous {
            match direction {
                Direction::Send => {
                    let (gone, kept): (Vec<ProducerRecord>, Vec<ProducerRecord>) =
                        std::mem::take(&mut peer.producers)
                        .into_iter()
                        .partition(|p| p.transport_id == old.id);
                    peer.producers = kept;
                    replacement.detached_producers = gone;
                }
                Direction::Recv => {
                    let (gone, kept): (Vec<ConsumerRecord>, Vec<ConsumerRecord>) =
                        std::mem::take(&mut peer.consumers)
                        .into_iter()
                        .partition(|c| c.transport_id == old.id);
                    peer.consumers = kept;
                    replacement.detached_consumers = gone;
                }
            }
        }

        if !replacement.detached_producers.is_empty() {
            let ids: Vec<ProducerId> = replacement
                .detached_producers
                .iter()
                .map(|p| p.id.clone())
                .collect();
            replacement.orphaned_consumers = self.detach_consumers_of(&ids);
        }

        Ok(replacement)
    }

    /// Record that the transport finished its DTLS handshake.
    pub fn mark_connected(
        &mut self,
        peer_id: &PeerId,
        direction: Direction,
        transport_id: &TransportId,
    ) -> Result<(), RoomError> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| peer_not_found(peer_id))?;
        match peer.transport_mut(direction) {
            Some(t) if &t.id == transport_id => {
                t.connected = true;
                Ok(())
            }
            _ => Err(RoomError::NotFound(format!(
                "No {direction} transport {transport_id} for peer {peer_id}"
            ))),
        }
    }

    /// Append a producer to its owner.
    ///
    /// The producer's transport must still be the peer's send transport.
    pub fn add_producer(
        &mut self,
        peer_id: &PeerId,
        record: ProducerRecord,
    ) -> Result<(), RoomError> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| peer_not_found(peer_id))?;
        if peer.send_transport.as_ref().map(|t| &t.id) != Some(&record.transport_id) {
            return Err(RoomError::NotFound(format!(
                "Send transport {} no longer belongs to peer {peer_id}",
                record.transport_id
            )));
        }
        if peer.owns_producer(&record.id) {
            return Err(RoomError::Conflict(format!(
                "Producer {} already registered",
                record.id
            )));
        }
        peer.producers.push(record);
        Ok(())
    }

    /// Append a consumer to its subscriber.
    ///
    /// The consumed producer must still exist in the room and the subscriber
    /// must not already hold a consumer of it.
    pub fn add_consumer(
        &mut self,
        peer_id: &PeerId,
        record: ConsumerRecord,
    ) -> Result<(), RoomError> {
        if self.find_producer(&record.producer_id).is_none() {
            return Err(RoomError::NotFound(format!(
                "Producer {} not found",
                record.producer_id
            )));
        }
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| peer_not_found(peer_id))?;
        if peer.recv_transport.as_ref().map(|t| &t.id) != Some(&record.transport_id) {
            return Err(RoomError::NotFound(format!(
                "Receive transport {} no longer belongs to peer {peer_id}",
                record.transport_id
            )));
        }
        if peer.consumer_of(&record.producer_id).is_some() {
            return Err(RoomError::Conflict(format!(
                "Peer {peer_id} already consumes producer {}",
                record.producer_id
            )));
        }
        peer.consumers.push(record);
        Ok(())
    }

    /// Remove a producer from its owner, detaching everyone's consumers of it.
    pub fn remove_producer(
        &mut self,
        peer_id: &PeerId,
        producer_id: &ProducerId,
    ) -> Result<ProducerRemoval, RoomError> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| peer_not_found(peer_id))?;
        let idx = peer
            .producers
            .iter()
            .position(|p| &p.id == producer_id)
            .ok_or_else(|| RoomError::NotFound(format!("Producer {producer_id} not found")))?;
        let producer = peer.producers.remove(idx);
        let orphaned_consumers = self.detach_consumers_of(std::slice::from_ref(producer_id));
        Ok(ProducerRemoval {
            producer,
            orphaned_consumers,
        })
    }

    /// Remove one of the peer's consumers.
    pub fn remove_consumer(
        &mut self,
        peer_id: &PeerId,
        consumer_id: &ConsumerId,
    ) -> Result<ConsumerRecord, RoomError> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| peer_not_found(peer_id))?;
        let idx = peer
            .consumers
            .iter()
            .position(|c| &c.id == consumer_id)
            .ok_or_else(|| RoomError::NotFound(format!("Consumer {consumer_id} not found")))?;
        Ok(peer.consumers.remove(idx))
    }

    /// Flip the paused flag of a producer or consumer the peer owns.
    pub fn set_paused(
        &mut self,
        peer_id: &PeerId,
        kind: EntityKind,
        entity_id: &str,
        paused: bool,
    ) -> Result<(), RoomError> {
        let peer = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| peer_not_found(peer_id))?;
        let flag = match kind {
            EntityKind::Producer => peer
                .producers
                .iter_mut()
                .find(|p| p.id.as_str() == entity_id)
                .map(|p| &mut p.paused),
            EntityKind::Consumer => peer
                .consumers
                .iter_mut()
                .find(|c| c.id.as_str() == entity_id)
                .map(|c| &mut c.paused),
        };
        match flag {
            Some(flag) => {
                *flag = paused;
                Ok(())
            }
            None => Err(RoomError::NotFound(format!(
                "{} {entity_id} not found",
                kind.as_str()
            ))),
        }
    }

    /// Copy of every peer, in join order.
    #[must_use]
    pub fn list_peers(&self) -> Vec<PeerSnapshot> {
        let mut peers: Vec<&Peer> = self.peers.values().collect();
        peers.sort_by_key(|p| p.join_seq);
        peers.into_iter().map(Peer::snapshot).collect()
    }

    #[must_use]
    pub fn find_peer(&self, peer_id: &PeerId) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    /// Locate a producer anywhere in the room.
    #[must_use]
    pub fn find_producer(&self, producer_id: &ProducerId) -> Option<(&PeerId, &ProducerRecord)> {
        self.peers.values().find_map(|peer| {
            peer.producers
                .iter()
                .find(|p| &p.id == producer_id)
                .map(|p| (&peer.id, p))
        })
    }

    fn detach_consumers_of(&mut self, producer_ids: &[ProducerId]) -> OrphanedConsumers {
        if producer_ids.is_empty() {
            return Vec::new();
        }
        let mut orphaned = Vec::new();
        for peer in self.peers.values_mut() {
            let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut peer.consumers)
                .into_iter()
                .partition(|c| producer_ids.contains(&c.producer_id));
            peer.consumers = kept;
            orphaned.extend(gone.into_iter().map(|c| (peer.id.clone(), c)));
        }
        orphaned
    }
}
