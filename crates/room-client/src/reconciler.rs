//! Subscription reconciliation.
//!
//! A participant learns about the room from two sources that progress
//! independently: one snapshot (`GET /peers`) and the live event stream.
//! [`Reconciler`] merges them into the mirror, `remote peer -> consumers`,
//! so that once things settle each remote peer has exactly one consumer per
//! producer the server knows about, whatever order the inputs arrived in.
//!
//! The reconciler is a plain state machine: it never does I/O. Each input
//! returns the [`Command`]s (consume, close) the caller must carry out, and
//! the outcome of every consume is fed back in. Callers must serialize
//! inputs, which [`crate::actor::ReconcilerActor`] does.
//!
//! Rules:
//! - Until the snapshot is applied, `new-producer` for a peer whose
//!   `peer-join` has not been seen is buffered, not consumed.
//! - Applying the snapshot unions each peer's listed producers with the
//!   buffered ones, deduplicated by producer id. It is applied once.
//! - After that, each producer id is consumed at most once; repeats are no-ops.
//! - `peer-left` wins: the peer's entry is dropped and a consume response
//!   arriving later is closed instead of inserted.
//! - A failed consume is kept in the view with its retryable flag.
//! - Every change bumps the version of the published view.

use crate::errors::ClientError;
use common::events::PeerChangeEvent;
use common::protocol::{ConsumerDescriptor, PeerSnapshot};
use common::types::{ConsumerId, PeerId, ProducerId};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, info, warn};

/// Work the caller must perform on behalf of the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Subscribe to a producer of `peer_id`.
    Consume {
        peer_id: PeerId,
        producer_id: ProducerId,
    },
    /// Close a consumer nobody wants any more.
    CloseConsumer {
        peer_id: PeerId,
        consumer_id: ConsumerId,
    },
}

/// A consume that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedConsume {
    pub peer_id: PeerId,
    pub producer_id: ProducerId,
    pub error: ClientError,
    pub retryable: bool,
}

/// Mirror entry for one remote peer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemotePeer {
    /// Active consumers, keyed by the producer they consume.
    pub consumers: BTreeMap<ProducerId, ConsumerDescriptor>,
    /// Producers with a consume call in flight.
    pub in_flight: BTreeSet<ProducerId>,
}

impl RemotePeer {
    fn knows(&self, producer_id: &ProducerId) -> bool {
        self.consumers.contains_key(producer_id) || self.in_flight.contains(producer_id)
    }
}

/// Immutable view of the mirror, published after every change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MirrorView {
    /// Increases by one with every change.
    pub version: u64,
    pub snapshot_applied: bool,
    pub peers: BTreeMap<PeerId, RemotePeer>,
    pub failed: Vec<FailedConsume>,
}

impl MirrorView {
    /// Total number of active consumers across every peer.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.peers.values().map(|p| p.consumers.len()).sum()
    }

    /// Whether no consume call is outstanding.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.peers.values().all(|p| p.in_flight.is_empty())
    }
}

/// Single-writer reconciliation state.
#[derive(Debug)]
pub struct Reconciler {
    self_id: PeerId,
    snapshot_applied: bool,
    peers: BTreeMap<PeerId, RemotePeer>,
    /// Producers seen via events before the snapshot, for peers without a join.
    pending: BTreeMap<PeerId, BTreeSet<ProducerId>>,
    failed: BTreeMap<ProducerId, FailedConsume>,
    /// Connection ids are never reused, so a departed peer stays departed.
    departed: HashSet<PeerId>,
    version: u64,
}

impl Reconciler {
    #[must_use]
    pub fn new(self_id: PeerId) -> Self {
        Self {
            self_id,
            snapshot_applied: false,
            peers: BTreeMap::new(),
            pending: BTreeMap::new(),
            failed: BTreeMap::new(),
            departed: HashSet::new(),
            version: 0,
        }
    }

    #[must_use]
    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn snapshot_applied(&self) -> bool {
        self.snapshot_applied
    }

    /// Producer ids buffered for `peer_id` while waiting for the snapshot.
    #[must_use]
    pub fn pending_for(&self, peer_id: &PeerId) -> Vec<ProducerId> {
        self.pending
            .get(peer_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Copy of the current state for observers.
    #[must_use]
    pub fn view(&self) -> MirrorView {
        MirrorView {
            version: self.version,
            snapshot_applied: self.snapshot_applied,
            peers: self.peers.clone(),
            failed: self.failed.values().cloned().collect(),
        }
    }

    fn touch(&mut self) {
        self.version += 1;
    }

    /// Apply one signaling event.
    pub fn apply_event(&mut self, event: PeerChangeEvent) -> Vec<Command> {
        if event.peer_id() == &self.self_id {
            return Vec::new();
        }
        match event {
            PeerChangeEvent::PeerJoin { socket_id } => self.on_peer_join(socket_id),
            PeerChangeEvent::PeerLeft { socket_id } => self.on_peer_left(&socket_id),
            PeerChangeEvent::NewProducer {
                socket_id,
                producer_id,
            } => self.on_new_producer(socket_id, producer_id),
        }
    }

    fn on_peer_join(&mut self, peer_id: PeerId) -> Vec<Command> {
        if self.departed.contains(&peer_id) || self.peers.contains_key(&peer_id) {
            return Vec::new();
        }
        debug!(target: "client.reconciler", peer_id = %peer_id, "Peer joined");
        self.peers.insert(peer_id, RemotePeer::default());
        self.touch();
        Vec::new()
    }

    fn on_peer_left(&mut self, peer_id: &PeerId) -> Vec<Command> {
        self.departed.insert(peer_id.clone());
        let had_entry = self.peers.remove(peer_id).is_some();
        let had_pending = self.pending.remove(peer_id).is_some();
        let failed_before = self.failed.len();
        self.failed.retain(|_, f| &f.peer_id != peer_id);

        if had_entry || had_pending || failed_before != self.failed.len() {
            info!(target: "client.reconciler", peer_id = %peer_id, "Peer left");
            self.touch();
        }
        Vec::new()
    }

    fn on_new_producer(&mut self, peer_id: PeerId, producer_id: ProducerId) -> Vec<Command> {
        if self.departed.contains(&peer_id) {
            return Vec::new();
        }

        if !self.snapshot_applied && !self.peers.contains_key(&peer_id) {
            // No join context yet: wait for the snapshot to vouch for the peer.
            let inserted = self
                .pending
                .entry(peer_id.clone())
                .or_default()
                .insert(producer_id.clone());
            if inserted {
                debug!(
                    target: "client.reconciler",
                    peer_id = %peer_id,
                    producer_id = %producer_id,
                    "Buffered producer until snapshot"
                );
                self.touch();
            }
            return Vec::new();
        }

        let command = self.request_consume(peer_id, producer_id);
        if command.is_some() {
            self.touch();
        }
        command.into_iter().collect()
    }

    /// Apply the snapshot. Only the first call has any effect.
    pub fn apply_snapshot(&mut self, snapshot: Vec<PeerSnapshot>) -> Vec<Command> {
        if self.snapshot_applied {
            debug!(target: "client.reconciler", "Snapshot already applied, ignoring");
            return Vec::new();
        }
        self.snapshot_applied = true;

        let mut wanted: BTreeMap<PeerId, BTreeSet<ProducerId>> = std::mem::take(&mut self.pending);
        for peer in snapshot {
            if peer.socket_id == self.self_id || self.departed.contains(&peer.socket_id) {
                continue;
            }
            wanted
                .entry(peer.socket_id)
                .or_default()
                .extend(peer.producers);
        }

        let mut commands = Vec::new();
        for (peer_id, producers) in wanted {
            self.peers.entry(peer_id.clone()).or_default();
            for producer_id in producers {
                commands.extend(self.request_consume(peer_id.clone(), producer_id));
            }
        }

        info!(
            target: "client.reconciler",
            peers = self.peers.len(),
            consumes = commands.len(),
            "Snapshot applied"
        );
        self.touch();
        commands
    }

    fn request_consume(&mut self, peer_id: PeerId, producer_id: ProducerId) -> Option<Command> {
        if self.failed.contains_key(&producer_id) {
            return None;
        }
        let peer = self.peers.entry(peer_id.clone()).or_default();
        if peer.knows(&producer_id) {
            return None;
        }
        peer.in_flight.insert(producer_id.clone());
        Some(Command::Consume {
            peer_id,
            producer_id,
        })
    }

    /// Record a successful consume.
    ///
    /// Returns a close command if the peer left while the call was in flight.
    pub fn on_consumed(&mut self, peer_id: &PeerId, descriptor: ConsumerDescriptor) -> Vec<Command> {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            info!(
                target: "client.reconciler",
                peer_id = %peer_id,
                consumer_id = %descriptor.id,
                "Consumer arrived after peer left, closing"
            );
            return vec![Command::CloseConsumer {
                peer_id: peer_id.clone(),
                consumer_id: descriptor.id,
            }];
        };

        peer.in_flight.remove(&descriptor.producer_id);
        if let Some(existing) = peer.consumers.get(&descriptor.producer_id) {
            if existing.id == descriptor.id {
                return Vec::new();
            }
            warn!(
                target: "client.reconciler",
                peer_id = %peer_id,
                producer_id = %descriptor.producer_id,
                consumer_id = %descriptor.id,
                "Second consumer for one producer, closing it"
            );
            return vec![Command::CloseConsumer {
                peer_id: peer_id.clone(),
                consumer_id: descriptor.id,
            }];
        }

        debug!(
            target: "client.reconciler",
            peer_id = %peer_id,
            producer_id = %descriptor.producer_id,
            consumer_id = %descriptor.id,
            "Consumer added"
        );
        peer.consumers
            .insert(descriptor.producer_id.clone(), descriptor);
        self.touch();
        Vec::new()
    }

    /// Record a failed consume. The producer is kept with its retryable flag.
    pub fn on_consume_failed(
        &mut self,
        peer_id: &PeerId,
        producer_id: &ProducerId,
        error: ClientError,
    ) {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            // The peer is gone; nothing left to retry.
            return;
        };
        peer.in_flight.remove(producer_id);

        let retryable = error.is_retryable();
        warn!(
            target: "client.reconciler",
            peer_id = %peer_id,
            producer_id = %producer_id,
            error = %error,
            retryable,
            "Consume failed"
        );
        self.failed.insert(
            producer_id.clone(),
            FailedConsume {
                peer_id: peer_id.clone(),
                producer_id: producer_id.clone(),
                error,
                retryable,
            },
        );
        self.touch();
    }

    /// Re-issue every retryable failed consume.
    pub fn retry_failed(&mut self) -> Vec<Command> {
        let retry: Vec<FailedConsume> = self
            .failed
            .values()
            .filter(|f| f.retryable)
            .cloned()
            .collect();
        if retry.is_empty() {
            return Vec::new();
        }

        let mut commands = Vec::new();
        for failed in retry {
            self.failed.remove(&failed.producer_id);
            commands.extend(self.request_consume(failed.peer_id, failed.producer_id));
        }
        self.touch();
        commands
    }
}
