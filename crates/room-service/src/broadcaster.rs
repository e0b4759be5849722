//! Signaling broadcaster.
//!
//! Fans a [`PeerChangeEvent`] out to every subscribed connection except the
//! peer the event is about. Enqueueing never waits: a recipient whose queue
//! is full is cut off (its connection cancelled) so it reconnects and
//! re-snapshots instead of silently missing an event. Nothing is buffered
//! for peers that are not connected.

use crate::actors::{ConnectionActorHandle, DeliveryError};
use crate::observability;
use common::events::{PeerChangeEvent, ServerFrame};
use common::types::PeerId;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Outcome of one publish.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Recipients disconnected because their queue was full.
    pub overflowed: Vec<PeerId>,
}

/// Per-room fan-out state. Owned by the room actor.
#[derive(Debug, Default)]
pub struct Broadcaster {
    recipients: HashMap<PeerId, ConnectionActorHandle>,
    events_broadcast: u64,
    recipients_dropped: u64,
}

impl Broadcaster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, handle: ConnectionActorHandle) {
        self.recipients.insert(handle.peer_id().clone(), handle);
    }

    pub fn unsubscribe(&mut self, peer_id: &PeerId) -> Option<ConnectionActorHandle> {
        self.recipients.remove(peer_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }

    /// Total per-recipient deliveries so far.
    #[must_use]
    pub fn events_broadcast(&self) -> u64 {
        self.events_broadcast
    }

    /// Total recipients cut off for overflowing.
    #[must_use]
    pub fn recipients_dropped(&self) -> u64 {
        self.recipients_dropped
    }

    /// Remove every recipient, returning their handles.
    pub fn drain(&mut self) -> Vec<ConnectionActorHandle> {
        self.recipients.drain().map(|(_, h)| h).collect()
    }

    /// Enqueue `event` for everyone but its subject.
    pub fn publish(&mut self, event: &PeerChangeEvent) -> BroadcastReport {
        let origin = event.peer_id();
        let mut report = BroadcastReport::default();
        let mut gone = Vec::new();

        for (peer_id, handle) in &self.recipients {
            if peer_id == origin {
                continue;
            }
            match handle.try_deliver(ServerFrame::from(event.clone())) {
                Ok(()) => {
                    report.delivered += 1;
                    observability::record_event_broadcast(event.name());
                }
                Err(DeliveryError::Full) => {
                    warn!(
                        target: "room.signaling",
                        peer_id = %peer_id,
                        event = event.name(),
                        queued = handle.queued(),
                        "Recipient queue full, disconnecting"
                    );
                    handle.cancel();
                    observability::record_event_dropped();
                    report.overflowed.push(peer_id.clone());
                    gone.push(peer_id.clone());
                }
                Err(DeliveryError::Closed) => {
                    debug!(
                        target: "room.signaling",
                        peer_id = %peer_id,
                        "Recipient already closed"
                    );
                    gone.push(peer_id.clone());
                }
            }
        }

        for peer_id in gone {
            self.recipients.remove(&peer_id);
        }
        self.events_broadcast += report.delivered as u64;
        self.recipients_dropped += report.overflowed.len() as u64;

        debug!(
            target: "room.signaling",
            event = event.name(),
            origin = %origin,
            delivered = report.delivered,
            "Event broadcast"
        );
        report
    }
}
