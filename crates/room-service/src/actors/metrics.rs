//! Mailbox depth tracking and service-wide actor counters.
//!
//! The room actor serializes every join, leave and commit, so its mailbox is
//! the one that backs up first under a join storm. Connection mailboxes only
//! hold outbound event frames for a single peer.

use crate::observability;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Depth above which a mailbox is elevated, and above which it is critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthThresholds {
    pub elevated: usize,
    pub critical: usize,
}

impl DepthThresholds {
    pub const ROOM: Self = Self {
        elevated: 100,
        critical: 500,
    };
    pub const CONNECTION: Self = Self {
        elevated: 50,
        critical: 200,
    };

    #[must_use]
    pub const fn classify(&self, depth: usize) -> MailboxLevel {
        if depth > self.critical {
            MailboxLevel::Critical
        } else if depth > self.elevated {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    Room,
    Connection,
}

impl ActorType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ActorType::Room => "room",
            ActorType::Connection => "connection",
        }
    }

    #[must_use]
    pub const fn thresholds(&self) -> DepthThresholds {
        match self {
            ActorType::Room => DepthThresholds::ROOM,
            ActorType::Connection => DepthThresholds::CONNECTION,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

/// Queue depth and throughput of one actor's mailbox.
///
/// Senders call [`record_enqueue`](Self::record_enqueue) after a successful
/// send and the actor calls [`record_dequeue`](Self::record_dequeue) when it
/// picks the message up.
#[derive(Debug)]
pub struct MailboxMonitor {
    kind: ActorType,
    owner: String,
    thresholds: DepthThresholds,
    queued: AtomicUsize,
    high_water: AtomicUsize,
    handled: AtomicU64,
    refused: AtomicU64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(kind: ActorType, owner: impl Into<String>) -> Self {
        Self {
            kind,
            owner: owner.into(),
            thresholds: kind.thresholds(),
            queued: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            handled: AtomicU64::new(0),
            refused: AtomicU64::new(0),
        }
    }

    pub fn record_enqueue(&self) {
        let depth = self.queued.fetch_add(1, Ordering::Relaxed) + 1;
        self.high_water.fetch_max(depth, Ordering::Relaxed);

        match self.thresholds.classify(depth) {
            MailboxLevel::Critical => warn!(
                target: "room.actor.mailbox",
                actor = self.kind.as_str(),
                owner = %self.owner,
                depth,
                critical = self.thresholds.critical,
                "Mailbox backing up"
            ),
            // Log the crossing only, not every message above it.
            MailboxLevel::Warning if depth == self.thresholds.elevated + 1 => debug!(
                target: "room.actor.mailbox",
                actor = self.kind.as_str(),
                owner = %self.owner,
                depth,
                "Mailbox elevated"
            ),
            _ => {}
        }
    }

    pub fn record_dequeue(&self) {
        // Saturate: a dequeue can race ahead of the sender's enqueue record.
        let _ = self
            .queued
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| Some(d.saturating_sub(1)));
        self.handled.fetch_add(1, Ordering::Relaxed);
    }

    /// A send refused because the mailbox was full.
    pub fn record_drop(&self) {
        let refused = self.refused.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            target: "room.actor.mailbox",
            actor = self.kind.as_str(),
            owner = %self.owner,
            refused,
            "Mailbox full, message refused"
        );
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn messages_dropped(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        self.thresholds.classify(self.current_depth())
    }
}

/// Counters shared by the room actor and every connection actor.
#[derive(Debug, Default)]
pub struct ActorMetrics {
    open_connections: AtomicUsize,
    panics: AtomicU64,
    processed: AtomicU64,
}

impl ActorMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connection_created(&self) {
        self.open_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .open_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// A connection task ended by panicking. Always a bug.
    pub fn record_panic(&self, kind: ActorType) {
        let total = self.panics.fetch_add(1, Ordering::Relaxed) + 1;
        observability::record_actor_panic(kind.as_str());
        tracing::error!(
            target: "room.actor.panic",
            actor = kind.as_str(),
            total,
            "Actor task panicked"
        );
    }

    pub fn record_message_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.open_connections.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn panic_count(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}
