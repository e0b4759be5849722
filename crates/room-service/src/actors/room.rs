//! `RoomActor` - owns the peer directory and the broadcaster.
//!
//! Every directory mutation goes through this actor's mailbox, so the room has
//! exactly one writer and events are enqueued to recipients in the order the
//! mutations happened. Engine calls never run here: the negotiator performs
//! them outside the actor and commits the result with one message.
//!
//! Each `RoomActor`:
//! - Owns the [`PeerDirectory`] and the [`Broadcaster`]
//! - Supervises one `ConnectionActor` per joined peer
//! - Hands out per-peer negotiation locks

use crate::broadcaster::Broadcaster;
use crate::directory::{
    ConsumerRecord, Peer, PeerDirectory, PeerRemoval, ProducerRecord, ProducerRemoval,
    TransportRecord, TransportReplacement,
};
use crate::errors::RoomError;
use crate::observability;

use super::connection::{ConnectionActor, ConnectionActorHandle, EventSink};
use super::messages::{PeerLock, RoomMessage, RoomState};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::events::PeerChangeEvent;
use common::protocol::PeerSnapshot;
use common::types::{ConsumerId, Direction, EntityKind, PeerId, ProducerId, TransportId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// How long shutdown waits for each connection actor.
const CONNECTION_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the `RoomActor`.
#[derive(Clone, Debug)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl RoomActorHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RoomMessage,
    ) -> Result<T, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox.record_enqueue();
        if let Err(e) = self.sender.send(build(tx)).await {
            self.mailbox.record_dequeue();
            return Err(RoomError::Internal(format!("channel send failed: {e}")));
        }
        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))
    }

    /// Register a peer, start its connection actor and announce `peer-join`.
    pub async fn join(
        &self,
        peer_id: PeerId,
        sink: Box<dyn EventSink>,
    ) -> Result<ConnectionActorHandle, RoomError> {
        self.request(|respond_to| RoomMessage::Join {
            peer_id,
            sink,
            respond_to,
        })
        .await?
    }

    /// Remove a peer and announce `peer-left`. Idempotent.
    pub async fn leave(&self, peer_id: PeerId) -> Result<Option<PeerRemoval>, RoomError> {
        self.request(|respond_to| RoomMessage::Leave {
            peer_id,
            respond_to,
        })
        .await
    }

    /// The peer's negotiation lock, or `None` if the peer is not registered.
    pub async fn peer_lock(&self, peer_id: PeerId) -> Result<Option<PeerLock>, RoomError> {
        self.request(|respond_to| RoomMessage::PeerLock {
            peer_id,
            respond_to,
        })
        .await
    }

    pub async fn set_transport(
        &self,
        peer_id: PeerId,
        record: TransportRecord,
    ) -> Result<TransportReplacement, RoomError> {
        self.request(|respond_to| RoomMessage::SetTransport {
            peer_id,
            record,
            respond_to,
        })
        .await?
    }

    pub async fn mark_connected(
        &self,
        peer_id: PeerId,
        direction: Direction,
        transport_id: TransportId,
    ) -> Result<(), RoomError> {
        self.request(|respond_to| RoomMessage::MarkConnected {
            peer_id,
            direction,
            transport_id,
            respond_to,
        })
        .await?
    }

    /// Commit a producer. `new-producer` has been enqueued to every other
    /// peer by the time this returns `Ok`.
    pub async fn add_producer(
        &self,
        peer_id: PeerId,
        record: ProducerRecord,
    ) -> Result<(), RoomError> {
        self.request(|respond_to| RoomMessage::AddProducer {
            peer_id,
            record,
            respond_to,
        })
        .await?
    }

    pub async fn add_consumer(
        &self,
        peer_id: PeerId,
        record: ConsumerRecord,
    ) -> Result<(), RoomError> {
        self.request(|respond_to| RoomMessage::AddConsumer {
            peer_id,
            record,
            respond_to,
        })
        .await?
    }

    pub async fn remove_producer(
        &self,
        peer_id: PeerId,
        producer_id: ProducerId,
    ) -> Result<ProducerRemoval, RoomError> {
        self.request(|respond_to| RoomMessage::RemoveProducer {
            peer_id,
            producer_id,
            respond_to,
        })
        .await?
    }

    pub async fn remove_consumer(
        &self,
        peer_id: PeerId,
        consumer_id: ConsumerId,
    ) -> Result<ConsumerRecord, RoomError> {
        self.request(|respond_to| RoomMessage::RemoveConsumer {
            peer_id,
            consumer_id,
            respond_to,
        })
        .await?
    }

    pub async fn set_paused(
        &self,
        peer_id: PeerId,
        kind: EntityKind,
        entity_id: String,
        paused: bool,
    ) -> Result<(), RoomError> {
        self.request(|respond_to| RoomMessage::SetPaused {
            peer_id,
            kind,
            entity_id,
            paused,
            respond_to,
        })
        .await?
    }

    pub async fn find_peer(&self, peer_id: PeerId) -> Result<Option<Peer>, RoomError> {
        self.request(|respond_to| RoomMessage::FindPeer {
            peer_id,
            respond_to,
        })
        .await
    }

    pub async fn find_producer(
        &self,
        producer_id: ProducerId,
    ) -> Result<Option<(PeerId, ProducerRecord)>, RoomError> {
        self.request(|respond_to| RoomMessage::FindProducer {
            producer_id,
            respond_to,
        })
        .await
    }

    /// Point-in-time copy of every peer.
    pub async fn list_peers(&self) -> Result<Vec<PeerSnapshot>, RoomError> {
        self.request(|respond_to| RoomMessage::ListPeers { respond_to })
            .await
    }

    pub async fn get_state(&self) -> Result<RoomState, RoomError> {
        self.request(|respond_to| RoomMessage::GetState { respond_to })
            .await
    }

    /// Shut the room down, closing every connection.
    /// Stop the room and take ownership of every peer still registered.
    ///
    /// Unlike [`cancel`](Self::cancel), nothing is left for the engine to
    /// leak: the caller receives each retired peer's entities to release.
    pub async fn shutdown(&self) -> Result<Vec<PeerRemoval>, RoomError> {
        self.request(|respond_to| RoomMessage::Shutdown { respond_to })
            .await
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Managed connection state.
struct ManagedConnection {
    handle: ConnectionActorHandle,
    task_handle: JoinHandle<()>,
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    receiver: mpsc::Receiver<RoomMessage>,
    cancel_token: CancellationToken,
    directory: PeerDirectory,
    broadcaster: Broadcaster,
    locks: HashMap<PeerId, PeerLock>,
    connections: Vec<ManagedConnection>,
    event_channel_capacity: usize,
    is_shutting_down: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl RoomActor {
    /// Spawn the room actor.
    ///
    /// `event_channel_capacity` bounds every connection's event queue.
    pub fn spawn(
        event_channel_capacity: usize,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Room, "room"));

        let actor = Self {
            receiver,
            cancel_token: cancel_token.clone(),
            directory: PeerDirectory::new(),
            broadcaster: Broadcaster::new(),
            locks: HashMap::new(),
            connections: Vec::new(),
            event_channel_capacity,
            is_shutting_down: false,
            metrics,
            mailbox: Arc::clone(&mailbox),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            mailbox,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "room.actor.room")]
    async fn run(mut self) {
        info!(target: "room.actor.room", "RoomActor started");

        loop {
            self.check_connection_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "room.actor.room",
                        "RoomActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(RoomMessage::Shutdown { respond_to }) => {
                            self.mailbox.record_dequeue();
                            let retired = self.retire_all_peers();
                            // Readers that see their socket close from here on
                            // skip unregistering.
                            self.cancel_token.cancel();
                            self.graceful_shutdown().await;
                            let _ = respond_to.send(retired);
                            break;
                        }
                        Some(message) => {
                            self.handle_message(message);
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "room.actor.room",
                                "RoomActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "room.actor.room",
            peers = self.directory.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join {
                peer_id,
                sink,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_join(peer_id, sink));
            }

            RoomMessage::Leave {
                peer_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_leave(&peer_id));
            }

            RoomMessage::PeerLock {
                peer_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.locks.get(&peer_id).cloned());
            }

            RoomMessage::SetTransport {
                peer_id,
                record,
                respond_to,
            } => {
                let _ = respond_to.send(self.directory.set_transport(&peer_id, record));
            }

            RoomMessage::MarkConnected {
                peer_id,
                direction,
                transport_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.directory.mark_connected(
                    &peer_id,
                    direction,
                    &transport_id,
                ));
            }

            RoomMessage::AddProducer {
                peer_id,
                record,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_add_producer(peer_id, record));
            }

            RoomMessage::AddConsumer {
                peer_id,
                record,
                respond_to,
            } => {
                let _ = respond_to.send(self.directory.add_consumer(&peer_id, record));
            }

            RoomMessage::RemoveProducer {
                peer_id,
                producer_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.directory.remove_producer(&peer_id, &producer_id));
            }

            RoomMessage::RemoveConsumer {
                peer_id,
                consumer_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.directory.remove_consumer(&peer_id, &consumer_id));
            }

            RoomMessage::SetPaused {
                peer_id,
                kind,
                entity_id,
                paused,
                respond_to,
            } => {
                let _ = respond_to.send(self.directory.set_paused(
                    &peer_id, kind, &entity_id, paused,
                ));
            }

            RoomMessage::FindPeer {
                peer_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.directory.find_peer(&peer_id).cloned());
            }

            RoomMessage::FindProducer {
                producer_id,
                respond_to,
            } => {
                let found = self
                    .directory
                    .find_producer(&producer_id)
                    .map(|(owner, record)| (owner.clone(), record.clone()));
                let _ = respond_to.send(found);
            }

            RoomMessage::ListPeers { respond_to } => {
                let _ = respond_to.send(self.directory.list_peers());
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(RoomState {
                    peers: self.directory.len(),
                    connections: self.broadcaster.len(),
                    events_broadcast: self.broadcaster.events_broadcast(),
                    recipients_dropped: self.broadcaster.recipients_dropped(),
                });
            }

            // Needs the async shutdown path, so `run` takes it first.
            RoomMessage::Shutdown { respond_to } => {
                let _ = respond_to.send(Vec::new());
            }
        }
    }

    fn handle_join(
        &mut self,
        peer_id: PeerId,
        sink: Box<dyn EventSink>,
    ) -> Result<ConnectionActorHandle, RoomError> {
        if self.is_shutting_down {
            return Err(RoomError::Internal("room is shutting down".to_string()));
        }

        if let Err(e) = self.directory.register(peer_id.clone()) {
            warn!(
                target: "room.actor.room",
                peer_id = %peer_id,
                "Duplicate peer registration"
            );
            return Err(e);
        }

        let (handle, task_handle) = ConnectionActor::spawn(
            peer_id.clone(),
            sink,
            self.event_channel_capacity,
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );
        self.connections.push(ManagedConnection {
            handle: handle.clone(),
            task_handle,
        });
        self.locks
            .insert(peer_id.clone(), Arc::new(Mutex::new(())));
        self.broadcaster.subscribe(handle.clone());

        self.broadcaster.publish(&PeerChangeEvent::PeerJoin {
            socket_id: peer_id.clone(),
        });
        observability::set_peers_active(self.directory.len());

        info!(
            target: "room.actor.room",
            peer_id = %peer_id,
            peers = self.directory.len(),
            "Peer joined"
        );
        Ok(handle)
    }

    fn handle_leave(&mut self, peer_id: &PeerId) -> Option<PeerRemoval> {
        self.locks.remove(peer_id);
        if let Some(handle) = self.broadcaster.unsubscribe(peer_id) {
            handle.cancel();
        }

        let removal = self.directory.unregister(peer_id)?;

        self.broadcaster.publish(&PeerChangeEvent::PeerLeft {
            socket_id: peer_id.clone(),
        });
        observability::set_peers_active(self.directory.len());

        info!(
            target: "room.actor.room",
            peer_id = %peer_id,
            producers = removal.peer.producers.len(),
            orphaned_consumers = removal.orphaned_consumers.len(),
            connected_secs = removal.peer.connected_for().num_seconds(),
            peers = self.directory.len(),
            "Peer left"
        );
        Some(removal)
    }

    fn handle_add_producer(
        &mut self,
        peer_id: PeerId,
        record: ProducerRecord,
    ) -> Result<(), RoomError> {
        let producer_id = record.id.clone();
        self.directory.add_producer(&peer_id, record)?;

        // Enqueued before the reply so the producer's owner cannot learn its
        // id before everyone else has the event queued.
        self.broadcaster.publish(&PeerChangeEvent::NewProducer {
            socket_id: peer_id,
            producer_id,
        });
        Ok(())
    }

    /// Reap connection actors that have exited and record panics.
    async fn check_connection_health(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.connections)
            .into_iter()
            .partition(|c| c.task_handle.is_finished());
        self.connections = running;

        for managed in finished {
            match managed.task_handle.await {
                Ok(()) => {
                    debug!(
                        target: "room.actor.room",
                        peer_id = %managed.handle.peer_id(),
                        "Connection actor exited cleanly"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "room.actor.room",
                            peer_id = %managed.handle.peer_id(),
                            error = ?join_error,
                            "Connection actor panicked"
                        );
                        self.metrics.record_panic(ActorType::Connection);
                    }
                }
            }
        }
    }

    /// Unregister every peer at once. No `peer-left` goes out since every
    /// recipient is leaving too.
    fn retire_all_peers(&mut self) -> Vec<PeerRemoval> {
        self.is_shutting_down = true;
        self.locks.clear();
        let retired = self.directory.unregister_all();
        observability::set_peers_active(0);
        info!(
            target: "room.actor.room",
            peers = retired.len(),
            "Retired remaining peers"
        );
        retired
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "room.actor.room",
            peers = self.directory.len(),
            connections = self.connections.len(),
            "Performing graceful shutdown"
        );

        self.is_shutting_down = true;
        self.broadcaster.drain();

        for managed in &self.connections {
            managed.handle.cancel();
        }

        for managed in self.connections.drain(..) {
            let peer_id = managed.handle.peer_id().clone();
            match tokio::time::timeout(CONNECTION_SHUTDOWN_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        target: "room.actor.room",
                        peer_id = %peer_id,
                        error = ?e,
                        "Connection task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "room.actor.room",
                        peer_id = %peer_id,
                        "Connection shutdown timed out"
                    );
                }
            }
        }

        info!(target: "room.actor.room", "Graceful shutdown complete");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::events::ServerFrame;
    use common::types::MediaKind;

    fn spawn_room() -> RoomActorHandle {
        let (handle, _task) = RoomActor::spawn(16, CancellationToken::new(), ActorMetrics::new());
        handle
    }

    async fn join(
        room: &RoomActorHandle,
        id: &str,
    ) -> (ConnectionActorHandle, mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = room.join(PeerId::from(id), Box::new(tx)).await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            ServerFrame::Welcome {
                socket_id: PeerId::from(id)
            }
        );
        (conn, rx)
    }

    async fn with_send_transport(room: &RoomActorHandle, id: &str) -> TransportId {
        let transport_id = TransportId::from(format!("{id}-send"));
        room.set_transport(
            PeerId::from(id),
            TransportRecord::new(transport_id.clone(), Direction::Send),
        )
        .await
        .unwrap();
        transport_id
    }

    #[tokio::test]
    async fn test_join_announces_to_existing_peers() {
        let room = spawn_room();
        let (a_conn, mut a_rx) = join(&room, "a").await;
        let (_b_conn, _b_rx) = join(&room, "b").await;

        a_conn.ping().await.unwrap();
        assert_eq!(
            a_rx.recv().await.unwrap(),
            ServerFrame::PeerJoin {
                socket_id: PeerId::from("b")
            }
        );
        assert_eq!(room.get_state().await.unwrap().peers, 2);
    }

    #[tokio::test]
    async fn test_duplicate_join_conflicts() {
        let room = spawn_room();
        let _a = join(&room, "a").await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = room.join(PeerId::from("a"), Box::new(tx)).await;
        assert!(matches!(result, Err(RoomError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_leave_twice_emits_one_peer_left() {
        let room = spawn_room();
        let (a_conn, mut a_rx) = join(&room, "a").await;
        let _b = join(&room, "b").await;

        assert!(room.leave(PeerId::from("b")).await.unwrap().is_some());
        assert!(room.leave(PeerId::from("b")).await.unwrap().is_none());
        a_conn.ping().await.unwrap();

        let mut frames = Vec::new();
        while let Ok(frame) = a_rx.try_recv() {
            frames.push(frame);
        }
        let lefts = frames
            .iter()
            .filter(|f| matches!(f, ServerFrame::PeerLeft { .. }))
            .count();
        assert_eq!(lefts, 1);
        assert!(room.peer_lock(PeerId::from("b")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_new_producer_is_enqueued_before_reply() {
        let room = spawn_room();
        let (a_conn, mut a_rx) = join(&room, "a").await;
        let _b = join(&room, "b").await;
        let transport_id = with_send_transport(&room, "b").await;

        room.add_producer(
            PeerId::from("b"),
            ProducerRecord {
                id: ProducerId::from("p1"),
                kind: MediaKind::Audio,
                transport_id,
                paused: false,
            },
        )
        .await
        .unwrap();

        // The reply came after the enqueue, so a ping flushes both frames.
        a_conn.ping().await.unwrap();
        assert!(matches!(
            a_rx.try_recv(),
            Ok(ServerFrame::PeerJoin { .. })
        ));
        assert_eq!(
            a_rx.try_recv().unwrap(),
            ServerFrame::NewProducer {
                socket_id: PeerId::from("b"),
                producer_id: ProducerId::from("p1"),
            }
        );
    }

    #[tokio::test]
    async fn test_failed_add_producer_broadcasts_nothing() {
        let room = spawn_room();
        let (a_conn, mut a_rx) = join(&room, "a").await;
        let _b = join(&room, "b").await;

        let result = room
            .add_producer(
                PeerId::from("b"),
                ProducerRecord {
                    id: ProducerId::from("p1"),
                    kind: MediaKind::Audio,
                    transport_id: TransportId::from("never-created"),
                    paused: false,
                },
            )
            .await;
        assert!(matches!(result, Err(RoomError::NotFound(_))));

        a_conn.ping().await.unwrap();
        assert!(matches!(a_rx.try_recv(), Ok(ServerFrame::PeerJoin { .. })));
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_list_peers_snapshot() {
        let room = spawn_room();
        let _a = join(&room, "a").await;
        with_send_transport(&room, "a").await;

        let peers = room.list_peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(
            peers.first().unwrap().produce_transport,
            Some(TransportId::from("a-send"))
        );
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections_and_rejects_joins() {
        let (room, task) = RoomActor::spawn(16, CancellationToken::new(), ActorMetrics::new());
        let (a_conn, _a_rx) = join(&room, "a").await;

        room.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(a_conn.is_cancelled());

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(room.join(PeerId::from("b"), Box::new(tx)).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_message_hands_back_every_peer() {
        let (room, task) = RoomActor::spawn(16, CancellationToken::new(), ActorMetrics::new());
        let (a_conn, _a_rx) = join(&room, "a").await;
        let (b_conn, mut b_rx) = join(&room, "b").await;
        let transport_id = with_send_transport(&room, "a").await;

        let retired = room.shutdown().await.unwrap();
        let ids: Vec<&str> = retired.iter().map(|r| r.peer.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(
            retired.first().unwrap().peer.send_transport.as_ref().map(|t| &t.id),
            Some(&transport_id)
        );

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(room.is_cancelled());
        assert!(a_conn.is_cancelled());
        assert!(b_conn.is_cancelled());

        // Everyone left at once: no peer-left is sent.
        while let Ok(frame) = b_rx.try_recv() {
            assert!(!matches!(frame, ServerFrame::PeerLeft { .. }));
        }
    }
}
