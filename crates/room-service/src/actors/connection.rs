//! `ConnectionActor` - one per signaling connection.
//!
//! Each `ConnectionActor`:
//! - Owns the write half of exactly one signaling connection (an [`EventSink`])
//! - Writes the `welcome` frame first, then every event the room enqueues, in order
//! - Never blocks the room: the room enqueues with `try_deliver` and a full
//!   mailbox is reported back instead of waited on
//!
//! # Lifecycle
//!
//! 1. Spawned by the room actor when a peer joins
//! 2. Runs until the sink fails, the room closes it, or its token is cancelled
//! 3. On exit it cancels its own token so the connection's reader notices and
//!    unregisters the peer

use crate::errors::RoomError;

use super::messages::ConnectionMessage;
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use async_trait::async_trait;
use common::events::ServerFrame;
use common::types::PeerId;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Where a connection's frames are written.
#[async_trait]
pub trait EventSink: Send + 'static {
    /// Write one frame. An error means the connection is gone.
    async fn deliver(&mut self, frame: &ServerFrame) -> Result<(), RoomError>;

    /// Close the underlying connection.
    async fn close(&mut self, reason: &str);
}

/// In-process sink: frames are forwarded to a channel.
#[async_trait]
impl EventSink for mpsc::UnboundedSender<ServerFrame> {
    async fn deliver(&mut self, frame: &ServerFrame) -> Result<(), RoomError> {
        self.send(frame.clone())
            .map_err(|_| RoomError::Internal("event receiver dropped".to_string()))
    }

    async fn close(&mut self, _reason: &str) {}
}

/// Why an event could not be enqueued for a recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The recipient's queue is full; it is not keeping up.
    #[error("event queue full")]
    Full,
    /// The recipient's actor has already exited.
    #[error("connection closed")]
    Closed,
}

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    peer_id: PeerId,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActorHandle {
    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Enqueue a frame without waiting.
    pub fn try_deliver(&self, frame: ServerFrame) -> Result<(), DeliveryError> {
        match self.sender.try_send(ConnectionMessage::Deliver { frame }) {
            Ok(()) => {
                self.mailbox.record_enqueue();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.mailbox.record_drop();
                Err(DeliveryError::Full)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    /// Ask the actor to close the connection after flushing queued frames.
    pub async fn close(&self, reason: String) -> Result<(), RoomError> {
        self.sender
            .send(ConnectionMessage::Close { reason })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))
    }

    /// Round trip through the mailbox; resolves once everything enqueued
    /// before it has been written.
    pub async fn ping(&self) -> Result<(), RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConnectionMessage::Ping { respond_to: tx })
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the actor immediately, dropping queued frames.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Resolves once the actor has been cancelled or has exited.
    pub async fn closed(&self) {
        self.cancel_token.cancelled().await;
    }

    /// Number of frames waiting in the mailbox.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.mailbox.current_depth()
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    peer_id: PeerId,
    receiver: mpsc::Receiver<ConnectionMessage>,
    cancel_token: CancellationToken,
    sink: Box<dyn EventSink>,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionActor {
    /// Spawn a new connection actor whose mailbox holds `capacity` frames.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        peer_id: PeerId,
        sink: Box<dyn EventSink>,
        capacity: usize,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Connection, peer_id.as_str()));

        metrics.connection_created();
        let actor = Self {
            peer_id: peer_id.clone(),
            receiver,
            cancel_token: cancel_token.clone(),
            sink,
            metrics,
            mailbox: Arc::clone(&mailbox),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            peer_id,
            mailbox,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "room.actor.connection", fields(peer_id = %self.peer_id))]
    async fn run(mut self) {
        debug!(
            target: "room.actor.connection",
            peer_id = %self.peer_id,
            "ConnectionActor started"
        );

        let welcome = ServerFrame::Welcome {
            socket_id: self.peer_id.clone(),
        };
        let mut open = self.sink.deliver(&welcome).await.is_ok();

        while open {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "room.actor.connection",
                        peer_id = %self.peer_id,
                        "ConnectionActor received cancellation signal"
                    );
                    self.sink.close("connection closed by server").await;
                    open = false;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            let keep_running = self.handle_message(message).await;
                            self.metrics.record_message_processed();
                            open = keep_running;
                        }
                        None => {
                            debug!(
                                target: "room.actor.connection",
                                peer_id = %self.peer_id,
                                "ConnectionActor channel closed, exiting"
                            );
                            open = false;
                        }
                    }
                }
            }
        }

        // Wakes the connection reader so it can unregister the peer.
        self.cancel_token.cancel();
        self.metrics.connection_closed();

        info!(
            target: "room.actor.connection",
            peer_id = %self.peer_id,
            messages_processed = self.mailbox.messages_processed(),
            "ConnectionActor stopped"
        );
    }

    /// Handle a single message. Returns false if the actor should exit.
    async fn handle_message(&mut self, message: ConnectionMessage) -> bool {
        match message {
            ConnectionMessage::Deliver { frame } => {
                self.mailbox.record_dequeue();
                if let Err(e) = self.sink.deliver(&frame).await {
                    warn!(
                        target: "room.actor.connection",
                        peer_id = %self.peer_id,
                        error = %e,
                        "Failed to write event, closing connection"
                    );
                    return false;
                }
                true
            }

            ConnectionMessage::Close { reason } => {
                debug!(
                    target: "room.actor.connection",
                    peer_id = %self.peer_id,
                    reason = %reason,
                    "Closing connection"
                );
                self.sink.close(&reason).await;
                false
            }

            ConnectionMessage::Ping { respond_to } => {
                let _ = respond_to.send(());
                true
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::types::ProducerId;
    use std::time::Duration;

    /// Sink backed by a bounded channel nobody drains, so writes stall.
    struct StalledSink(mpsc::Sender<ServerFrame>);

    #[async_trait]
    impl EventSink for StalledSink {
        async fn deliver(&mut self, frame: &ServerFrame) -> Result<(), RoomError> {
            self.0
                .send(frame.clone())
                .await
                .map_err(|_| RoomError::Internal("closed".to_string()))
        }

        async fn close(&mut self, _reason: &str) {}
    }

    fn spawn_with_channel(
        capacity: usize,
    ) -> (
        ConnectionActorHandle,
        JoinHandle<()>,
        mpsc::UnboundedReceiver<ServerFrame>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (handle, task) = ConnectionActor::spawn(
            PeerId::from("peer-1"),
            Box::new(tx),
            capacity,
            CancellationToken::new(),
            ActorMetrics::new(),
        );
        (handle, task, rx)
    }

    #[tokio::test]
    async fn test_welcome_is_first_frame() {
        let (handle, _task, mut rx) = spawn_with_channel(8);
        handle
            .try_deliver(ServerFrame::PeerJoin {
                socket_id: PeerId::from("other"),
            })
            .unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            ServerFrame::Welcome {
                socket_id: PeerId::from("peer-1")
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            ServerFrame::PeerJoin {
                socket_id: PeerId::from("other")
            }
        );
    }

    #[tokio::test]
    async fn test_frames_are_written_in_order() {
        let (handle, _task, mut rx) = spawn_with_channel(8);
        for i in 0..5 {
            handle
                .try_deliver(ServerFrame::NewProducer {
                    socket_id: PeerId::from("a"),
                    producer_id: ProducerId::from(format!("p{i}")),
                })
                .unwrap();
        }
        handle.ping().await.unwrap();

        let _welcome = rx.recv().await.unwrap();
        for i in 0..5 {
            assert_eq!(
                rx.recv().await.unwrap(),
                ServerFrame::NewProducer {
                    socket_id: PeerId::from("a"),
                    producer_id: ProducerId::from(format!("p{i}")),
                }
            );
        }
    }

    #[tokio::test]
    async fn test_full_queue_is_reported() {
        let (sink_tx, _sink_rx) = mpsc::channel(1);
        let (handle, _task) = ConnectionActor::spawn(
            PeerId::from("slow"),
            Box::new(StalledSink(sink_tx)),
            1,
            CancellationToken::new(),
            ActorMetrics::new(),
        );

        let frame = ServerFrame::PeerLeft {
            socket_id: PeerId::from("x"),
        };
        let results: Vec<_> = (0..3).map(|_| handle.try_deliver(frame.clone())).collect();
        assert!(
            results.contains(&Err(DeliveryError::Full)),
            "a stalled recipient must overflow: {results:?}"
        );
    }

    #[tokio::test]
    async fn test_sink_failure_cancels_token() {
        let (handle, task, rx) = spawn_with_channel(8);
        drop(rx);

        tokio::time::timeout(Duration::from_secs(1), handle.closed())
            .await
            .expect("actor should exit when the sink is gone");
        task.await.unwrap();
        assert_eq!(
            handle.try_deliver(ServerFrame::PeerLeft {
                socket_id: PeerId::from("x")
            }),
            Err(DeliveryError::Closed)
        );
    }

    #[tokio::test]
    async fn test_cancel_stops_actor() {
        let (handle, task, _rx) = spawn_with_channel(8);
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_close_flushes_then_exits() {
        let (handle, task, mut rx) = spawn_with_channel(8);
        handle
            .try_deliver(ServerFrame::PeerJoin {
                socket_id: PeerId::from("a"),
            })
            .unwrap();
        handle.close("bye".to_string()).await.unwrap();
        task.await.unwrap();

        let _welcome = rx.recv().await.unwrap();
        assert!(matches!(rx.recv().await, Some(ServerFrame::PeerJoin { .. })));
        assert!(rx.recv().await.is_none());
    }
}
