//! `ReconcilerActor` - single writer for a participant's mirror.
//!
//! The actor owns a [`Reconciler`] and is the only task that mutates it.
//! Signaling events, the snapshot and consume outcomes all arrive through
//! its mailbox, so no two inputs are ever applied concurrently.
//!
//! Commands the reconciler emits are run on spawned tasks so a slow
//! `consume` never stalls event processing; each task posts its result back
//! to the mailbox. After every change the new [`MirrorView`] is published on
//! a `watch` channel.
//!
//! # Lifecycle
//!
//! 1. Spawned by [`crate::Participant`] once its own id is known
//! 2. Runs until its token is cancelled or every handle is dropped
//! 3. In-flight command tasks are aborted on exit

use crate::api::RoomApi;
use crate::errors::ClientError;
use crate::reconciler::{Command, MirrorView, Reconciler};
use common::events::PeerChangeEvent;
use common::protocol::{ConsumerDescriptor, PeerSnapshot};
use common::types::{ControlAction, EntityKind, PeerId, ProducerId};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const MAILBOX_CAPACITY: usize = 256;

/// Messages handled by the `ReconcilerActor`.
#[derive(Debug)]
pub enum ReconcilerMessage {
    /// One event from the signaling stream, in arrival order.
    Event(PeerChangeEvent),
    /// The `GET /peers` snapshot.
    Snapshot(Vec<PeerSnapshot>),
    /// Outcome of a consume command.
    ConsumeResult {
        peer_id: PeerId,
        producer_id: ProducerId,
        result: Result<ConsumerDescriptor, ClientError>,
    },
    /// Re-issue retryable failed consumes.
    RetryFailed,
    /// Current view.
    GetView {
        respond_to: oneshot::Sender<Arc<MirrorView>>,
    },
}

/// Handle to a `ReconcilerActor`.
#[derive(Clone, Debug)]
pub struct ReconcilerHandle {
    sender: mpsc::Sender<ReconcilerMessage>,
    cancel_token: CancellationToken,
    views: watch::Receiver<Arc<MirrorView>>,
}

impl ReconcilerHandle {
    async fn send(&self, message: ReconcilerMessage) -> Result<(), ClientError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Feed one signaling event.
    pub async fn apply_event(&self, event: PeerChangeEvent) -> Result<(), ClientError> {
        self.send(ReconcilerMessage::Event(event)).await
    }

    /// Feed the snapshot.
    pub async fn apply_snapshot(&self, snapshot: Vec<PeerSnapshot>) -> Result<(), ClientError> {
        self.send(ReconcilerMessage::Snapshot(snapshot)).await
    }

    pub async fn retry_failed(&self) -> Result<(), ClientError> {
        self.send(ReconcilerMessage::RetryFailed).await
    }

    /// View after every message enqueued so far has been applied.
    pub async fn get_view(&self) -> Result<Arc<MirrorView>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send(ReconcilerMessage::GetView { respond_to: tx })
            .await?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Most recently published view.
    #[must_use]
    pub fn view(&self) -> Arc<MirrorView> {
        Arc::clone(&self.views.borrow())
    }

    /// Receiver notified on every published view.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<MirrorView>> {
        self.views.clone()
    }

    /// Wait until a published view satisfies `predicate`.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<Arc<MirrorView>, ClientError>
    where
        F: FnMut(&MirrorView) -> bool,
    {
        let mut views = self.views.clone();
        let view = views
            .wait_for(|view| predicate(view))
            .await
            .map_err(|_| ClientError::Closed)?;
        Ok(Arc::clone(&view))
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `ReconcilerActor` implementation.
pub struct ReconcilerActor {
    reconciler: Reconciler,
    api: Arc<dyn RoomApi>,
    rtp_capabilities: Arc<Value>,
    receiver: mpsc::Receiver<ReconcilerMessage>,
    /// Weak so the mailbox closes once every handle is gone.
    results: mpsc::WeakSender<ReconcilerMessage>,
    cancel_token: CancellationToken,
    views: watch::Sender<Arc<MirrorView>>,
    tasks: JoinSet<()>,
    published: u64,
}

impl ReconcilerActor {
    /// Spawn the actor for the participant `self_id`.
    ///
    /// `rtp_capabilities` is sent with every consume request.
    pub fn spawn(
        self_id: PeerId,
        api: Arc<dyn RoomApi>,
        rtp_capabilities: Value,
        cancel_token: CancellationToken,
    ) -> (ReconcilerHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(MAILBOX_CAPACITY);
        let reconciler = Reconciler::new(self_id);
        let (views_tx, views_rx) = watch::channel(Arc::new(reconciler.view()));

        let actor = Self {
            published: reconciler.version(),
            reconciler,
            api,
            rtp_capabilities: Arc::new(rtp_capabilities),
            receiver,
            results: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            views: views_tx,
            tasks: JoinSet::new(),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ReconcilerHandle {
            sender,
            cancel_token,
            views: views_rx,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "client.actor")]
    async fn run(mut self) {
        info!(
            target: "client.actor",
            peer_id = %self.reconciler.self_id(),
            "ReconcilerActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(target: "client.actor", "ReconcilerActor received cancellation signal");
                    break;
                }

                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            warn!(target: "client.actor", error = %e, "Command task panicked");
                        }
                    }
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.handle_message(message);
                            self.publish();
                        }
                        None => {
                            debug!(target: "client.actor", "ReconcilerActor channel closed, exiting");
                            break;
                        }
                    }
                }
            }
        }

        self.tasks.abort_all();
        info!(
            target: "client.actor",
            version = self.reconciler.version(),
            "ReconcilerActor stopped"
        );
    }

    fn handle_message(&mut self, message: ReconcilerMessage) {
        let commands = match message {
            ReconcilerMessage::Event(event) => {
                debug!(target: "client.actor", event = event.name(), peer_id = %event.peer_id(), "Event received");
                self.reconciler.apply_event(event)
            }
            ReconcilerMessage::Snapshot(snapshot) => self.reconciler.apply_snapshot(snapshot),
            ReconcilerMessage::ConsumeResult {
                peer_id,
                producer_id,
                result,
            } => match result {
                Ok(descriptor) => self.reconciler.on_consumed(&peer_id, descriptor),
                Err(e) => {
                    self.reconciler
                        .on_consume_failed(&peer_id, &producer_id, e);
                    Vec::new()
                }
            },
            ReconcilerMessage::RetryFailed => self.reconciler.retry_failed(),
            ReconcilerMessage::GetView { respond_to } => {
                let _ = respond_to.send(Arc::new(self.reconciler.view()));
                Vec::new()
            }
        };

        for command in commands {
            self.execute(command);
        }
    }

    fn publish(&mut self) {
        let version = self.reconciler.version();
        if version != self.published {
            self.published = version;
            self.views.send_replace(Arc::new(self.reconciler.view()));
        }
    }

    fn execute(&mut self, command: Command) {
        let api = Arc::clone(&self.api);
        let self_id = self.reconciler.self_id().clone();

        match command {
            Command::Consume {
                peer_id,
                producer_id,
            } => {
                let results = self.results.clone();
                let capabilities = Arc::clone(&self.rtp_capabilities);
                self.tasks.spawn(async move {
                    let result = api.consume(&self_id, &producer_id, &capabilities).await;
                    let Some(sender) = results.upgrade() else {
                        return;
                    };
                    let _ = sender
                        .send(ReconcilerMessage::ConsumeResult {
                            peer_id,
                            producer_id,
                            result,
                        })
                        .await;
                });
            }
            Command::CloseConsumer {
                peer_id,
                consumer_id,
            } => {
                self.tasks.spawn(async move {
                    if let Err(e) = api
                        .control(
                            &self_id,
                            EntityKind::Consumer,
                            consumer_id.as_str(),
                            ControlAction::Close,
                        )
                        .await
                    {
                        warn!(
                            target: "client.actor",
                            peer_id = %peer_id,
                            consumer_id = %consumer_id,
                            error = %e,
                            "Failed to close orphaned consumer"
                        );
                    }
                });
            }
        }
    }
}
