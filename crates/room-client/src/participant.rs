//! Participant: one peer's view of a room.
//!
//! [`Participant::connect`] runs the join sequence:
//!
//! 1. Open the signaling socket and read `welcome` (own id)
//! 2. Fetch engine capabilities
//! 3. Create and connect the receive transport
//! 4. Start the reconciler actor and the event reader
//! 5. Fetch the `/peers` snapshot and hand it to the reconciler
//!
//! Events that arrive while steps 2-5 are in flight are already flowing into
//! the reconciler, which buffers what it cannot place yet.

use crate::actor::{ReconcilerActor, ReconcilerHandle};
use crate::api::{HttpRoomApi, RoomApi};
use crate::config::ClientConfig;
use crate::errors::ClientError;
use crate::reconciler::MirrorView;
use crate::signaling::SignalingStream;
use common::types::{ConsumerId, ControlAction, Direction, EntityKind, MediaKind, PeerId, ProducerId};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Client-side parameters the engine would normally generate.
#[derive(Debug, Clone)]
pub struct ParticipantOptions {
    /// Sent with every `transport_connect`.
    pub dtls_parameters: Value,
    /// Override for the capabilities sent with `consume`. Defaults to the
    /// server's own capability descriptor.
    pub rtp_capabilities: Option<Value>,
}

impl Default for ParticipantOptions {
    fn default() -> Self {
        Self {
            dtls_parameters: json!({"role": "auto", "fingerprints": []}),
            rtp_capabilities: None,
        }
    }
}

/// A connected participant.
pub struct Participant {
    peer_id: PeerId,
    api: Arc<dyn RoomApi>,
    options: ParticipantOptions,
    reconciler: ReconcilerHandle,
    send_transport_ready: Mutex<bool>,
    cancel_token: CancellationToken,
    actor_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
}

impl Participant {
    /// Join the room at `config.room_url` with default options.
    ///
    /// # Errors
    ///
    /// Any failure during the join sequence.
    pub async fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        Self::connect_with(config, ParticipantOptions::default()).await
    }

    /// Join the room with explicit options.
    ///
    /// # Errors
    ///
    /// Any failure during the join sequence; the socket is closed again.
    pub async fn connect_with(
        config: &ClientConfig,
        options: ParticipantOptions,
    ) -> Result<Self, ClientError> {
        let api: Arc<dyn RoomApi> = Arc::new(HttpRoomApi::new(config)?);
        let stream = SignalingStream::connect(&config.ws_url).await?;
        let peer_id = stream.peer_id().clone();

        match Self::join(peer_id.clone(), api, stream, options).await {
            Ok(participant) => Ok(participant),
            Err(e) => {
                warn!(target: "client.participant", peer_id = %peer_id, error = %e, "Join failed");
                Err(e)
            }
        }
    }

    async fn join(
        peer_id: PeerId,
        api: Arc<dyn RoomApi>,
        mut stream: SignalingStream,
        options: ParticipantOptions,
    ) -> Result<Self, ClientError> {
        let prepared = async {
            let capabilities = api.get_capabilities().await?;
            api.create_transport(&peer_id, Direction::Recv).await?;
            api.connect_transport(&peer_id, Direction::Recv, &options.dtls_parameters)
                .await?;
            Ok::<_, ClientError>(capabilities)
        }
        .await;
        let capabilities = match prepared {
            Ok(capabilities) => capabilities,
            Err(e) => {
                stream.close().await;
                return Err(e);
            }
        };

        let cancel_token = CancellationToken::new();
        let (reconciler, actor_task) = ReconcilerActor::spawn(
            peer_id.clone(),
            Arc::clone(&api),
            options.rtp_capabilities.clone().unwrap_or(capabilities),
            cancel_token.child_token(),
        );

        let reader_task = {
            let reconciler = reconciler.clone();
            let cancel_token = cancel_token.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = cancel_token.cancelled() => {
                            stream.close().await;
                            break;
                        }
                        next = stream.next_event() => match next {
                            Ok(Some(event)) => {
                                if reconciler.apply_event(event).await.is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {
                                info!(target: "client.participant", "Signaling stream ended");
                                break;
                            }
                            Err(e) => {
                                warn!(target: "client.participant", error = %e, "Signaling stream failed");
                                break;
                            }
                        }
                    }
                }
            })
        };

        let participant = Self {
            peer_id,
            api,
            options,
            reconciler,
            send_transport_ready: Mutex::new(false),
            cancel_token,
            actor_task,
            reader_task,
        };

        let snapshot = match participant.api.list_peers().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                participant.close().await;
                return Err(e);
            }
        };
        participant.reconciler.apply_snapshot(snapshot).await?;

        info!(target: "client.participant", peer_id = %participant.peer_id, "Joined room");
        Ok(participant)
    }

    #[must_use]
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Most recently published mirror.
    #[must_use]
    pub fn mirror(&self) -> Arc<MirrorView> {
        self.reconciler.view()
    }

    /// Receiver notified on every mirror change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<MirrorView>> {
        self.reconciler.subscribe()
    }

    /// Handle to the reconciler, for waiting on mirror changes.
    #[must_use]
    pub fn reconciler(&self) -> &ReconcilerHandle {
        &self.reconciler
    }

    /// Publish a stream. The send transport is created on first use.
    ///
    /// # Errors
    ///
    /// Transport setup or produce failures.
    pub async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> Result<ProducerId, ClientError> {
        {
            let mut ready = self.send_transport_ready.lock().await;
            if !*ready {
                self.api
                    .create_transport(&self.peer_id, Direction::Send)
                    .await?;
                self.api
                    .connect_transport(&self.peer_id, Direction::Send, &self.options.dtls_parameters)
                    .await?;
                *ready = true;
            }
        }

        let producer_id = self.api.produce(&self.peer_id, kind, &rtp_parameters).await?;
        debug!(target: "client.participant", producer_id = %producer_id, "Producing");
        Ok(producer_id)
    }

    /// Start media flow on a consumer (new consumers are paused).
    ///
    /// # Errors
    ///
    /// Control failures from the server.
    pub async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<(), ClientError> {
        self.api
            .control(
                &self.peer_id,
                EntityKind::Consumer,
                consumer_id.as_str(),
                ControlAction::Resume,
            )
            .await
    }

    /// Pause a consumer.
    ///
    /// # Errors
    ///
    /// Control failures from the server.
    pub async fn pause_consumer(&self, consumer_id: &ConsumerId) -> Result<(), ClientError> {
        self.api
            .control(
                &self.peer_id,
                EntityKind::Consumer,
                consumer_id.as_str(),
                ControlAction::Pause,
            )
            .await
    }

    /// Retry every retryable failed subscription.
    ///
    /// # Errors
    ///
    /// `ClientError::Closed` once the participant has shut down.
    pub async fn retry_failed(&self) -> Result<(), ClientError> {
        self.reconciler.retry_failed().await
    }

    /// Leave the room: stop the reader and the actor, closing the socket.
    pub async fn close(mut self) {
        self.cancel_token.cancel();
        let _ = (&mut self.reader_task).await;
        let _ = (&mut self.actor_task).await;
        info!(target: "client.participant", peer_id = %self.peer_id, "Left room");
    }
}

impl Drop for Participant {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
