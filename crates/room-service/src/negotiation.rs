//! Transport negotiation sequencer.
//!
//! Drives the request/response protocol a peer uses to set up its transports
//! and to publish and subscribe. Each operation holds the peer's negotiation
//! lock for its whole duration, talks to the media engine first, and only
//! then commits the outcome to the room actor. A commit that fails (usually
//! because the peer disconnected mid-call) closes whatever the engine just
//! created, so directory state is never partially updated and nothing leaks.
//!
//! Disconnect deliberately skips the lock: it removes the peer at once and
//! in-flight operations discover that at commit time.

use crate::actors::{ConnectionActorHandle, EventSink, RoomActorHandle};
use crate::directory::{
    ConsumerRecord, OrphanedConsumers, Peer, PeerRemoval, ProducerRecord, TransportRecord,
    TransportReplacement,
};
use crate::engine::{EngineError, MediaEngine};
use crate::errors::RoomError;
use crate::observability;

use common::protocol::{ConsumerDescriptor, PeerSnapshot, TransportParameters};
use common::types::{
    ConsumerId, ControlAction, Direction, EntityKind, MediaKind, PeerId, ProducerId, TransportId,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument, warn};

/// Request/response front door to the room.
#[derive(Clone)]
pub struct Negotiator {
    room: RoomActorHandle,
    engine: Arc<dyn MediaEngine>,
}

fn observe<T>(operation: &'static str, start: Instant, result: &Result<T, RoomError>) {
    let status = match result {
        Ok(_) => "success",
        Err(e) => e.metric_label(),
    };
    observability::record_negotiation(operation, status, start.elapsed());
}

fn peer_not_found(peer_id: &PeerId) -> RoomError {
    RoomError::NotFound(format!("Peer {peer_id} not found"))
}

impl Negotiator {
    #[must_use]
    pub fn new(room: RoomActorHandle, engine: Arc<dyn MediaEngine>) -> Self {
        Self { room, engine }
    }

    #[must_use]
    pub fn room(&self) -> &RoomActorHandle {
        &self.room
    }

    /// Media capability descriptor. Needs no peer state.
    #[must_use]
    pub fn get_capabilities(&self) -> Value {
        self.engine.capabilities()
    }

    /// Point-in-time snapshot of every peer.
    pub async fn list_peers(&self) -> Result<Vec<PeerSnapshot>, RoomError> {
        self.room.list_peers().await
    }

    /// Register a new peer behind `sink` under a fresh connection id.
    ///
    /// The connection actor writes `welcome` to the sink before anything else.
    #[instrument(skip_all, name = "room.negotiation.connect")]
    pub async fn connect_peer(
        &self,
        sink: Box<dyn EventSink>,
    ) -> Result<(PeerId, ConnectionActorHandle), RoomError> {
        let peer_id = PeerId::generate();
        let connection = self.room.join(peer_id.clone(), sink).await?;
        Ok((peer_id, connection))
    }

    /// Unregister a peer and release everything it owned in the engine.
    ///
    /// Idempotent: returns `false` if the peer was already gone.
    #[instrument(skip_all, name = "room.negotiation.disconnect", fields(peer_id = %peer_id))]
    pub async fn disconnect_peer(&self, peer_id: &PeerId) -> Result<bool, RoomError> {
        if self.room.is_cancelled() {
            // Shutdown already retired and released every peer.
            debug!(
                target: "room.negotiation",
                peer_id = %peer_id,
                "Room stopped, nothing to unregister"
            );
            return Ok(false);
        }
        let start = Instant::now();
        let result = self.room.leave(peer_id.clone()).await;
        observe("unregister", start, &result);

        let Some(removal) = result? else {
            debug!(
                target: "room.negotiation",
                peer_id = %peer_id,
                "Peer already unregistered"
            );
            return Ok(false);
        };
        self.release_peer(removal).await;
        Ok(true)
    }

    /// Stop the room and release everything its remaining peers owned.
    ///
    /// Returns how many peers were retired. Negotiations still in flight
    /// fail at commit time and close what they created.
    #[instrument(skip_all, name = "room.negotiation.shutdown")]
    pub async fn shutdown(&self) -> Result<usize, RoomError> {
        let retired = self.room.shutdown().await?;
        let count = retired.len();
        for removal in retired {
            self.release_peer(removal).await;
        }
        info!(target: "room.negotiation", peers = count, "Room shut down");
        Ok(count)
    }

    /// Allocate a transport, replacing any previous one of the same direction.
    ///
    /// Ordering is create, commit, then close: the new transport is committed
    /// before the old one and everything bound to it is closed. A failed
    /// create therefore leaves the working transport in place, and a failed
    /// commit closes only the new one.
    #[instrument(
        skip_all,
        name = "room.negotiation.create_transport",
        fields(peer_id = %peer_id, direction = %direction)
    )]
    pub async fn create_transport(
        &self,
        peer_id: &PeerId,
        direction: Direction,
    ) -> Result<TransportParameters, RoomError> {
        let start = Instant::now();
        let result = self.create_transport_inner(peer_id, direction).await;
        observe("create_transport", start, &result);
        result
    }

    async fn create_transport_inner(
        &self,
        peer_id: &PeerId,
        direction: Direction,
    ) -> Result<TransportParameters, RoomError> {
        let _guard = self.lock_peer(peer_id).await?;

        let params = self.engine.create_transport(direction).await?;
        let record = TransportRecord::new(params.id.clone(), direction);

        match self.room.set_transport(peer_id.clone(), record).await {
            Ok(replacement) => {
                if let Some(previous) = &replacement.previous {
                    info!(
                        target: "room.negotiation",
                        peer_id = %peer_id,
                        previous = %previous.id,
                        transport_id = %params.id,
                        "Replacing transport"
                    );
                }
                self.release_replacement(replacement).await;
                Ok(params)
            }
            Err(e) => {
                self.release("transport", self.engine.close_transport(&params.id).await);
                Err(e)
            }
        }
    }

    /// Finalize the peer's transport for `direction`.
    #[instrument(
        skip_all,
        name = "room.negotiation.connect_transport",
        fields(peer_id = %peer_id, direction = %direction)
    )]
    pub async fn connect_transport(
        &self,
        peer_id: &PeerId,
        direction: Direction,
        dtls_parameters: &Value,
    ) -> Result<(), RoomError> {
        let start = Instant::now();
        let result = self
            .connect_transport_inner(peer_id, direction, dtls_parameters)
            .await;
        observe("connect_transport", start, &result);
        result
    }

    async fn connect_transport_inner(
        &self,
        peer_id: &PeerId,
        direction: Direction,
        dtls_parameters: &Value,
    ) -> Result<(), RoomError> {
        let _guard = self.lock_peer(peer_id).await?;
        let peer = self.find_peer(peer_id).await?;
        let transport_id = Self::transport_of(&peer, direction)?;

        self.engine.connect(&transport_id, dtls_parameters).await?;
        self.room
            .mark_connected(peer_id.clone(), direction, transport_id)
            .await
    }

    /// Publish a stream on the peer's send transport.
    ///
    /// `new-producer` has been enqueued to every other peer before this
    /// returns the new id.
    #[instrument(
        skip_all,
        name = "room.negotiation.produce",
        fields(peer_id = %peer_id, kind = %kind)
    )]
    pub async fn produce(
        &self,
        peer_id: &PeerId,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> Result<ProducerId, RoomError> {
        let start = Instant::now();
        let result = self.produce_inner(peer_id, kind, rtp_parameters).await;
        observe("produce", start, &result);
        result
    }

    async fn produce_inner(
        &self,
        peer_id: &PeerId,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> Result<ProducerId, RoomError> {
        let _guard = self.lock_peer(peer_id).await?;
        let peer = self.find_peer(peer_id).await?;
        let transport_id = Self::transport_of(&peer, Direction::Send)?;

        let producer_id = self
            .engine
            .produce(&transport_id, kind, rtp_parameters)
            .await?;
        let record = ProducerRecord {
            id: producer_id.clone(),
            kind,
            transport_id,
            paused: false,
        };

        if let Err(e) = self.room.add_producer(peer_id.clone(), record).await {
            self.release(
                "producer",
                self.engine
                    .control(producer_id.as_str(), ControlAction::Close)
                    .await,
            );
            return Err(e);
        }

        info!(
            target: "room.negotiation",
            peer_id = %peer_id,
            producer_id = %producer_id,
            "Producer created"
        );
        Ok(producer_id)
    }

    /// Subscribe the peer to a producer.
    ///
    /// Idempotent per (subscriber, producer): a repeat returns the existing
    /// consumer. New consumers start paused.
    #[instrument(
        skip_all,
        name = "room.negotiation.consume",
        fields(peer_id = %peer_id, producer_id = %producer_id)
    )]
    pub async fn consume(
        &self,
        peer_id: &PeerId,
        producer_id: &ProducerId,
        rtp_capabilities: &Value,
    ) -> Result<ConsumerDescriptor, RoomError> {
        let start = Instant::now();
        let result = self
            .consume_inner(peer_id, producer_id, rtp_capabilities)
            .await;
        observe("consume", start, &result);
        result
    }

    async fn consume_inner(
        &self,
        peer_id: &PeerId,
        producer_id: &ProducerId,
        rtp_capabilities: &Value,
    ) -> Result<ConsumerDescriptor, RoomError> {
        let _guard = self.lock_peer(peer_id).await?;
        let peer = self.find_peer(peer_id).await?;

        if let Some(existing) = peer.consumer_of(producer_id) {
            debug!(
                target: "room.negotiation",
                peer_id = %peer_id,
                consumer_id = %existing.id,
                "Returning existing consumer"
            );
            return Ok(existing.descriptor());
        }

        let transport_id = Self::transport_of(&peer, Direction::Recv)?;
        if self.room.find_producer(producer_id.clone()).await?.is_none() {
            return Err(RoomError::NotFound(format!(
                "Producer {producer_id} not found"
            )));
        }
        if !self
            .engine
            .can_consume(producer_id, rtp_capabilities)
            .await
        {
            return Err(RoomError::Unsupported(format!(
                "Cannot consume producer {producer_id} with the given capabilities"
            )));
        }

        let stream = self
            .engine
            .consume(&transport_id, producer_id, rtp_capabilities)
            .await?;
        let record = ConsumerRecord {
            id: stream.id,
            producer_id: stream.producer_id,
            kind: stream.kind,
            transport_id,
            rtp_parameters: stream.rtp_parameters,
            paused: stream.paused,
        };
        let descriptor = record.descriptor();

        if let Err(e) = self.room.add_consumer(peer_id.clone(), record).await {
            self.release(
                "consumer",
                self.engine
                    .control(descriptor.id.as_str(), ControlAction::Close)
                    .await,
            );
            return Err(e);
        }

        info!(
            target: "room.negotiation",
            peer_id = %peer_id,
            consumer_id = %descriptor.id,
            "Consumer created"
        );
        Ok(descriptor)
    }

    /// Pause, resume or close a producer or consumer the peer owns.
    ///
    /// `entity_kind` and `action` arrive as raw strings; an unknown value is
    /// a `BadRequest` and changes nothing. Closing a producer is local: no
    /// event is broadcast, but consumers of it are removed from every peer.
    #[instrument(
        skip_all,
        name = "room.negotiation.control",
        fields(peer_id = %peer_id, entity_id = %entity_id)
    )]
    pub async fn control(
        &self,
        peer_id: &PeerId,
        entity_kind: &str,
        entity_id: &str,
        action: &str,
    ) -> Result<(), RoomError> {
        let start = Instant::now();
        let result = self
            .control_inner(peer_id, entity_kind, entity_id, action)
            .await;
        observe("control", start, &result);
        result
    }

    async fn control_inner(
        &self,
        peer_id: &PeerId,
        entity_kind: &str,
        entity_id: &str,
        action: &str,
    ) -> Result<(), RoomError> {
        let kind: EntityKind = entity_kind
            .parse()
            .map_err(|e: common::types::UnknownVariant| RoomError::BadRequest(e.to_string()))?;
        let action: ControlAction = action
            .parse()
            .map_err(|e: common::types::UnknownVariant| RoomError::BadRequest(e.to_string()))?;

        let _guard = self.lock_peer(peer_id).await?;
        let peer = self.find_peer(peer_id).await?;
        let owned = match kind {
            EntityKind::Producer => peer.owns_producer(&ProducerId::from(entity_id)),
            EntityKind::Consumer => peer.owns_consumer(&ConsumerId::from(entity_id)),
        };
        if !owned {
            return Err(RoomError::NotFound(format!(
                "{} {entity_id} not found",
                kind.as_str()
            )));
        }

        match action {
            ControlAction::Pause | ControlAction::Resume => {
                self.engine.control(entity_id, action).await?;
                self.room
                    .set_paused(
                        peer_id.clone(),
                        kind,
                        entity_id.to_string(),
                        action == ControlAction::Pause,
                    )
                    .await
            }
            ControlAction::Close => {
                // NotFound: a cascade already closed it, so the directory
                // entry is stale either way. Anything else keeps the entry.
                match self.engine.control(entity_id, action).await {
                    Ok(()) | Err(EngineError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                match kind {
                    EntityKind::Producer => {
                        let removal = self
                            .room
                            .remove_producer(peer_id.clone(), ProducerId::from(entity_id))
                            .await?;
                        self.release_orphans(removal.orphaned_consumers).await;
                    }
                    EntityKind::Consumer => {
                        self.room
                            .remove_consumer(peer_id.clone(), ConsumerId::from(entity_id))
                            .await?;
                    }
                }
                info!(
                    target: "room.negotiation",
                    peer_id = %peer_id,
                    entity_kind = kind.as_str(),
                    entity_id = %entity_id,
                    "Entity closed"
                );
                Ok(())
            }
        }
    }

    async fn lock_peer(&self, peer_id: &PeerId) -> Result<OwnedMutexGuard<()>, RoomError> {
        let lock = self
            .room
            .peer_lock(peer_id.clone())
            .await?
            .ok_or_else(|| peer_not_found(peer_id))?;
        Ok(lock.lock_owned().await)
    }

    async fn find_peer(&self, peer_id: &PeerId) -> Result<Peer, RoomError> {
        self.room
            .find_peer(peer_id.clone())
            .await?
            .ok_or_else(|| peer_not_found(peer_id))
    }

    fn transport_of(peer: &Peer, direction: Direction) -> Result<TransportId, RoomError> {
        peer.transport(direction)
            .map(|t| t.id.clone())
            .ok_or_else(|| {
                RoomError::NotFound(format!(
                    "No {direction} transport for peer {}",
                    peer.id
                ))
            })
    }

    /// Close everything a departed peer owned.
    async fn release_peer(&self, removal: PeerRemoval) {
        let PeerRemoval {
            peer,
            orphaned_consumers,
        } = removal;

        for consumer in &peer.consumers {
            self.release(
                "consumer",
                self.engine
                    .control(consumer.id.as_str(), ControlAction::Close)
                    .await,
            );
        }
        for producer in &peer.producers {
            self.release(
                "producer",
                self.engine
                    .control(producer.id.as_str(), ControlAction::Close)
                    .await,
            );
        }
        for transport in [&peer.send_transport, &peer.recv_transport]
            .into_iter()
            .flatten()
        {
            self.release("transport", self.engine.close_transport(&transport.id).await);
        }
        self.release_orphans(orphaned_consumers).await;

        info!(
            target: "room.negotiation",
            peer_id = %peer.id,
            producers = peer.producers.len(),
            consumers = peer.consumers.len(),
            "Peer resources released"
        );
    }

    /// Close what a transport replacement displaced, old transport last.
    async fn release_replacement(&self, replacement: TransportReplacement) {
        for consumer in &replacement.detached_consumers {
            self.release(
                "consumer",
                self.engine
                    .control(consumer.id.as_str(), ControlAction::Close)
                    .await,
            );
        }
        for producer in &replacement.detached_producers {
            self.release(
                "producer",
                self.engine
                    .control(producer.id.as_str(), ControlAction::Close)
                    .await,
            );
        }
        self.release_orphans(replacement.orphaned_consumers).await;
        if let Some(previous) = replacement.previous {
            self.release("transport", self.engine.close_transport(&previous.id).await);
        }
    }

    async fn release_orphans(&self, orphans: OrphanedConsumers) {
        for (owner, consumer) in orphans {
            debug!(
                target: "room.negotiation",
                peer_id = %owner,
                consumer_id = %consumer.id,
                "Closing consumer of removed producer"
            );
            self.release(
                "consumer",
                self.engine
                    .control(consumer.id.as_str(), ControlAction::Close)
                    .await,
            );
        }
    }

    /// Log the outcome of a cleanup close. `NotFound` means an earlier
    /// cascade already closed the entity.
    fn release(&self, what: &'static str, result: Result<(), EngineError>) {
        match result {
            Ok(()) | Err(EngineError::NotFound(_)) => {}
            Err(e) => {
                warn!(
                    target: "room.negotiation",
                    entity = what,
                    error = %e,
                    "Failed to release engine entity"
                );
            }
        }
    }
}
