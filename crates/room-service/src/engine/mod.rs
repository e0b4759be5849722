//! Media engine adapter.
//!
//! The room never touches media itself. Everything it needs from the engine
//! goes through [`MediaEngine`], keyed by opaque ids the engine issued. The
//! adapter holds no room-level state: which peer owns which transport is the
//! directory's business.

mod loopback;

pub use loopback::{EngineCounts, LoopbackEngine};

use async_trait::async_trait;
use common::protocol::TransportParameters;
use common::types::{ConsumerId, ControlAction, Direction, MediaKind, ProducerId, TransportId};
use serde_json::Value;
use thiserror::Error;

/// Errors reported by the media engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The referenced transport, producer or consumer does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The producer cannot be consumed with the given capabilities.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Parameters were rejected (bad DTLS, wrong direction, unknown codec kind).
    #[error("rejected: {0}")]
    Rejected(String),

    /// The engine itself failed.
    #[error("engine failure: {0}")]
    Failed(String),
}

/// A consumer freshly created by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedStream {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    /// Engine convention: consumers start paused.
    pub paused: bool,
}

/// Capability surface the negotiation sequencer consumes.
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Capability descriptor handed to clients before they negotiate.
    fn capabilities(&self) -> Value;

    /// Allocate a transport in the given direction.
    async fn create_transport(&self, direction: Direction)
        -> Result<TransportParameters, EngineError>;

    /// Finalize a transport with the client's DTLS parameters.
    async fn connect(
        &self,
        transport_id: &TransportId,
        dtls_parameters: &Value,
    ) -> Result<(), EngineError>;

    /// Publish a stream on a connected send transport.
    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> Result<ProducerId, EngineError>;

    /// Whether a receiver with `rtp_capabilities` can consume the producer.
    async fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &Value) -> bool;

    /// Subscribe a connected receive transport to a producer.
    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: &Value,
    ) -> Result<ConsumedStream, EngineError>;

    /// Pause, resume or close a producer or consumer.
    ///
    /// Closing a producer also closes every consumer of it.
    async fn control(&self, entity_id: &str, action: ControlAction) -> Result<(), EngineError>;

    /// Close a transport together with its producers and consumers.
    async fn close_transport(&self, transport_id: &TransportId) -> Result<(), EngineError>;
}
