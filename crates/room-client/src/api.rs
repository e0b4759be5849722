//! Negotiation API client.
//!
//! [`RoomApi`] is the request/response surface of the room service as the
//! participant sees it. [`HttpRoomApi`] talks to a real server; the
//! [`mock`] module provides a scripted implementation for tests.

use crate::config::ClientConfig;
use crate::errors::ClientError;
use async_trait::async_trait;
use common::error::ErrorResponse;
use common::protocol::{
    Ack, ConnectTransportRequest, ConsumeRequest, ConsumerDescriptor, ControlRequest,
    CreateTransportRequest, PeerSnapshot, ProduceRequest, ProduceResponse, TransportParameters,
};
use common::types::{ControlAction, Direction, EntityKind, MediaKind, PeerId, ProducerId};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::debug;

/// Negotiation calls a participant makes against the room service.
#[async_trait]
pub trait RoomApi: Send + Sync + 'static {
    async fn get_capabilities(&self) -> Result<Value, ClientError>;

    /// Point-in-time snapshot of every peer.
    async fn list_peers(&self) -> Result<Vec<PeerSnapshot>, ClientError>;

    async fn create_transport(
        &self,
        peer_id: &PeerId,
        direction: Direction,
    ) -> Result<TransportParameters, ClientError>;

    async fn connect_transport(
        &self,
        peer_id: &PeerId,
        direction: Direction,
        dtls_parameters: &Value,
    ) -> Result<(), ClientError>;

    async fn produce(
        &self,
        peer_id: &PeerId,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> Result<ProducerId, ClientError>;

    async fn consume(
        &self,
        peer_id: &PeerId,
        producer_id: &ProducerId,
        rtp_capabilities: &Value,
    ) -> Result<ConsumerDescriptor, ClientError>;

    async fn control(
        &self,
        peer_id: &PeerId,
        entity_kind: EntityKind,
        entity_id: &str,
        action: ControlAction,
    ) -> Result<(), ClientError>;
}

/// [`RoomApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRoomApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRoomApi {
    /// Build a client for the configured room service.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Transport` if the HTTP client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.room_url.clone(),
        })
    }

    async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R, ClientError> {
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            .send()
            .await?;
        Self::decode(path, response).await
    }

    async fn post<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ClientError> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await?;
        Self::decode(path, response).await
    }

    async fn decode<R: DeserializeOwned>(
        path: &str,
        response: reqwest::Response,
    ) -> Result<R, ClientError> {
        let status = response.status();
        if status.is_success() {
            return response.json::<R>().await.map_err(|e| {
                ClientError::Protocol(format!("unexpected response from {path}: {e}"))
            });
        }

        let bytes = response.bytes().await?;
        let err = match serde_json::from_slice::<ErrorResponse>(&bytes) {
            Ok(envelope) => ClientError::from_envelope(envelope),
            Err(_) => ClientError::from_status(status.as_u16()),
        };
        debug!(target: "client.api", path, status = status.as_u16(), error = %err, "Request failed");
        Err(err)
    }
}

#[async_trait]
impl RoomApi for HttpRoomApi {
    async fn get_capabilities(&self) -> Result<Value, ClientError> {
        self.get("/capabilities").await
    }

    async fn list_peers(&self) -> Result<Vec<PeerSnapshot>, ClientError> {
        self.get("/peers").await
    }

    async fn create_transport(
        &self,
        peer_id: &PeerId,
        direction: Direction,
    ) -> Result<TransportParameters, ClientError> {
        self.post(
            "/create_transport",
            &CreateTransportRequest::new(peer_id.clone(), direction),
        )
        .await
    }

    async fn connect_transport(
        &self,
        peer_id: &PeerId,
        direction: Direction,
        dtls_parameters: &Value,
    ) -> Result<(), ClientError> {
        let _: Ack = self
            .post(
                "/transport_connect",
                &ConnectTransportRequest {
                    socket_id: peer_id.clone(),
                    direction,
                    dtls_parameters: dtls_parameters.clone(),
                },
            )
            .await?;
        Ok(())
    }

    async fn produce(
        &self,
        peer_id: &PeerId,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> Result<ProducerId, ClientError> {
        let response: ProduceResponse = self
            .post(
                "/transport_produce",
                &ProduceRequest {
                    socket_id: peer_id.clone(),
                    kind,
                    rtp_parameters: rtp_parameters.clone(),
                },
            )
            .await?;
        Ok(response.id)
    }

    async fn consume(
        &self,
        peer_id: &PeerId,
        producer_id: &ProducerId,
        rtp_capabilities: &Value,
    ) -> Result<ConsumerDescriptor, ClientError> {
        self.post(
            "/transport_consume",
            &ConsumeRequest {
                socket_id: peer_id.clone(),
                producer_id: producer_id.clone(),
                rtp_capabilities: rtp_capabilities.clone(),
            },
        )
        .await
    }

    async fn control(
        &self,
        peer_id: &PeerId,
        entity_kind: EntityKind,
        entity_id: &str,
        action: ControlAction,
    ) -> Result<(), ClientError> {
        let _: Ack = self
            .post(
                "/control",
                &ControlRequest {
                    socket_id: peer_id.clone(),
                    entity_kind: entity_kind.as_str().to_string(),
                    entity_id: entity_id.to_string(),
                    action: action.as_str().to_string(),
                },
            )
            .await?;
        Ok(())
    }
}

/// Mock room API module for testing.
///
/// This module provides a scripted [`RoomApi`] for use in tests.
pub mod mock {

    use super::*;
    use common::types::{ConsumerId, TransportId};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    /// How the mock answers `consume` for one producer.
    #[derive(Debug, Clone)]
    pub enum ConsumeScript {
        /// Fail with this error.
        Fail(ClientError),
        /// Wait until the gate is notified, then succeed.
        Gated(Arc<Notify>),
    }

    /// Scripted [`RoomApi`].
    ///
    /// `consume` succeeds with a descriptor derived from the producer id
    /// (`c-<producer>`) unless a script says otherwise. Every call is recorded.
    #[derive(Debug, Default)]
    pub struct MockRoomApi {
        peers: Mutex<Vec<PeerSnapshot>>,
        consume_scripts: Mutex<HashMap<ProducerId, ConsumeScript>>,
        consume_calls: Mutex<Vec<ProducerId>>,
        controls: Mutex<Vec<(EntityKind, String, ControlAction)>>,
        next_id: AtomicUsize,
    }

    impl MockRoomApi {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Snapshot returned by `list_peers`.
        pub fn set_peers(&self, peers: Vec<PeerSnapshot>) {
            if let Ok(mut guard) = self.peers.lock() {
                *guard = peers;
            }
        }

        /// Script the answer to `consume` for `producer_id`.
        pub fn script_consume(&self, producer_id: impl Into<ProducerId>, script: ConsumeScript) {
            if let Ok(mut guard) = self.consume_scripts.lock() {
                guard.insert(producer_id.into(), script);
            }
        }

        /// Drop any script for `producer_id`, so `consume` succeeds again.
        pub fn clear_script(&self, producer_id: &ProducerId) {
            if let Ok(mut guard) = self.consume_scripts.lock() {
                guard.remove(producer_id);
            }
        }

        /// Producer ids passed to `consume`, in call order.
        #[must_use]
        pub fn consume_calls(&self) -> Vec<ProducerId> {
            self.consume_calls
                .lock()
                .map(|g| g.clone())
                .unwrap_or_default()
        }

        /// Control calls, in call order.
        #[must_use]
        pub fn controls(&self) -> Vec<(EntityKind, String, ControlAction)> {
            self.controls.lock().map(|g| g.clone()).unwrap_or_default()
        }

        /// Consumer id the mock hands out for `producer_id`.
        #[must_use]
        pub fn consumer_id_for(producer_id: &ProducerId) -> ConsumerId {
            ConsumerId::from(format!("c-{producer_id}"))
        }

        fn next_id(&self, prefix: &str) -> String {
            format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[async_trait]
    impl RoomApi for MockRoomApi {
        async fn get_capabilities(&self) -> Result<Value, ClientError> {
            Ok(json!({"codecs": [{"kind": "audio", "mimeType": "audio/opus"}]}))
        }

        async fn list_peers(&self) -> Result<Vec<PeerSnapshot>, ClientError> {
            Ok(self.peers.lock().map(|g| g.clone()).unwrap_or_default())
        }

        async fn create_transport(
            &self,
            _peer_id: &PeerId,
            _direction: Direction,
        ) -> Result<TransportParameters, ClientError> {
            Ok(TransportParameters {
                id: TransportId::from(self.next_id("t")),
                ice_parameters: json!({}),
                ice_candidates: json!([]),
                dtls_parameters: json!({}),
            })
        }

        async fn connect_transport(
            &self,
            _peer_id: &PeerId,
            _direction: Direction,
            _dtls_parameters: &Value,
        ) -> Result<(), ClientError> {
            Ok(())
        }

        async fn produce(
            &self,
            _peer_id: &PeerId,
            _kind: MediaKind,
            _rtp_parameters: &Value,
        ) -> Result<ProducerId, ClientError> {
            Ok(ProducerId::from(self.next_id("p")))
        }

        async fn consume(
            &self,
            _peer_id: &PeerId,
            producer_id: &ProducerId,
            _rtp_capabilities: &Value,
        ) -> Result<ConsumerDescriptor, ClientError> {
            if let Ok(mut calls) = self.consume_calls.lock() {
                calls.push(producer_id.clone());
            }
            let script = self
                .consume_scripts
                .lock()
                .ok()
                .and_then(|g| g.get(producer_id).cloned());
            match script {
                Some(ConsumeScript::Fail(err)) => return Err(err),
                Some(ConsumeScript::Gated(gate)) => gate.notified().await,
                None => {}
            }
            Ok(ConsumerDescriptor {
                id: Self::consumer_id_for(producer_id),
                producer_id: producer_id.clone(),
                kind: MediaKind::Audio,
                rtp_parameters: json!({}),
                paused: true,
            })
        }

        async fn control(
            &self,
            _peer_id: &PeerId,
            entity_kind: EntityKind,
            entity_id: &str,
            action: ControlAction,
        ) -> Result<(), ClientError> {
            if let Ok(mut controls) = self.controls.lock() {
                controls.push((entity_kind, entity_id.to_string(), action));
            }
            Ok(())
        }
    }
}
