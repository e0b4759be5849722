//! Deterministic in-process media engine.
//!
//! Moves no media. It keeps just enough bookkeeping to enforce the same
//! preconditions a real SFU would (direction, connect-before-use, codec
//! support, capability matching, cascading close) so the room can run and be
//! tested end to end without an external engine.

use super::{ConsumedStream, EngineError, MediaEngine};
use async_trait::async_trait;
use common::protocol::TransportParameters;
use common::types::{ConsumerId, ControlAction, Direction, MediaKind, ProducerId, TransportId};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// First port handed out in ICE candidates.
const FIRST_PORT: u16 = 40000;

/// Codecs the loopback engine routes: (kind, mimeType, clockRate, channels).
const SUPPORTED_CODECS: &[(MediaKind, &str, u32, Option<u8>)] = &[
    (MediaKind::Audio, "audio/opus", 48000, Some(2)),
    (MediaKind::Video, "video/VP8", 90000, None),
    (MediaKind::Video, "video/H264", 90000, None),
];

#[derive(Debug)]
struct TransportEntry {
    direction: Direction,
    connected: bool,
}

#[derive(Debug)]
struct ProducerEntry {
    transport_id: TransportId,
    kind: MediaKind,
    codec: Value,
    paused: bool,
}

#[derive(Debug)]
struct ConsumerEntry {
    transport_id: TransportId,
    producer_id: ProducerId,
    paused: bool,
}

#[derive(Debug, Default)]
struct LoopbackState {
    transports: HashMap<TransportId, TransportEntry>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
}

impl LoopbackState {
    fn close_producer(&mut self, producer_id: &ProducerId) -> bool {
        if self.producers.remove(producer_id).is_none() {
            return false;
        }
        self.consumers.retain(|_, c| &c.producer_id != producer_id);
        true
    }
}

/// Live entity counts, used to assert nothing leaked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCounts {
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

/// In-process [`MediaEngine`] implementation.
#[derive(Debug)]
pub struct LoopbackEngine {
    listen_ips: Vec<String>,
    next_port: AtomicU16,
    state: Mutex<LoopbackState>,
}

impl LoopbackEngine {
    /// Create an engine announcing ICE candidates on `listen_ips`.
    #[must_use]
    pub fn new(listen_ips: Vec<String>) -> Self {
        Self {
            listen_ips,
            next_port: AtomicU16::new(FIRST_PORT),
            state: Mutex::new(LoopbackState::default()),
        }
    }

    /// Current number of live transports, producers and consumers.
    pub async fn counts(&self) -> EngineCounts {
        let state = self.state.lock().await;
        EngineCounts {
            transports: state.transports.len(),
            producers: state.producers.len(),
            consumers: state.consumers.len(),
        }
    }

    /// Whether the given producer or consumer is currently paused.
    pub async fn is_paused(&self, entity_id: &str) -> Option<bool> {
        let state = self.state.lock().await;
        if let Some(p) = state.producers.get(&ProducerId::from(entity_id)) {
            return Some(p.paused);
        }
        state
            .consumers
            .get(&ConsumerId::from(entity_id))
            .map(|c| c.paused)
    }

    fn ice_candidates(&self, port: u16) -> Value {
        Value::Array(
            self.listen_ips
                .iter()
                .map(|ip| {
                    json!({
                        "foundation": "udpcandidate",
                        "ip": ip,
                        "port": port,
                        "priority": 1_076_302_079_u32,
                        "protocol": "udp",
                        "type": "host"
                    })
                })
                .collect(),
        )
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new(vec!["127.0.0.1".to_string()])
    }
}

fn capabilities_descriptor() -> Value {
    let codecs: Vec<Value> = SUPPORTED_CODECS
        .iter()
        .enumerate()
        .map(|(i, (kind, mime, clock_rate, channels))| {
            let mut codec = json!({
                "kind": kind.as_str(),
                "mimeType": mime,
                "clockRate": clock_rate,
                "preferredPayloadType": 100 + i,
            });
            if let (Some(channels), Some(obj)) = (channels, codec.as_object_mut()) {
                obj.insert("channels".to_string(), json!(channels));
            }
            codec
        })
        .collect();
    json!({ "codecs": codecs, "headerExtensions": [] })
}

/// First codec `mimeType` in an RTP parameter or capability object.
fn first_mime_type(params: &Value) -> Option<&str> {
    params
        .get("codecs")?
        .as_array()?
        .first()?
        .get("mimeType")?
        .as_str()
}

fn supported_codec(mime: &str) -> Option<&'static (MediaKind, &'static str, u32, Option<u8>)> {
    SUPPORTED_CODECS
        .iter()
        .find(|(_, m, _, _)| m.eq_ignore_ascii_case(mime))
}

fn capabilities_accept(rtp_capabilities: &Value, mime: &str) -> bool {
    rtp_capabilities
        .get("codecs")
        .and_then(Value::as_array)
        .is_some_and(|codecs| {
            codecs.iter().any(|c| {
                c.get("mimeType")
                    .and_then(Value::as_str)
                    .is_some_and(|m| m.eq_ignore_ascii_case(mime))
            })
        })
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    fn capabilities(&self) -> Value {
        capabilities_descriptor()
    }

    async fn create_transport(
        &self,
        direction: Direction,
    ) -> Result<TransportParameters, EngineError> {
        let id = TransportId::from(Uuid::new_v4().to_string());
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);

        let params = TransportParameters {
            id: id.clone(),
            ice_parameters: json!({
                "usernameFragment": Uuid::new_v4().simple().to_string(),
                "password": Uuid::new_v4().simple().to_string(),
                "iceLite": true
            }),
            ice_candidates: self.ice_candidates(port),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{
                    "algorithm": "sha-256",
                    "value": Uuid::new_v4().simple().to_string()
                }]
            }),
        };

        self.state.lock().await.transports.insert(
            id.clone(),
            TransportEntry {
                direction,
                connected: false,
            },
        );
        debug!(target: "room.engine", transport_id = %id, direction = %direction, "Transport created");
        Ok(params)
    }

    async fn connect(
        &self,
        transport_id: &TransportId,
        dtls_parameters: &Value,
    ) -> Result<(), EngineError> {
        if !dtls_parameters.is_object() {
            return Err(EngineError::Rejected(
                "dtlsParameters must be an object".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| EngineError::NotFound(format!("transport {transport_id}")))?;
        if transport.connected {
            return Err(EngineError::Rejected(format!(
                "transport {transport_id} already connected"
            )));
        }
        transport.connected = true;
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: &Value,
    ) -> Result<ProducerId, EngineError> {
        let mime = first_mime_type(rtp_parameters).ok_or_else(|| {
            EngineError::Rejected("rtpParameters.codecs[0].mimeType is required".to_string())
        })?;
        let (codec_kind, canonical_mime, clock_rate, _) = supported_codec(mime)
            .ok_or_else(|| EngineError::Unsupported(format!("codec {mime}")))?;
        if *codec_kind != kind {
            return Err(EngineError::Rejected(format!(
                "codec {mime} is not a {kind} codec"
            )));
        }

        let mut state = self.state.lock().await;
        let transport = state
            .transports
            .get(transport_id)
            .ok_or_else(|| EngineError::NotFound(format!("transport {transport_id}")))?;
        if transport.direction != Direction::Send {
            return Err(EngineError::Rejected(format!(
                "transport {transport_id} is not a send transport"
            )));
        }
        if !transport.connected {
            return Err(EngineError::Rejected(format!(
                "transport {transport_id} is not connected"
            )));
        }

        let id = ProducerId::from(Uuid::new_v4().to_string());
        state.producers.insert(
            id.clone(),
            ProducerEntry {
                transport_id: transport_id.clone(),
                kind,
                codec: json!({ "mimeType": canonical_mime, "clockRate": clock_rate }),
                paused: false,
            },
        );
        debug!(target: "room.engine", producer_id = %id, kind = %kind, "Producer created");
        Ok(id)
    }

    async fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &Value) -> bool {
        let state = self.state.lock().await;
        state.producers.get(producer_id).is_some_and(|p| {
            p.codec
                .get("mimeType")
                .and_then(Value::as_str)
                .is_some_and(|mime| capabilities_accept(rtp_capabilities, mime))
        })
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: &Value,
    ) -> Result<ConsumedStream, EngineError> {
        let mut state = self.state.lock().await;

        let transport = state
            .transports
            .get(transport_id)
            .ok_or_else(|| EngineError::NotFound(format!("transport {transport_id}")))?;
        if transport.direction != Direction::Recv {
            return Err(EngineError::Rejected(format!(
                "transport {transport_id} is not a receive transport"
            )));
        }
        if !transport.connected {
            return Err(EngineError::Rejected(format!(
                "transport {transport_id} is not connected"
            )));
        }

        let producer = state
            .producers
            .get(producer_id)
            .ok_or_else(|| EngineError::NotFound(format!("producer {producer_id}")))?;
        let mime = producer
            .codec
            .get("mimeType")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !capabilities_accept(rtp_capabilities, mime) {
            return Err(EngineError::Unsupported(format!(
                "cannot consume producer {producer_id}"
            )));
        }

        let kind = producer.kind;
        let rtp_parameters = json!({
            "codecs": [producer.codec.clone()],
            "encodings": [{ "ssrc": u32::from(self.next_port.fetch_add(1, Ordering::Relaxed)) }],
        });

        let id = ConsumerId::from(Uuid::new_v4().to_string());
        state.consumers.insert(
            id.clone(),
            ConsumerEntry {
                transport_id: transport_id.clone(),
                producer_id: producer_id.clone(),
                paused: true,
            },
        );
        debug!(target: "room.engine", consumer_id = %id, producer_id = %producer_id, "Consumer created");

        Ok(ConsumedStream {
            id,
            producer_id: producer_id.clone(),
            kind,
            rtp_parameters,
            paused: true,
        })
    }

    async fn control(&self, entity_id: &str, action: ControlAction) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        let producer_id = ProducerId::from(entity_id);
        let consumer_id = ConsumerId::from(entity_id);

        match action {
            ControlAction::Close => {
                if state.close_producer(&producer_id)
                    || state.consumers.remove(&consumer_id).is_some()
                {
                    Ok(())
                } else {
                    Err(EngineError::NotFound(entity_id.to_string()))
                }
            }
            ControlAction::Pause | ControlAction::Resume => {
                let paused = action == ControlAction::Pause;
                if let Some(p) = state.producers.get_mut(&producer_id) {
                    p.paused = paused;
                    Ok(())
                } else if let Some(c) = state.consumers.get_mut(&consumer_id) {
                    c.paused = paused;
                    Ok(())
                } else {
                    Err(EngineError::NotFound(entity_id.to_string()))
                }
            }
        }
    }

    async fn close_transport(&self, transport_id: &TransportId) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        if state.transports.remove(transport_id).is_none() {
            return Err(EngineError::NotFound(format!("transport {transport_id}")));
        }

        let doomed: Vec<ProducerId> = state
            .producers
            .iter()
            .filter(|(_, p)| &p.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for producer_id in &doomed {
            state.close_producer(producer_id);
        }
        state
            .consumers
            .retain(|_, c| &c.transport_id != transport_id);

        debug!(target: "room.engine", transport_id = %transport_id, producers_closed = doomed.len(), "Transport closed");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn vp8() -> Value {
        json!({"codecs": [{"mimeType": "video/VP8", "clockRate": 90000}]})
    }

    async fn connected(engine: &LoopbackEngine, direction: Direction) -> TransportId {
        let params = engine.create_transport(direction).await.unwrap();
        engine
            .connect(&params.id, &params.dtls_parameters)
            .await
            .unwrap();
        params.id
    }

    #[test]
    fn test_capabilities_list_codecs() {
        let caps = LoopbackEngine::default().capabilities();
        let mimes: Vec<&str> = caps["codecs"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["mimeType"].as_str().unwrap())
            .collect();
        assert_eq!(mimes, vec!["audio/opus", "video/VP8", "video/H264"]);
        assert_eq!(caps["codecs"][0]["channels"], 2);
    }

    #[tokio::test]
    async fn test_create_transport_announces_each_listen_ip() {
        let engine = LoopbackEngine::new(vec!["10.0.0.1".into(), "10.0.0.2".into()]);
        let params = engine.create_transport(Direction::Send).await.unwrap();

        let candidates = params.ice_candidates.as_array().unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates.get(1).unwrap()["ip"], "10.0.0.2");
        assert!(params.dtls_parameters["fingerprints"].is_array());
        assert_eq!(engine.counts().await.transports, 1);
    }

    #[tokio::test]
    async fn test_connect_requires_object_and_only_once() {
        let engine = LoopbackEngine::default();
        let params = engine.create_transport(Direction::Recv).await.unwrap();

        assert!(matches!(
            engine.connect(&params.id, &Value::Null).await,
            Err(EngineError::Rejected(_))
        ));
        engine.connect(&params.id, &json!({})).await.unwrap();
        assert!(matches!(
            engine.connect(&params.id, &json!({})).await,
            Err(EngineError::Rejected(_))
        ));
        assert!(matches!(
            engine.connect(&TransportId::from("nope"), &json!({})).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_produce_preconditions() {
        let engine = LoopbackEngine::default();
        let unconnected = engine.create_transport(Direction::Send).await.unwrap().id;
        assert!(matches!(
            engine.produce(&unconnected, MediaKind::Video, &vp8()).await,
            Err(EngineError::Rejected(_))
        ));

        let recv = connected(&engine, Direction::Recv).await;
        assert!(matches!(
            engine.produce(&recv, MediaKind::Video, &vp8()).await,
            Err(EngineError::Rejected(_))
        ));

        let send = connected(&engine, Direction::Send).await;
        assert!(matches!(
            engine.produce(&send, MediaKind::Audio, &vp8()).await,
            Err(EngineError::Rejected(_))
        ));
        assert!(matches!(
            engine
                .produce(
                    &send,
                    MediaKind::Video,
                    &json!({"codecs": [{"mimeType": "video/AV1"}]})
                )
                .await,
            Err(EngineError::Unsupported(_))
        ));
        assert!(engine.produce(&send, MediaKind::Video, &vp8()).await.is_ok());
        assert_eq!(engine.counts().await.producers, 1);
    }

    #[tokio::test]
    async fn test_can_consume_is_case_insensitive_mime_match() {
        let engine = LoopbackEngine::default();
        let send = connected(&engine, Direction::Send).await;
        let producer = engine.produce(&send, MediaKind::Video, &vp8()).await.unwrap();

        assert!(
            engine
                .can_consume(&producer, &json!({"codecs": [{"mimeType": "VIDEO/vp8"}]}))
                .await
        );
        assert!(
            !engine
                .can_consume(&producer, &json!({"codecs": [{"mimeType": "video/H264"}]}))
                .await
        );
        assert!(!engine.can_consume(&producer, &json!({})).await);
        assert!(
            !engine
                .can_consume(&ProducerId::from("ghost"), &engine.capabilities())
                .await
        );
    }

    #[tokio::test]
    async fn test_consume_starts_paused_and_rejects_mismatch() {
        let engine = LoopbackEngine::default();
        let send = connected(&engine, Direction::Send).await;
        let recv = connected(&engine, Direction::Recv).await;
        let producer = engine.produce(&send, MediaKind::Video, &vp8()).await.unwrap();

        let stream = engine
            .consume(&recv, &producer, &engine.capabilities())
            .await
            .unwrap();
        assert!(stream.paused);
        assert_eq!(stream.kind, MediaKind::Video);
        assert_eq!(stream.rtp_parameters["codecs"][0]["mimeType"], "video/VP8");
        assert_eq!(engine.is_paused(stream.id.as_str()).await, Some(true));

        let err = engine
            .consume(&recv, &producer, &json!({"codecs": []}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Unsupported(_)));
        assert_eq!(engine.counts().await.consumers, 1);
    }

    #[tokio::test]
    async fn test_control_pause_resume_close() {
        let engine = LoopbackEngine::default();
        let send = connected(&engine, Direction::Send).await;
        let recv = connected(&engine, Direction::Recv).await;
        let producer = engine.produce(&send, MediaKind::Video, &vp8()).await.unwrap();
        let consumer = engine
            .consume(&recv, &producer, &engine.capabilities())
            .await
            .unwrap()
            .id;

        engine
            .control(consumer.as_str(), ControlAction::Resume)
            .await
            .unwrap();
        assert_eq!(engine.is_paused(consumer.as_str()).await, Some(false));

        engine
            .control(producer.as_str(), ControlAction::Pause)
            .await
            .unwrap();
        assert_eq!(engine.is_paused(producer.as_str()).await, Some(true));

        engine
            .control(producer.as_str(), ControlAction::Close)
            .await
            .unwrap();
        let counts = engine.counts().await;
        assert_eq!(counts.producers, 0);
        assert_eq!(counts.consumers, 0, "closing a producer closes its consumers");

        assert!(matches!(
            engine.control("ghost", ControlAction::Pause).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_close_transport_cascades() {
        let engine = LoopbackEngine::default();
        let send = connected(&engine, Direction::Send).await;
        let recv = connected(&engine, Direction::Recv).await;
        let producer = engine.produce(&send, MediaKind::Video, &vp8()).await.unwrap();
        engine
            .consume(&recv, &producer, &engine.capabilities())
            .await
            .unwrap();

        engine.close_transport(&send).await.unwrap();
        assert_eq!(
            engine.counts().await,
            EngineCounts {
                transports: 1,
                producers: 0,
                consumers: 0
            }
        );
        assert!(matches!(
            engine.close_transport(&send).await,
            Err(EngineError::NotFound(_))
        ));
    }
}
