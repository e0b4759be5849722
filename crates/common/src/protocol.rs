//! HTTP request and response bodies.
//!
//! All bodies are camelCase JSON. Media parameters (ICE, DTLS, RTP) are
//! carried as opaque [`serde_json::Value`]s: the room never inspects them,
//! only the media engine does.

use crate::types::{ConsumerId, Direction, MediaKind, PeerId, ProducerId, TransportId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of `POST /create_transport`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportRequest {
    pub socket_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    /// Legacy flag: `true` for a send transport. Ignored when `direction` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_sender: Option<bool>,
}

impl CreateTransportRequest {
    /// Build a request for the given direction.
    #[must_use]
    pub fn new(socket_id: PeerId, direction: Direction) -> Self {
        Self {
            socket_id,
            direction: Some(direction),
            is_sender: None,
        }
    }

    /// Resolve the requested direction, honouring the legacy flag.
    #[must_use]
    pub fn resolved_direction(&self) -> Option<Direction> {
        self.direction.or(match self.is_sender {
            Some(true) => Some(Direction::Send),
            Some(false) => Some(Direction::Recv),
            None => None,
        })
    }
}

/// Parameters of a freshly created transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParameters {
    pub id: TransportId,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// Body of `POST /transport_connect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub socket_id: PeerId,
    pub direction: Direction,
    pub dtls_parameters: Value,
}

/// Body of `POST /transport_produce`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub socket_id: PeerId,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

/// Response of `POST /transport_produce`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceResponse {
    pub id: ProducerId,
}

/// Body of `POST /transport_consume`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub socket_id: PeerId,
    pub producer_id: ProducerId,
    pub rtp_capabilities: Value,
}

/// Response of `POST /transport_consume`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDescriptor {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub paused: bool,
}

/// Body of `POST /control`.
///
/// `entityKind` and `action` stay strings on the wire so that an unknown
/// value is answered with `BAD_REQUEST` rather than a deserialization error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRequest {
    pub socket_id: PeerId,
    pub entity_kind: String,
    pub entity_id: String,
    pub action: String,
}

/// Body of the legacy `POST /control_producer` route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerControlRequest {
    pub socket_id: PeerId,
    pub producer_id: ProducerId,
    pub action: String,
}

/// Body of the legacy `POST /control_consumer` route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerControlRequest {
    pub socket_id: PeerId,
    pub consumer_id: ConsumerId,
    pub action: String,
}

/// Empty acknowledgement (`{}`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {}

/// One entry of the `GET /peers` snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSnapshot {
    pub socket_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produce_transport: Option<TransportId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consume_transport: Option<TransportId>,
    #[serde(default)]
    pub producers: Vec<ProducerId>,
    #[serde(default)]
    pub consumers: Vec<ConsumerId>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_create_transport_accepts_direction() {
        let req: CreateTransportRequest =
            serde_json::from_value(json!({"socketId": "a", "direction": "recv"})).unwrap();
        assert_eq!(req.resolved_direction(), Some(Direction::Recv));
    }

    #[test]
    fn test_create_transport_accepts_legacy_is_sender() {
        let req: CreateTransportRequest =
            serde_json::from_value(json!({"socketId": "a", "isSender": true})).unwrap();
        assert_eq!(req.resolved_direction(), Some(Direction::Send));

        let req: CreateTransportRequest =
            serde_json::from_value(json!({"socketId": "a", "isSender": false})).unwrap();
        assert_eq!(req.resolved_direction(), Some(Direction::Recv));
    }

    #[test]
    fn test_create_transport_direction_wins_over_legacy_flag() {
        let req: CreateTransportRequest = serde_json::from_value(
            json!({"socketId": "a", "direction": "recv", "isSender": true}),
        )
        .unwrap();
        assert_eq!(req.resolved_direction(), Some(Direction::Recv));
    }

    #[test]
    fn test_create_transport_without_direction() {
        let req: CreateTransportRequest =
            serde_json::from_value(json!({"socketId": "a"})).unwrap();
        assert_eq!(req.resolved_direction(), None);
    }

    #[test]
    fn test_snapshot_omits_missing_transports() {
        let snapshot = PeerSnapshot {
            socket_id: PeerId::from("a"),
            produce_transport: None,
            consume_transport: Some(TransportId::from("t2")),
            producers: vec![ProducerId::from("p1")],
            consumers: vec![],
        };
        assert_eq!(
            serde_json::to_value(&snapshot).unwrap(),
            json!({
                "socketId": "a",
                "consumeTransport": "t2",
                "producers": ["p1"],
                "consumers": []
            })
        );
    }

    #[test]
    fn test_ack_is_empty_object() {
        assert_eq!(serde_json::to_value(Ack {}).unwrap(), json!({}));
    }
}
