//! Negotiation handlers.
//!
//! - `GET /capabilities` (alias `/rtp_capabilities`) - Engine capability descriptor
//! - `POST /create_transport` - Allocate a send or receive transport
//! - `POST /transport_connect` - Finalize a transport
//! - `POST /transport_produce` - Publish a stream
//! - `POST /transport_consume` - Subscribe to a stream
//! - `POST /control` - Pause, resume or close a producer or consumer
//! - `POST /control_producer`, `POST /control_consumer` - Legacy control routes
//!
//! Bodies are parsed by hand (see [`super::parse_body`]); every failure is
//! answered with the JSON error envelope.

use super::parse_body;
use crate::errors::RoomError;
use crate::routes::AppState;
use axum::{body::Bytes, extract::State, Json};
use common::protocol::{
    Ack, ConnectTransportRequest, ConsumeRequest, ConsumerControlRequest, ConsumerDescriptor,
    ControlRequest, CreateTransportRequest, ProduceRequest, ProduceResponse,
    ProducerControlRequest, TransportParameters,
};
use serde_json::Value;
use std::sync::Arc;

/// Handler for GET /capabilities
pub async fn capabilities(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.negotiator.get_capabilities())
}

/// Handler for POST /create_transport
///
/// `direction` is required unless the legacy `isSender` flag is present.
///
/// # Response
///
/// - 200 OK: Transport parameters
/// - 400 Bad Request: Malformed body or no direction
/// - 404 Not Found: Unknown peer
pub async fn create_transport(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<TransportParameters>, RoomError> {
    let request: CreateTransportRequest = parse_body(&body)?;
    let direction = request
        .resolved_direction()
        .ok_or_else(|| RoomError::BadRequest("direction is required".to_string()))?;

    let params = state
        .negotiator
        .create_transport(&request.socket_id, direction)
        .await?;
    Ok(Json(params))
}

/// Handler for POST /transport_connect
pub async fn transport_connect(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Ack>, RoomError> {
    let request: ConnectTransportRequest = parse_body(&body)?;
    state
        .negotiator
        .connect_transport(
            &request.socket_id,
            request.direction,
            &request.dtls_parameters,
        )
        .await?;
    Ok(Json(Ack {}))
}

/// Handler for POST /transport_produce
///
/// # Response
///
/// - 200 OK: `{"id": producerId}`, after `new-producer` was enqueued to
///   every other peer
/// - 400 Bad Request: Malformed body or parameters the engine rejects
/// - 404 Not Found: Unknown peer or no send transport
pub async fn transport_produce(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<ProduceResponse>, RoomError> {
    let request: ProduceRequest = parse_body(&body)?;
    let id = state
        .negotiator
        .produce(&request.socket_id, request.kind, &request.rtp_parameters)
        .await?;
    Ok(Json(ProduceResponse { id }))
}

/// Handler for POST /transport_consume
///
/// # Response
///
/// - 200 OK: Consumer descriptor (new consumers are paused)
/// - 404 Not Found: Unknown peer or producer, or no receive transport
/// - 412 Precondition Failed: Capabilities cannot consume the producer
pub async fn transport_consume(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<ConsumerDescriptor>, RoomError> {
    let request: ConsumeRequest = parse_body(&body)?;
    let descriptor = state
        .negotiator
        .consume(
            &request.socket_id,
            &request.producer_id,
            &request.rtp_capabilities,
        )
        .await?;
    Ok(Json(descriptor))
}

/// Handler for POST /control
pub async fn control(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Ack>, RoomError> {
    let request: ControlRequest = parse_body(&body)?;
    state
        .negotiator
        .control(
            &request.socket_id,
            &request.entity_kind,
            &request.entity_id,
            &request.action,
        )
        .await?;
    Ok(Json(Ack {}))
}

/// Handler for POST /control_producer
pub async fn control_producer(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Ack>, RoomError> {
    let request: ProducerControlRequest = parse_body(&body)?;
    state
        .negotiator
        .control(
            &request.socket_id,
            "producer",
            request.producer_id.as_str(),
            &request.action,
        )
        .await?;
    Ok(Json(Ack {}))
}

/// Handler for POST /control_consumer
pub async fn control_consumer(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Ack>, RoomError> {
    let request: ConsumerControlRequest = parse_body(&body)?;
    state
        .negotiator
        .control(
            &request.socket_id,
            "consumer",
            request.consumer_id.as_str(),
            &request.action,
        )
        .await?;
    Ok(Json(Ack {}))
}
