//! Room service error types.
//!
//! Every error maps to one of the envelope codes from `common::error`.
//! Internal details are logged server-side but not exposed to clients.

use crate::engine::EngineError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::error::{ErrorCode, ErrorResponse};
use thiserror::Error;

/// Room service error type.
///
/// Status mapping:
/// - `NotFound`: 404
/// - `Unsupported`: 412
/// - `Conflict`: 409
/// - `BadRequest`: 400
/// - `Engine`, `Internal`: 500
#[derive(Debug, Error)]
pub enum RoomError {
    /// Peer, transport, producer or consumer does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Capability mismatch between a producer and a subscriber.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Duplicate registration.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed request.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The media engine failed for a reason the client cannot fix.
    #[error("Media engine error: {0}")]
    Engine(String),

    /// Actor channel failures and other server faults.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RoomError {
    /// Returns the envelope code for this error.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RoomError::NotFound(_) => ErrorCode::NotFound,
            RoomError::Unsupported(_) => ErrorCode::Unsupported,
            RoomError::Conflict(_) => ErrorCode::Conflict,
            RoomError::BadRequest(_) => ErrorCode::BadRequest,
            RoomError::Engine(_) | RoomError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Returns the HTTP status for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            RoomError::NotFound(_) => StatusCode::NOT_FOUND,
            RoomError::Unsupported(_) => StatusCode::PRECONDITION_FAILED,
            RoomError::Conflict(_) => StatusCode::CONFLICT,
            RoomError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RoomError::Engine(_) | RoomError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a client-safe message.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            RoomError::NotFound(msg)
            | RoomError::Unsupported(msg)
            | RoomError::Conflict(msg)
            | RoomError::BadRequest(msg) => msg.clone(),
            RoomError::Engine(_) | RoomError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }

    /// Short label for the `status` dimension of negotiation metrics.
    #[must_use]
    pub const fn metric_label(&self) -> &'static str {
        match self {
            RoomError::NotFound(_) => "not_found",
            RoomError::Unsupported(_) => "unsupported",
            RoomError::Conflict(_) => "conflict",
            RoomError::BadRequest(_) => "bad_request",
            RoomError::Engine(_) | RoomError::Internal(_) => "error",
        }
    }
}

impl From<EngineError> for RoomError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound(msg) => RoomError::NotFound(msg),
            EngineError::Unsupported(msg) => RoomError::Unsupported(msg),
            EngineError::Rejected(msg) => RoomError::BadRequest(msg),
            EngineError::Failed(msg) => RoomError::Engine(msg),
        }
    }
}

impl IntoResponse for RoomError {
    fn into_response(self) -> Response {
        match &self {
            RoomError::Engine(err) => {
                tracing::error!(target: "room.engine", error = %err, "Media engine operation failed");
            }
            RoomError::Internal(err) => {
                tracing::error!(target: "room.service", error = %err, "Internal error");
            }
            _ => {}
        }

        let body = ErrorResponse::new(self.error_code(), self.client_message());
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(err: RoomError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_not_found_envelope() {
        let (status, body) = body_json(RoomError::NotFound("Peer not found".to_string())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NOT_FOUND");
        assert_eq!(body["error"]["message"], "Peer not found");
    }

    #[tokio::test]
    async fn test_unsupported_is_412() {
        let (status, body) =
            body_json(RoomError::Unsupported("Cannot consume producer".to_string())).await;
        assert_eq!(status, StatusCode::PRECONDITION_FAILED);
        assert_eq!(body["error"]["code"], "UNSUPPORTED");
    }

    #[tokio::test]
    async fn test_internal_details_are_hidden() {
        let (status, body) =
            body_json(RoomError::Engine("worker 3 crashed at 0xdeadbeef".to_string())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["code"], "INTERNAL_ERROR");
        assert_eq!(body["error"]["message"], "An internal error occurred");
    }

    #[test]
    fn test_engine_error_mapping() {
        assert!(matches!(
            RoomError::from(EngineError::NotFound("t".into())),
            RoomError::NotFound(_)
        ));
        assert!(matches!(
            RoomError::from(EngineError::Unsupported("c".into())),
            RoomError::Unsupported(_)
        ));
        assert!(matches!(
            RoomError::from(EngineError::Rejected("dtls".into())),
            RoomError::BadRequest(_)
        ));
        assert!(matches!(
            RoomError::from(EngineError::Failed("boom".into())),
            RoomError::Engine(_)
        ));
    }

    #[test]
    fn test_status_and_code_agree() {
        let cases = [
            (RoomError::Conflict(String::new()), StatusCode::CONFLICT, "CONFLICT"),
            (RoomError::BadRequest(String::new()), StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            (
                RoomError::Internal(String::new()),
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
            ),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.status_code(), status);
            assert_eq!(err.error_code().as_str(), code);
        }
    }
}
