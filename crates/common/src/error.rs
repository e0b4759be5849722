//! JSON error envelope shared by the room service and its clients.
//!
//! ```json
//! {"error": {"code": "NOT_FOUND", "message": "Peer not found"}}
//! ```

use serde::{Deserialize, Serialize};

/// Machine-readable error codes carried in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Referenced peer, transport, producer or consumer is absent.
    NotFound,
    /// Capability mismatch; permanent for the producer/subscriber pair.
    Unsupported,
    /// Duplicate registration.
    Conflict,
    /// Malformed request; no state change happened.
    BadRequest,
    /// Anything else. Details stay in the server log.
    InternalError,
}

impl ErrorCode {
    /// Returns the wire form of the code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Unsupported => "UNSUPPORTED",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Error response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

/// Error details inside the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorResponse {
    /// Build an envelope.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code,
                message: message.into(),
            },
        }
    }
}
