//! Room client error types.
//!
//! Server failures arrive as the JSON error envelope and are mapped back to
//! the same taxonomy the server uses. `is_retryable` tells the reconciler
//! which failed subscriptions are worth another attempt.

use common::error::{ErrorCode, ErrorResponse};
use thiserror::Error;

/// Room client error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Peer, transport, producer or consumer does not exist (yet).
    #[error("Not found: {0}")]
    NotFound(String),

    /// Capability mismatch; permanent for this producer.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Duplicate registration.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The server rejected the request as malformed.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The server failed internally.
    #[error("Server error: {0}")]
    Server(String),

    /// The request never got an answer (connect, timeout, socket error).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server sent something this client does not understand.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The participant or its actor has shut down.
    #[error("Client closed")]
    Closed,
}

impl ClientError {
    /// Whether the failed operation may succeed if retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::NotFound(_) | ClientError::Server(_) | ClientError::Transport(_)
        )
    }

    /// Map an error envelope to a client error.
    #[must_use]
    pub fn from_envelope(envelope: ErrorResponse) -> Self {
        let message = envelope.error.message;
        match envelope.error.code {
            ErrorCode::NotFound => ClientError::NotFound(message),
            ErrorCode::Unsupported => ClientError::Unsupported(message),
            ErrorCode::Conflict => ClientError::Conflict(message),
            ErrorCode::BadRequest => ClientError::BadRequest(message),
            ErrorCode::InternalError => ClientError::Server(message),
        }
    }

    /// Map a bare HTTP status (no parsable envelope) to a client error.
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        let message = format!("HTTP {status}");
        match status {
            404 => ClientError::NotFound(message),
            412 => ClientError::Unsupported(message),
            409 => ClientError::Conflict(message),
            400..=499 => ClientError::BadRequest(message),
            _ => ClientError::Server(message),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClientError::Protocol(err.to_string())
        } else {
            ClientError::Transport(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_mapping() {
        let err = ClientError::from_envelope(ErrorResponse::new(
            ErrorCode::Unsupported,
            "Cannot consume",
        ));
        assert_eq!(err, ClientError::Unsupported("Cannot consume".to_string()));

        let err =
            ClientError::from_envelope(ErrorResponse::new(ErrorCode::InternalError, "oops"));
        assert!(matches!(err, ClientError::Server(_)));
    }

    #[test]
    fn test_status_fallback() {
        assert!(matches!(ClientError::from_status(404), ClientError::NotFound(_)));
        assert!(matches!(ClientError::from_status(412), ClientError::Unsupported(_)));
        assert!(matches!(ClientError::from_status(422), ClientError::BadRequest(_)));
        assert!(matches!(ClientError::from_status(503), ClientError::Server(_)));
    }

    #[test]
    fn test_retryable() {
        assert!(ClientError::NotFound(String::new()).is_retryable());
        assert!(ClientError::Transport(String::new()).is_retryable());
        assert!(ClientError::Server(String::new()).is_retryable());
        assert!(!ClientError::Unsupported(String::new()).is_retryable());
        assert!(!ClientError::Conflict(String::new()).is_retryable());
        assert!(!ClientError::BadRequest(String::new()).is_retryable());
        assert!(!ClientError::Closed.is_retryable());
    }
}
