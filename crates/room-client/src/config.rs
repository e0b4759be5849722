//! Room client configuration.
//!
//! Loaded from environment variables:
//!
//! - `ROOM_URL` - Base URL of the room service (default `http://localhost:3002`)
//! - `ROOM_REQUEST_TIMEOUT_SECONDS` - Per-request HTTP timeout (default 30)
//!
//! The signaling URL is derived: `http` becomes `ws`, `https` becomes `wss`,
//! and `/room` is appended.

use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Default room service URL.
pub const DEFAULT_ROOM_URL: &str = "http://localhost:3002";

/// Default HTTP request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Base URL for the negotiation calls, without a trailing slash.
    pub room_url: String,

    /// Signaling WebSocket URL.
    pub ws_url: String,

    /// HTTP request timeout.
    pub request_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },
}

impl ClientConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&std::env::vars().collect())
    }

    /// Load configuration from a variable map.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable cannot be parsed.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let room_url = vars
            .get("ROOM_URL")
            .map_or(DEFAULT_ROOM_URL, String::as_str);
        let mut config = Self::for_url(room_url)?;

        if let Some(raw) = vars.get("ROOM_REQUEST_TIMEOUT_SECONDS") {
            let secs: u64 = raw.parse().map_err(|e| ConfigError::InvalidValue {
                name: "ROOM_REQUEST_TIMEOUT_SECONDS",
                reason: format!("{e}"),
            })?;
            if secs == 0 {
                return Err(ConfigError::InvalidValue {
                    name: "ROOM_REQUEST_TIMEOUT_SECONDS",
                    reason: "must be greater than zero".to_string(),
                });
            }
            config.request_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Configuration for a room service at `room_url`, with default timeouts.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` unless the URL is `http(s)://…`.
    pub fn for_url(room_url: &str) -> Result<Self, ConfigError> {
        let room_url = room_url.trim_end_matches('/').to_string();
        let ws_base = if let Some(rest) = room_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = room_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(ConfigError::InvalidValue {
                name: "ROOM_URL",
                reason: format!("expected an http:// or https:// URL, got {room_url}"),
            });
        };

        Ok(Self {
            ws_url: format!("{ws_base}/room"),
            room_url,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECONDS),
        })
    }
}
