//! Room service configuration.
//!
//! Configuration is loaded from environment variables; every value has a
//! default so the service starts with an empty environment.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP and WebSocket bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3002";

/// Default browser origins allowed by CORS.
pub const DEFAULT_ALLOWED_ORIGINS: &str = "http://127.0.0.1:3000,http://localhost:3000";

/// Default IP announced in ICE candidates.
pub const DEFAULT_LISTEN_IPS: &str = "127.0.0.1";

/// Default capacity of each recipient's event queue.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default per-request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;

/// Default readiness drain period in seconds.
pub const DEFAULT_DRAIN_SECONDS: u64 = 0;

/// Room service configuration.
#[derive(Clone)]
pub struct Config {
    /// Server bind address (default: "0.0.0.0:3002").
    pub bind_address: String,

    /// Origins allowed by CORS. Empty means same-origin only.
    pub allowed_origins: Vec<String>,

    /// IPs announced by the loopback engine in ICE candidates.
    pub listen_ips: Vec<String>,

    /// Per-recipient event queue capacity. A full queue disconnects the recipient.
    pub event_channel_capacity: usize,

    /// HTTP request timeout.
    pub request_timeout: Duration,

    /// Time between marking the service not-ready and closing the listener.
    pub drain_period: Duration,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("allowed_origins", &self.allowed_origins)
            .field("listen_ips", &self.listen_ips)
            .field("event_channel_capacity", &self.event_channel_capacity)
            .field("request_timeout_secs", &self.request_timeout.as_secs())
            .field("drain_secs", &self.drain_period.as_secs())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            allowed_origins: split_list(DEFAULT_ALLOWED_ORIGINS),
            listen_ips: split_list(DEFAULT_LISTEN_IPS),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECONDS),
            drain_period: Duration::from_secs(DEFAULT_DRAIN_SECONDS),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("ROOM_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let allowed_origins = split_list(
            vars.get("ROOM_ALLOWED_ORIGINS")
                .map_or(DEFAULT_ALLOWED_ORIGINS, String::as_str),
        );

        let listen_ips = split_list(
            vars.get("ROOM_LISTEN_IPS")
                .map_or(DEFAULT_LISTEN_IPS, String::as_str),
        );
        if listen_ips.is_empty() {
            return Err(ConfigError::InvalidValue(
                "ROOM_LISTEN_IPS must name at least one address".to_string(),
            ));
        }

        let event_channel_capacity = parse_or(
            vars,
            "ROOM_EVENT_CHANNEL_CAPACITY",
            DEFAULT_EVENT_CHANNEL_CAPACITY,
        )?;
        if event_channel_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "ROOM_EVENT_CHANNEL_CAPACITY must be greater than zero".to_string(),
            ));
        }

        let request_timeout_seconds = parse_or(
            vars,
            "ROOM_REQUEST_TIMEOUT_SECONDS",
            DEFAULT_REQUEST_TIMEOUT_SECONDS,
        )?;
        if request_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "ROOM_REQUEST_TIMEOUT_SECONDS must be greater than zero".to_string(),
            ));
        }
        let drain_seconds = parse_or(vars, "ROOM_DRAIN_SECONDS", DEFAULT_DRAIN_SECONDS)?;

        Ok(Config {
            bind_address,
            allowed_origins,
            listen_ips,
            event_channel_capacity,
            request_timeout: Duration::from_secs(request_timeout_seconds),
            drain_period: Duration::from_secs(drain_seconds),
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_or<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}={raw}"))),
        None => Ok(default),
    }
}
