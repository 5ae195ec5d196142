//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from a TOML file;
//! every field has a default so a minimal config (or none at all, with the
//! CLI supplying port and socket) is valid.

use serde::{Deserialize, Serialize};

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Backend socket and reconnect policy.
    pub backend: BackendConfig,

    /// Identity reported to the backend via CGI parameters.
    pub server: ServerConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Backend connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Path to the Unix socket the FastCGI program listens on.
    pub socket_path: String,

    /// Connect retry policy.
    pub connect: ConnectConfig,

    /// Collection window for the get-values exchange, in milliseconds.
    /// The protocol defines no explicit terminator, so the exchange is
    /// bounded by this timer.
    pub values_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            socket_path: String::new(),
            connect: ConnectConfig::default(),
            values_timeout_ms: 100,
        }
    }
}

/// Connect retry policy: exponential backoff, doubling each attempt.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Retries after the initial attempt. Only connection-refused is
    /// retried; all other errors are immediately fatal.
    pub max_retries: u32,

    /// First backoff delay in milliseconds; each retry doubles it.
    pub base_delay_ms: u64,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 100,
        }
    }
}

/// Server identity configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Value of the SERVER_SOFTWARE CGI parameter.
    pub software: String,

    /// Value of the SERVER_NAME CGI parameter. The Host header still
    /// reaches the backend as HTTP_HOST.
    pub name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            software: format!("fcgi-gate/{}", env!("CARGO_PKG_VERSION")),
            name: "unknown".to_string(),
        }
    }
}
