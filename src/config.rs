//! Gateway configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config file.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::frame::DEFAULT_MAX_FRAME_SIZE;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:61613";
pub const DEFAULT_BACKEND: &str = "memory";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    /// Name of the messaging backend to bridge to.
    pub backend: String,
    pub transport: TransportConfig,
}

/// Socket and read-loop tuning shared by accepted and outbound connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// How often an idle read loop wakes up to check for shutdown.
    pub poll_interval_ms: u64,
    /// Send and receive buffer size. `None` leaves the OS default.
    pub socket_buffer_size: Option<usize>,
    pub keep_alive: Option<bool>,
    pub tcp_nodelay: Option<bool>,
    pub max_frame_size: usize,
    /// Wait for the read loop to finish when a connection is stopped.
    pub join_on_stop: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 61613)),
            backend: DEFAULT_BACKEND.to_string(),
            transport: TransportConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            socket_buffer_size: Some(64 * 1024),
            keep_alive: None,
            tcp_nodelay: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            join_on_stop: true,
        }
    }
}

impl GatewayConfig {
    /// Reads and validates a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transport.validate()
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Zero {
                field: "transport.poll_interval_ms",
            });
        }
        if self.max_frame_size == 0 {
            return Err(ConfigError::Zero {
                field: "transport.max_frame_size",
            });
        }
        if self.socket_buffer_size == Some(0) {
            return Err(ConfigError::Zero {
                field: "transport.socket_buffer_size",
            });
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
