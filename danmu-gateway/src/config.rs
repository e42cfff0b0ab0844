//! Gateway configuration, loaded once from a TOML file at start-up.
//!
//! Every section and field has a default, so an empty file is a valid
//! single-instance configuration with the in-memory broker.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::broker::BrokerKind;
use crate::protocol::{RoomId, WireFormat};
use crate::room::DEFAULT_SHARDS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub broker: BrokerConfig,
    pub rooms: RoomsConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Zero disables the heartbeat.
    pub heartbeat_timeout_secs: u64,
    pub write_timeout_ms: u64,
    pub wire_format: WireFormat,
    pub room_shards: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            heartbeat_timeout_secs: 30,
            write_timeout_ms: 1000,
            wire_format: WireFormat::Json,
            room_shards: DEFAULT_SHARDS,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub kind: BrokerKind,
    pub endpoints: Vec<String>,
    pub topic: String,
    /// Prefix of the Redis consumer group; each instance reads through
    /// `{group}-{consumer}` so that every instance sees every entry.
    pub group: String,
    /// Must be unique per gateway instance.
    pub consumer: String,
    /// Records buffered between a publisher and the broker.
    pub queue_capacity: usize,
    /// How long a Redis consumer blocks waiting for new entries.
    pub block_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Memory,
            endpoints: vec!["redis://127.0.0.1:6379".to_string()],
            topic: "danmu".to_string(),
            group: "danmu-gateway".to_string(),
            consumer: "gateway-1".to_string(),
            queue_capacity: 4096,
            block_ms: 1000,
        }
    }
}

impl BrokerConfig {
    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomsConfig {
    /// Rooms provisioned at start-up.
    pub ids: Vec<RoomId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default `env_logger` filter; `RUST_LOG` takes precedence.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Read, parse and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&text)?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.write_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "server.write_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.server.room_shards == 0 {
            return Err(ConfigError::Validation(
                "server.room_shards must be at least 1".into(),
            ));
        }
        if self.broker.topic.trim().is_empty() {
            return Err(ConfigError::Validation("broker.topic must not be empty".into()));
        }
        if self.broker.queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "broker.queue_capacity must be greater than zero".into(),
            ));
        }
        if self.broker.kind == BrokerKind::Redis {
            if self.broker.endpoints.is_empty() {
                return Err(ConfigError::Validation(
                    "broker.endpoints needs at least one entry for the redis broker".into(),
                ));
            }
            if self.broker.group.is_empty() || self.broker.consumer.is_empty() {
                return Err(ConfigError::Validation(
                    "broker.group and broker.consumer must be set for the redis broker".into(),
                ));
            }
        }
        Ok(())
    }
}
