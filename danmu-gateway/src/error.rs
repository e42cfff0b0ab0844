use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::broker::BrokerError;
use crate::config::ConfigError;
use crate::protocol::{ProtocolError, RoomId};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Room does not exist: {0}")]
    RoomNotFound(RoomId),
    #[error("WebSocket error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("Write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("Client already cleaned")]
    ClientClosed,
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;
