//! Publish/subscribe broker seam.
//!
//! The gateway needs two things from a broker:
//!
//! - a [`Producer`] that accepts records without waiting for delivery
//!   confirmation (ingress publishes fire-and-forget), and
//! - a [`Consumer`] that yields deliveries in append order and lets the
//!   broadcast loop acknowledge each one after dispatch.
//!
//! ```text
//! IngressPipeline ──publish──► Producer ─┐
//!                                        │  topic (ordered log)
//! BroadcastPipeline ◄──recv/ack── Consumer ◄┘
//! ```
//!
//! Backends: [`memory`] (in-process, single instance) and [`redis_stream`]
//! (Redis Streams; every gateway instance reads the whole stream through a
//! consumer group of its own).

pub mod memory;
pub mod redis_stream;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use memory::{MemoryConsumer, MemoryProducer};
pub use redis_stream::{RedisConsumer, RedisProducer};

/// Position of a delivery in its backend, used to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryTag {
    /// Offset in an in-process log.
    Offset(u64),
    /// Redis stream entry id.
    StreamId(String),
}

/// One record received from the subscription.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: Bytes,
    pub tag: DeliveryTag,
}

impl Delivery {
    pub fn new(payload: impl Into<Bytes>, tag: DeliveryTag) -> Self {
        Self {
            payload: payload.into(),
            tag,
        }
    }
}

/// Write side of the broker.
pub trait Producer: Send + Sync {
    /// Queue `payload` on `topic` under `key`. Returns once the record is
    /// queued; delivery failures after that point are the backend's to log.
    fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<(), BrokerError>;
}

/// Read side of the broker.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Wait for the next delivery. `None` means the subscription is closed.
    async fn recv(&mut self) -> Option<Result<Delivery, BrokerError>>;

    /// Mark a delivery as processed.
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError>;
}

/// Which backend to build at start-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Cannot connect to broker: {0}")]
    Connect(String),
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),
    #[error("Producer queue full")]
    Backpressure,
    #[error("Broker connection closed")]
    Closed,
    #[error("Foreign delivery tag: {0:?}")]
    ForeignTag(DeliveryTag),
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
