//! In-process broker: one topic, one ordered log, one consumer.
//!
//! Useful for a single gateway instance and for tests. Offsets are assigned
//! in receive order; acknowledging offset `n` commits everything up to it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::{BrokerError, Consumer, Delivery, DeliveryTag, Producer};

/// Create a connected producer/consumer pair for `topic`.
pub fn channel(topic: impl Into<String>, capacity: usize) -> (MemoryProducer, MemoryConsumer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let committed = Arc::new(AtomicU64::new(0));
    (
        MemoryProducer {
            topic: topic.into(),
            tx,
        },
        MemoryConsumer {
            rx,
            next_offset: 0,
            committed,
        },
    )
}

#[derive(Clone)]
pub struct MemoryProducer {
    topic: String,
    tx: mpsc::Sender<Bytes>,
}

impl MemoryProducer {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Producer for MemoryProducer {
    fn publish(&self, topic: &str, _key: &str, payload: Bytes) -> Result<(), BrokerError> {
        if topic != self.topic {
            return Err(BrokerError::UnknownTopic(topic.to_string()));
        }
        self.tx.try_send(payload).map_err(|e| match e {
            TrySendError::Full(_) => BrokerError::Backpressure,
            TrySendError::Closed(_) => BrokerError::Closed,
        })
    }
}

pub struct MemoryConsumer {
    rx: mpsc::Receiver<Bytes>,
    next_offset: u64,
    committed: Arc<AtomicU64>,
}

impl MemoryConsumer {
    /// Offset of the first record not yet acknowledged.
    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    /// Shared view of the committed offset, readable after the consumer
    /// has moved into the broadcast task.
    pub fn committed_handle(&self) -> Arc<AtomicU64> {
        self.committed.clone()
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn recv(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let payload = self.rx.recv().await?;
        let offset = self.next_offset;
        self.next_offset += 1;
        Some(Ok(Delivery::new(payload, DeliveryTag::Offset(offset))))
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        match &delivery.tag {
            DeliveryTag::Offset(offset) => {
                self.committed.fetch_max(offset + 1, Ordering::AcqRel);
                Ok(())
            }
            other => Err(BrokerError::ForeignTag(other.clone())),
        }
    }
}
