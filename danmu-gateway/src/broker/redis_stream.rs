//! Redis Streams backend.
//!
//! ```text
//! RedisProducer ──XADD topic * room <key> data <bytes>──► stream "topic"
//!                                                            │
//! RedisConsumer ◄──XREADGROUP GROUP g c BLOCK ms STREAMS topic >
//!               ──XACK topic g <id>──►
//! ```
//!
//! Every gateway instance must see every entry, because its clients may sit
//! in any room. A single shared group would hand each entry to one instance
//! only, so each instance reads through a group of its own, named
//! `{group}-{consumer}` (see [`instance_group`]). The consumer name must be
//! unique per instance. Entries are appended by one background task per
//! producer, so the records of one connection reach the stream in the order
//! they were read.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::{BrokerError, Consumer, Delivery, DeliveryTag, Producer};

/// Stream field holding the encoded envelope.
pub const PAYLOAD_FIELD: &str = "data";
/// Stream field holding the record key (room id).
pub const KEY_FIELD: &str = "room";

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Consumer group read by one gateway instance.
pub fn instance_group(group: &str, consumer: &str) -> String {
    format!("{group}-{consumer}")
}

/// Connect to the first reachable endpoint, in order.
pub async fn connect_any(endpoints: &[String]) -> Result<MultiplexedConnection, BrokerError> {
    let mut last_error = None;
    for endpoint in endpoints {
        let attempt: redis::RedisResult<MultiplexedConnection> = async {
            let client = redis::Client::open(endpoint.as_str())?;
            client.get_multiplexed_async_connection().await
        }
        .await;
        match attempt {
            Ok(conn) => {
                log::info!("Connected to Redis at {endpoint}");
                return Ok(conn);
            }
            Err(e) => {
                log::warn!("Redis endpoint {endpoint} unavailable: {e}");
                last_error = Some(format!("{endpoint}: {e}"));
            }
        }
    }
    Err(BrokerError::Connect(
        last_error.unwrap_or_else(|| "no broker endpoints configured".to_string()),
    ))
}

struct Record {
    topic: String,
    key: String,
    payload: Bytes,
}

/// Queues records for a background `XADD` task.
#[derive(Clone)]
pub struct RedisProducer {
    tx: mpsc::Sender<Record>,
}

impl RedisProducer {
    pub async fn connect(endpoints: &[String], queue_capacity: usize) -> Result<Self, BrokerError> {
        let conn = connect_any(endpoints).await?;
        Ok(Self::spawn(conn, queue_capacity))
    }

    fn spawn(mut conn: MultiplexedConnection, queue_capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Record>(queue_capacity.max(1));
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let fields = [
                    (KEY_FIELD, record.key.as_bytes()),
                    (PAYLOAD_FIELD, record.payload.as_ref()),
                ];
                let appended: redis::RedisResult<String> =
                    conn.xadd(&record.topic, "*", &fields[..]).await;
                match appended {
                    Ok(id) => log::trace!("Appended {id} to {}", record.topic),
                    // At-most-once: the record is dropped, not retried.
                    Err(e) => log::error!("XADD to {} failed: {e}", record.topic),
                }
            }
            log::debug!("Redis producer task stopped");
        });
        Self { tx }
    }
}

impl Producer for RedisProducer {
    fn publish(&self, topic: &str, key: &str, payload: Bytes) -> Result<(), BrokerError> {
        let record = Record {
            topic: topic.to_string(),
            key: key.to_string(),
            payload,
        };
        self.tx.try_send(record).map_err(|e| match e {
            TrySendError::Full(_) => BrokerError::Backpressure,
            TrySendError::Closed(_) => BrokerError::Closed,
        })
    }
}

/// Consumer-group reader for one stream.
pub struct RedisConsumer {
    conn: MultiplexedConnection,
    topic: String,
    group: String,
    consumer: String,
    block: Duration,
    batch: usize,
    buffered: VecDeque<Delivery>,
}

impl RedisConsumer {
    /// Connect and join this instance's group, derived from `group` and
    /// `consumer` (created at the stream tail if missing).
    pub async fn connect(
        endpoints: &[String],
        topic: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        block: Duration,
    ) -> Result<Self, BrokerError> {
        let mut conn = connect_any(endpoints).await?;
        let topic = topic.into();
        let consumer = consumer.into();
        let group: String = group.into();
        let group = instance_group(&group, &consumer);

        let created: redis::RedisResult<()> =
            conn.xgroup_create_mkstream(&topic, &group, "$").await;
        match created {
            Ok(()) => log::info!("Created consumer group {group} on {topic}"),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                log::debug!("Consumer group {group} already exists on {topic}")
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            conn,
            topic,
            group,
            consumer,
            block,
            batch: 128,
            buffered: VecDeque::new(),
        })
    }

    async fn fill(&mut self) -> Result<(), BrokerError> {
        let opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .block(self.block.as_millis() as usize)
            .count(self.batch);
        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[&self.topic], &[">"], &opts)
            .await?;

        // `None` means the block window elapsed with nothing new.
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in key.ids {
                // A record without a payload still has to be acknowledged;
                // the broadcast side will fail to decode and skip it.
                let payload: Vec<u8> = entry.get(PAYLOAD_FIELD).unwrap_or_default();
                self.buffered
                    .push_back(Delivery::new(payload, DeliveryTag::StreamId(entry.id)));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Consumer for RedisConsumer {
    async fn recv(&mut self) -> Option<Result<Delivery, BrokerError>> {
        loop {
            if let Some(delivery) = self.buffered.pop_front() {
                return Some(Ok(delivery));
            }
            if let Err(e) = self.fill().await {
                tokio::time::sleep(RETRY_DELAY).await;
                return Some(Err(e));
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BrokerError> {
        match &delivery.tag {
            DeliveryTag::StreamId(id) => {
                let _: i64 = self.conn.xack(&self.topic, &self.group, &[id]).await?;
                Ok(())
            }
            other => Err(BrokerError::ForeignTag(other.clone())),
        }
    }
}
