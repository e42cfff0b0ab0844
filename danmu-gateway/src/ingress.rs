//! Per-connection read loop: client frames → broker.
//!
//! Each text or binary frame is decoded as an [`Envelope`] only to validate
//! it; the original bytes are what gets published, keyed by the envelope's
//! own room. Publishing is fire-and-forget: a failed publish is logged and
//! the connection keeps reading. When the loop ends, for whatever reason,
//! the client is handed to the cleaner exactly once.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::broker::Producer;
use crate::cleaner::{Cleaner, CleanupGuard};
use crate::client::Client;
use crate::protocol::{Envelope, WireFormat};
use crate::server::GatewayStats;

/// Why the read loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Peer sent a close frame or the stream ended.
    PeerClosed,
    /// Read failed at the transport level.
    ReadError(String),
    /// The client was cleaned by another detector.
    Shutdown,
}

pub struct IngressPipeline<S> {
    client: Arc<Client>,
    stream: S,
    producer: Arc<dyn Producer>,
    cleaner: Cleaner,
    format: WireFormat,
    topic: String,
    stats: Arc<GatewayStats>,
}

impl<S> IngressPipeline<S>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin + Send,
{
    pub fn new(
        client: Arc<Client>,
        stream: S,
        producer: Arc<dyn Producer>,
        cleaner: Cleaner,
        format: WireFormat,
        topic: impl Into<String>,
        stats: Arc<GatewayStats>,
    ) -> Self {
        Self {
            client,
            stream,
            producer,
            cleaner,
            format,
            topic: topic.into(),
            stats,
        }
    }

    /// Read until the connection ends, then clean the client up.
    pub async fn run(mut self) -> ExitReason {
        let guard = CleanupGuard::new(self.cleaner.clone(), self.client.clone());
        let reason = self.read_loop().await;
        log::debug!("Ingress for client {} stopped: {reason:?}", self.client.id());
        guard.finish().await;
        reason
    }

    async fn read_loop(&mut self) -> ExitReason {
        let client = self.client.clone();
        loop {
            let frame = tokio::select! {
                biased;
                _ = client.closed() => return ExitReason::Shutdown,
                frame = self.stream.next() => frame,
            };

            match frame {
                Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => {
                    self.forward(msg.into_data());
                }
                Some(Ok(Message::Pong(_))) => client.record_pong(),
                Some(Ok(Message::Close(frame))) => {
                    log::debug!("Client {} sent close: {frame:?}", client.id());
                    return ExitReason::PeerClosed;
                }
                // Pings are answered by the protocol layer.
                Some(Ok(Message::Ping(_) | Message::Frame(_))) => {}
                Some(Err(e)) => {
                    log::warn!("Read from client {} failed: {e}", client.id());
                    return ExitReason::ReadError(e.to_string());
                }
                None => return ExitReason::PeerClosed,
            }
        }
    }

    fn forward(&self, bytes: Bytes) {
        let envelope: Envelope = match self.format.decode(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Dropping undecodable frame from client {}: {e}", self.client.id());
                self.stats.record_dropped();
                return;
            }
        };

        let key = envelope.room_id.to_string();
        match self.producer.publish(&self.topic, &key, bytes) {
            Ok(()) => {
                log::trace!("Client {} published to room {key}", self.client.id());
                self.stats.record_published();
            }
            Err(e) => {
                log::error!("Publish from client {} failed: {e}", self.client.id());
                self.stats.record_publish_failure();
            }
        }
    }
}
