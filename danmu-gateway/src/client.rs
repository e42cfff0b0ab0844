//! One accepted connection and its lifecycle state.
//!
//! A `Client` owns the write half of its WebSocket. Every outbound frame,
//! whether a broadcast comment or a heartbeat ping, goes through the same
//! async mutex, so at most one writer touches the sink at a time. Each write
//! is bounded by `write_timeout`; a peer that cannot keep up is treated as
//! failed rather than buffered.
//!
//! ```text
//!                 ┌──────────── Client ────────────┐
//! Broadcast ──┐   │                                │
//!             ├──►│ sink: Mutex<WsSink> ──► socket │
//! Heartbeat ──┘   │ last_pong_at                   │
//!                 │ cleaned: AtomicBool (one-shot) │
//! Cleaner ───────►│ shutdown: watch<bool> ─────────┼──► ingress / heartbeat stop
//!                 └────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, SinkExt};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::protocol::RoomId;

/// Boxed write half of a client connection.
pub type WsSink = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;

/// Opaque per-connection identifier, unique for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A registered connection.
pub struct Client {
    id: ClientId,
    room_id: RoomId,
    addr: Option<SocketAddr>,
    sink: Mutex<WsSink>,
    write_timeout: Duration,
    /// Only written by the pong handler (and the heartbeat's start).
    last_pong_at: parking_lot::Mutex<Instant>,
    cleaned: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Client {
    /// Wrap the write half of a connection that has joined `room_id`.
    pub fn new<S>(room_id: RoomId, sink: S, write_timeout: Duration) -> Self
    where
        S: Sink<Message, Error = tungstenite::Error> + Send + 'static,
    {
        let (shutdown, _) = watch::channel(false);
        let sink: WsSink = Box::pin(sink);
        Self {
            id: ClientId::new(),
            room_id,
            addr: None,
            sink: Mutex::new(sink),
            write_timeout,
            last_pong_at: parking_lot::Mutex::new(Instant::now()),
            cleaned: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Attach the peer address (for logging).
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Write one frame, serialized against every other writer.
    ///
    /// Fails with [`GatewayError::WriteTimeout`] when the peer does not
    /// accept the frame within the write deadline.
    pub async fn send(&self, msg: Message) -> Result<()> {
        if self.is_cleaned() {
            return Err(GatewayError::ClientClosed);
        }
        let mut sink = self.sink.lock().await;
        // The cleaner may have run while this writer queued for the lock.
        if self.is_cleaned() {
            return Err(GatewayError::ClientClosed);
        }
        match tokio::time::timeout(self.write_timeout, sink.send(msg)).await {
            Ok(result) => result.map_err(GatewayError::from),
            Err(_) => Err(GatewayError::WriteTimeout(self.write_timeout)),
        }
    }

    /// Send a heartbeat ping.
    pub async fn send_ping(&self) -> Result<()> {
        self.send(Message::Ping(Bytes::from_static(b"keepalive"))).await
    }

    pub fn record_pong(&self) {
        *self.last_pong_at.lock() = Instant::now();
    }

    pub fn last_pong_at(&self) -> Instant {
        *self.last_pong_at.lock()
    }

    /// Flip the client to terminal. Returns `true` for exactly one caller.
    pub fn try_mark_cleaned(&self) -> bool {
        self.cleaned
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_cleaned(&self) -> bool {
        self.cleaned.load(Ordering::Acquire)
    }

    /// Close the transport and stop the connection's background tasks.
    ///
    /// The close handshake is bounded by the write deadline; the shutdown
    /// signal fires regardless of its outcome.
    pub(crate) async fn close(&self) {
        {
            let mut sink = self.sink.lock().await;
            match tokio::time::timeout(self.write_timeout, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::debug!("Close of client {} failed: {e}", self.id),
                Err(_) => log::debug!("Close of client {} timed out", self.id),
            }
        }
        self.shutdown.send_replace(true);
    }

    /// Resolves once the transport has been closed by the cleaner.
    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("room_id", &self.room_id)
            .field("addr", &self.addr)
            .field("cleaned", &self.is_cleaned())
            .finish()
    }
}

/// In-memory sinks for exercising clients without a socket.
#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum SinkMode {
        Accept,
        /// Never becomes ready: simulates a peer that stopped reading.
        Stall,
        /// Every send fails as if the socket were gone.
        Fail,
    }

    #[derive(Clone)]
    pub(crate) struct RecordingSink {
        pub frames: Arc<parking_lot::Mutex<Vec<Message>>>,
        pub closes: Arc<AtomicUsize>,
        mode: SinkMode,
    }

    impl RecordingSink {
        pub fn new(mode: SinkMode) -> Self {
            Self {
                frames: Arc::new(parking_lot::Mutex::new(Vec::new())),
                closes: Arc::new(AtomicUsize::new(0)),
                mode,
            }
        }

        pub fn frames(&self) -> Vec<Message> {
            self.frames.lock().clone()
        }

        pub fn texts(&self) -> Vec<String> {
            self.frames
                .lock()
                .iter()
                .filter_map(|m| match m {
                    Message::Text(t) => Some(t.as_str().to_string()),
                    _ => None,
                })
                .collect()
        }

        pub fn close_count(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    impl Sink<Message> for RecordingSink {
        type Error = tungstenite::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            match self.mode {
                SinkMode::Stall => Poll::Pending,
                _ => Poll::Ready(Ok(())),
            }
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
            match self.mode {
                SinkMode::Fail => Err(tungstenite::Error::ConnectionClosed),
                _ => {
                    self.frames.lock().push(item);
                    Ok(())
                }
            }
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }

    /// A client in `room_id` writing into a fresh recording sink.
    pub(crate) fn client(room_id: RoomId, mode: SinkMode) -> (Arc<Client>, RecordingSink) {
        let sink = RecordingSink::new(mode);
        let client = Arc::new(Client::new(
            room_id,
            sink.clone(),
            Duration::from_millis(100),
        ));
        (client, sink)
    }
}
