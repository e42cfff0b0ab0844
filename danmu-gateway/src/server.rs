//! WebSocket gateway: accept loop and connect contract.
//!
//! Architecture:
//! ```text
//!                ┌──────────────────── Gateway ─────────────────────┐
//! ws://…?room=7  │                                                  │
//! Client A ──────┼─► handshake ─► RoomRegistry ─► IngressPipeline ──┼─► Producer
//! Client B ──────┼─►   (reject)    ClientRegistry  HeartbeatMonitor │       │
//!                │                                                  │    broker
//!                │            BroadcastPipeline ◄─ Consumer ◄───────┼───────┘
//!                │                │ join_all                        │
//!                └────────────────┼─────────────────────────────────┘
//!                                 ▼
//!                      every member of room 7 (sender included)
//! ```
//!
//! Each accepted connection gets two tasks, ingress and heartbeat, tracked
//! in its own `JoinSet`; every connection handler is tracked in the
//! gateway's `JoinSet` so shutdown can drain them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::BroadcastPipeline;
use crate::broker::{Consumer, Producer};
use crate::cleaner::Cleaner;
use crate::client::Client;
use crate::config::ServerConfig;
use crate::error::{GatewayError, Result};
use crate::heartbeat::HeartbeatMonitor;
use crate::ingress::IngressPipeline;
use crate::protocol::{Rejection, RoomId, ROOM_PARAM};
use crate::registry::ClientRegistry;
use crate::room::{Room, RoomRegistry};

/// Upper bound on the HTTP upgrade of a fresh TCP connection.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Statistics ──────────────────────────────────────────────

/// Lock-free gateway counters. Read via [`GatewayStats::snapshot`].
#[derive(Debug, Default)]
pub struct GatewayStats {
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_broadcast: AtomicU64,
    frames_delivered: AtomicU64,
    write_failures: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Point-in-time copy of [`GatewayStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub rejected_connections: u64,
    pub active_connections: usize,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_broadcast: u64,
    pub frames_delivered: u64,
    pub write_failures: u64,
    pub messages_dropped: u64,
}

impl GatewayStats {
    pub fn record_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// One broker record fanned out to `delivered` clients.
    pub fn record_broadcast(&self, delivered: usize) {
        self.messages_broadcast.fetch_add(1, Ordering::Relaxed);
        self.frames_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active_connections: usize) -> StatsSnapshot {
        StatsSnapshot {
            total_connections: self.connections_accepted.load(Ordering::Relaxed),
            rejected_connections: self.connections_rejected.load(Ordering::Relaxed),
            active_connections,
            messages_published: self.messages_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            messages_broadcast: self.messages_broadcast.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
        }
    }
}

// ─── Connect contract ────────────────────────────────────────

/// Extract the room id from an upgrade request's query string.
///
/// The parameter must be present and parse as a signed decimal integer.
pub fn parse_room_id(query: Option<&str>) -> std::result::Result<RoomId, Rejection> {
    let value = query
        .and_then(|q| {
            form_urlencoded::parse(q.as_bytes())
                .find(|(key, _)| key == ROOM_PARAM)
                .map(|(_, value)| value.into_owned())
        })
        .ok_or(Rejection::IncorrectRoomId)?;
    value.parse().map_err(|_| Rejection::IncorrectRoomId)
}

// ─── Gateway ─────────────────────────────────────────────────

/// The danmaku gateway.
pub struct Gateway {
    config: ServerConfig,
    topic: String,
    rooms: Arc<RoomRegistry>,
    clients: Arc<ClientRegistry>,
    cleaner: Cleaner,
    producer: Arc<dyn Producer>,
    stats: Arc<GatewayStats>,
    shutdown: watch::Sender<bool>,
}

impl Gateway {
    /// Build a gateway with no rooms; provision them via [`Gateway::rooms`].
    pub fn new(config: ServerConfig, topic: impl Into<String>, producer: Arc<dyn Producer>) -> Self {
        let rooms = Arc::new(RoomRegistry::new(config.room_shards));
        let clients = Arc::new(ClientRegistry::new());
        let (shutdown, _) = watch::channel(false);
        Self {
            cleaner: Cleaner::new(rooms.clone(), clients.clone()),
            config,
            topic: topic.into(),
            rooms,
            clients,
            producer,
            stats: Arc::new(GatewayStats::default()),
            shutdown,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    pub fn cleaner(&self) -> &Cleaner {
        &self.cleaner
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.clients.len())
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener> {
        Ok(TcpListener::bind(self.config.listen_addr).await?)
    }

    /// Ask a running [`serve`](Self::serve) to stop.
    pub fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            log::info!("Gateway shutting down");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Accept connections on `listener` and broadcast from `consumer` until
    /// [`shutdown`](Self::shutdown) is called.
    ///
    /// On shutdown: stop accepting, clean every live client, drain the
    /// connection tasks, then stop the broadcast loop.
    pub async fn serve<C>(self: Arc<Self>, listener: TcpListener, consumer: C) -> Result<()>
    where
        C: Consumer + 'static,
    {
        let local_addr = listener.local_addr()?;
        log::info!(
            "Danmu gateway listening on {local_addr} ({} rooms, {:?})",
            self.rooms.room_count(),
            self.config.wire_format
        );

        let broadcast = tokio::spawn(
            BroadcastPipeline::new(
                consumer,
                self.rooms.clone(),
                self.cleaner.clone(),
                self.config.wire_format,
                self.stats.clone(),
            )
            .run(self.shutdown.subscribe()),
        );

        let mut connections = JoinSet::new();
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                biased;
                Ok(_) = shutdown.wait_for(|stop| *stop) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        log::debug!("New TCP connection from {peer}");
                        let gateway = self.clone();
                        connections.spawn(async move {
                            if let Err(e) = gateway.handle_connection(stream, peer).await {
                                log::warn!("Connection from {peer} failed: {e}");
                            }
                        });
                    }
                    Err(e) => log::error!("Accept failed: {e}"),
                },
                Some(joined) = connections.join_next() => {
                    if let Err(e) = joined {
                        log::error!("Connection task failed: {e}");
                    }
                }
            }
        }
        drop(listener);

        let live = self.clients.clients();
        log::info!("Closing {} live clients", live.len());
        join_all(live.iter().map(|client| self.cleaner.clean_client(client))).await;

        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                log::error!("Connection task failed: {e}");
            }
        }
        if let Err(e) = broadcast.await {
            log::error!("Broadcast task failed: {e}");
        }

        log::info!("Gateway stopped");
        Ok(())
    }

    /// Upgrade, validate the room, register, then run the client until it
    /// is cleaned.
    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut query = None;
        let capture_query = |req: &Request, resp: Response| {
            query = req.uri().query().map(str::to_owned);
            Ok::<_, ErrorResponse>(resp)
        };
        let mut ws = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            tokio_tungstenite::accept_hdr_async(stream, capture_query),
        )
        .await
        .map_err(|_| GatewayError::HandshakeTimeout(HANDSHAKE_TIMEOUT))??;

        let room = match self.resolve_room(query.as_deref()) {
            Ok(room) => room,
            Err(rejection) => {
                log::info!("Rejecting {peer} ({query:?}): {rejection}");
                self.stats.record_rejected();
                return self.reject(&mut ws, rejection).await;
            }
        };

        let (sink, stream) = ws.split();
        let client = Arc::new(
            Client::new(room.id(), sink, self.config.write_timeout()).with_addr(peer),
        );
        if !self.register(&room, &client) {
            log::debug!("Client {} ({peer}) was cleaned while registering", client.id());
            return Ok(());
        }
        self.stats.record_accepted();
        log::info!("Client {} ({peer}) joined room {}", client.id(), room.id());

        // Registered after shutdown began: nobody else will clean this one.
        if self.is_shutting_down() {
            self.cleaner.clean_client(&client).await;
            return Ok(());
        }

        let mut tasks = JoinSet::new();
        let ingress = IngressPipeline::new(
            client.clone(),
            stream,
            self.producer.clone(),
            self.cleaner.clone(),
            self.config.wire_format,
            self.topic.clone(),
            self.stats.clone(),
        );
        tasks.spawn(async move {
            ingress.run().await;
        });
        if let Some(monitor) = HeartbeatMonitor::new(
            client.clone(),
            self.cleaner.clone(),
            self.config.heartbeat_timeout(),
        ) {
            tasks.spawn(async move {
                monitor.run().await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                log::error!("Task for client {} failed: {e}", client.id());
            }
        }
        // Covers a panicked task that never reached its own cleanup.
        self.cleaner.clean_client(&client).await;
        Ok(())
    }

    /// Add `client` to the global registry, then to its room.
    ///
    /// The room makes the client visible to broadcast, which may clean it at
    /// any time. A cleanup that lands before both adds are done would leave
    /// a dead entry behind, so registration undoes itself and returns
    /// `false` once the client is found cleaned.
    pub(crate) fn register(&self, room: &Room, client: &Arc<Client>) -> bool {
        self.clients.add(client.clone());
        self.rooms.add_member(room, client);
        if client.is_cleaned() {
            self.rooms.remove_member(room, client);
            self.clients.remove(client);
            return false;
        }
        true
    }

    fn resolve_room(&self, query: Option<&str>) -> std::result::Result<Arc<Room>, Rejection> {
        let room_id = parse_room_id(query)?;
        self.rooms
            .get(room_id)
            .map_err(|_| Rejection::RoomDoesNotExist)
    }

    /// Send the rejection text, close, and wait briefly for the peer's close.
    async fn reject(&self, ws: &mut WebSocketStream<TcpStream>, rejection: Rejection) -> Result<()> {
        let deadline = self.config.write_timeout();
        let farewell = async {
            ws.send(Message::text(rejection.message())).await?;
            ws.close(None).await?;
            while let Some(Ok(_)) = ws.next().await {}
            Ok::<_, GatewayError>(())
        };
        match tokio::time::timeout(deadline, farewell).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::WriteTimeout(deadline)),
        }
    }
}
