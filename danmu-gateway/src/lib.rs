//! # danmu-gateway — WebSocket fan-out for live-stream comments
//!
//! Clients join one room over WebSocket and send comments; the gateway
//! publishes them to a broker topic, consumes the topic back and pushes every
//! record to all clients in the record's room.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  ws://host/?room=7   ┌────────────────┐  publish  ┌──────────┐
//! │ Client   │ ───────────────────► │ IngressPipeline│ ────────► │          │
//! │ (room 7) │                      └────────────────┘           │  Broker  │
//! │          │ ◄─────────────────── ┌──────────────────┐ recv   │  topic   │
//! └──────────┘   text/binary frame  │ BroadcastPipeline│ ◄───── │          │
//!                                   └────────┬─────────┘         └──────────┘
//!                                            │ snapshot
//!                                   ┌────────┴─────────┐
//!                                   │ RoomRegistry     │
//!                                   │ (sharded, Weak)  │
//!                                   └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Envelope wire format and connect rejections
//! - [`client`] — Connection handle with serialized, deadline-bounded writes
//! - [`room`] — Sharded room registry and membership
//! - [`registry`] — Global client registry
//! - [`cleaner`] — Exactly-once teardown
//! - [`heartbeat`] — Ping/pong liveness
//! - [`ingress`] — Client frames → broker
//! - [`broadcast`] — Broker → room fan-out
//! - [`broker`] — Producer/consumer seam with memory and Redis backends
//! - [`config`] — TOML configuration
//! - [`server`] — Accept loop, connect contract, statistics

pub mod broadcast;
pub mod broker;
pub mod cleaner;
pub mod client;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod ingress;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;

// Re-exports for convenience
pub use broadcast::BroadcastPipeline;
pub use broker::{BrokerError, BrokerKind, Consumer, Delivery, DeliveryTag, Producer};
pub use cleaner::{Cleaner, CleanupGuard};
pub use client::{Client, ClientId};
pub use config::{ConfigError, GatewayConfig};
pub use error::{GatewayError, Result};
pub use heartbeat::{HeartbeatMonitor, HeartbeatState};
pub use ingress::{ExitReason, IngressPipeline};
pub use protocol::{Envelope, ProtocolError, Rejection, RoomId, WireFormat};
pub use registry::ClientRegistry;
pub use room::{Room, RoomRegistry};
pub use server::{Gateway, GatewayStats, StatsSnapshot};
