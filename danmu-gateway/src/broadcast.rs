//! Broker → room fan-out.
//!
//! ```text
//!  Consumer ──recv──► decode ──► room lookup ──► snapshot members
//!     ▲                                              │
//!     └──────────── ack ◄── join_all(send to each) ◄─┘
//!                               │ failed write
//!                               ▼
//!                            Cleaner
//! ```
//!
//! Deliveries are processed strictly one after another, so every client in a
//! room sees the room's comments in consumption order. Within one delivery
//! the writes to the room's members run concurrently, each bounded by the
//! client's write deadline; a stalled peer delays the batch by at most that
//! deadline and is then evicted.
//!
//! A delivery is acknowledged once it has been dispatched, including when
//! it was skipped because it could not be decoded or named an unknown room.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::watch;

use crate::broker::{Consumer, Delivery};
use crate::cleaner::Cleaner;
use crate::protocol::WireFormat;
use crate::room::RoomRegistry;
use crate::server::GatewayStats;

pub struct BroadcastPipeline<C> {
    consumer: C,
    rooms: Arc<RoomRegistry>,
    cleaner: Cleaner,
    format: WireFormat,
    stats: Arc<GatewayStats>,
}

impl<C: Consumer> BroadcastPipeline<C> {
    pub fn new(
        consumer: C,
        rooms: Arc<RoomRegistry>,
        cleaner: Cleaner,
        format: WireFormat,
        stats: Arc<GatewayStats>,
    ) -> Self {
        Self {
            consumer,
            rooms,
            cleaner,
            format,
            stats,
        }
    }

    /// Consume until the broker stream ends or `shutdown` flips to `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        log::info!("Broadcast pipeline started ({:?})", self.format);
        loop {
            let next = tokio::select! {
                biased;
                Ok(_) = shutdown.wait_for(|stop| *stop) => break,
                next = self.consumer.recv() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.dispatch(&delivery).await;
                    if let Err(e) = self.consumer.ack(&delivery).await {
                        log::error!("Ack of {:?} failed: {e}", delivery.tag);
                    }
                }
                Some(Err(e)) => log::error!("Broker receive failed: {e}"),
                None => {
                    log::warn!("Broker stream ended");
                    break;
                }
            }
        }
        log::info!("Broadcast pipeline stopped");
    }

    /// Deliver one record to its room. Returns the number of clients that
    /// accepted the frame.
    pub async fn dispatch(&self, delivery: &Delivery) -> usize {
        let envelope = match self.format.decode(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Skipping undecodable record {:?}: {e}", delivery.tag);
                self.stats.record_dropped();
                return 0;
            }
        };

        let room = match self.rooms.get(envelope.room_id) {
            Ok(room) => room,
            Err(e) => {
                log::warn!("Skipping record {:?}: {e}", delivery.tag);
                self.stats.record_dropped();
                return 0;
            }
        };

        let frame = match self.format.frame(delivery.payload.clone()) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Skipping record {:?}: {e}", delivery.tag);
                self.stats.record_dropped();
                return 0;
            }
        };

        let members = self.rooms.snapshot(&room);
        let sends = members.iter().map(|client| {
            let frame = frame.clone();
            async move { (client, client.send(frame).await) }
        });

        let mut delivered = 0;
        for (client, result) in join_all(sends).await {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::warn!("Write to client {} failed: {e}", client.id());
                    self.stats.record_write_failure();
                    self.cleaner.spawn_clean(client.clone());
                }
            }
        }

        log::trace!(
            "Record {:?} delivered to {delivered}/{} clients in room {}",
            delivery.tag,
            members.len(),
            room.id()
        );
        self.stats.record_broadcast(delivered);
        delivered
    }
}
