//! Ping/pong liveness check.
//!
//! ```text
//!   ┌───────┐  ping failed / no pong for > timeout  ┌──────┐
//!   │ ALIVE │ ─────────────────────────────────────► │ DEAD │ ──► Cleaner
//!   └───────┘                                        └──────┘
//!     │  ▲
//!     └──┘ ping every timeout/2, pong seen recently
//! ```
//!
//! The pong side lives in the ingress loop: every pong frame read from the
//! peer refreshes [`Client::last_pong_at`]. Between pings the monitor wakes
//! early at `last_pong_at + timeout`, so a dead peer is detected as soon as
//! it has been silent for `timeout`, never before.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::cleaner::Cleaner;
use crate::client::Client;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Alive,
    Dead,
}

pub struct HeartbeatMonitor {
    client: Arc<Client>,
    cleaner: Cleaner,
    timeout: Duration,
    state: HeartbeatState,
}

impl HeartbeatMonitor {
    /// Build a monitor, or `None` when heartbeats are disabled (zero timeout).
    pub fn new(client: Arc<Client>, cleaner: Cleaner, timeout: Duration) -> Option<Self> {
        if timeout.is_zero() {
            return None;
        }
        Some(Self {
            client,
            cleaner,
            timeout,
            state: HeartbeatState::Alive,
        })
    }

    pub fn state(&self) -> HeartbeatState {
        self.state
    }

    /// Ping until the peer is declared dead or the client is closed
    /// elsewhere. Returns the final state.
    pub async fn run(mut self) -> HeartbeatState {
        let interval = self.timeout / 2;
        self.client.record_pong();

        loop {
            if self.client.is_cleaned() {
                return self.state;
            }
            if let Err(e) = self.client.send_ping().await {
                if self.client.is_cleaned() {
                    return self.state;
                }
                log::warn!("Ping to client {} failed: {e}", self.client.id());
                return self.die().await;
            }

            let next_ping = Instant::now() + interval;
            loop {
                let deadline = self.client.last_pong_at() + self.timeout;
                tokio::select! {
                    _ = tokio::time::sleep_until(next_ping.min(deadline)) => {}
                    _ = self.client.closed() => return self.state,
                }

                let silent_for = self.client.last_pong_at().elapsed();
                if silent_for >= self.timeout {
                    log::info!(
                        "Ping pong timeout for client {} ({silent_for:?} without pong)",
                        self.client.id()
                    );
                    return self.die().await;
                }
                if Instant::now() >= next_ping {
                    break;
                }
            }
        }
    }

    async fn die(&mut self) -> HeartbeatState {
        self.state = HeartbeatState::Dead;
        self.cleaner.clean_client(&self.client).await;
        self.state
    }
}

#[cfg(test)]
mod tests {
    use tokio_tungstenite::tungstenite::Message;

    use super::*;
    use crate::client::test_support::{client, SinkMode};
    use crate::registry::ClientRegistry;
    use crate::room::RoomRegistry;

    fn registered(mode: SinkMode) -> (Arc<Client>, Cleaner, Arc<ClientRegistry>) {
        let rooms = Arc::new(RoomRegistry::with_rooms(1, [5]));
        let clients = Arc::new(ClientRegistry::new());
        let (c, _) = client(5, mode);
        rooms.add_member(&rooms.get(5).unwrap(), &c);
        clients.add(c.clone());
        (c, Cleaner::new(rooms, clients.clone()), clients)
    }

    #[test]
    fn test_zero_timeout_disables() {
        let (c, cleaner, _) = registered(SinkMode::Accept);
        assert!(HeartbeatMonitor::new(c, cleaner, Duration::ZERO).is_none());
    }

    #[test]
    fn test_starts_alive() {
        let (c, cleaner, _) = registered(SinkMode::Accept);
        let monitor = HeartbeatMonitor::new(c, cleaner, Duration::from_secs(1)).unwrap();
        assert_eq!(monitor.state(), HeartbeatState::Alive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_cleaned_within_window() {
        let (c, cleaner, clients) = registered(SinkMode::Accept);
        let timeout = Duration::from_secs(10);
        let monitor = HeartbeatMonitor::new(c.clone(), cleaner, timeout).unwrap();

        let started = Instant::now();
        let state = monitor.run().await;
        let elapsed = started.elapsed();

        assert_eq!(state, HeartbeatState::Dead);
        assert!(elapsed >= timeout, "cleaned too early: {elapsed:?}");
        assert!(elapsed < timeout + timeout / 10, "cleaned too late: {elapsed:?}");
        assert!(c.is_cleaned());
        assert!(clients.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_responsive_peer_stays_alive() {
        let (c, cleaner, clients) = registered(SinkMode::Accept);
        let monitor =
            HeartbeatMonitor::new(c.clone(), cleaner.clone(), Duration::from_secs(10)).unwrap();
        let handle = tokio::spawn(monitor.run());

        let ponger = {
            let c = c.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    c.record_pong();
                }
            })
        };

        tokio::time::sleep(Duration::from_secs(121)).await;
        assert!(!c.is_cleaned());
        assert_eq!(clients.len(), 1);

        ponger.abort();
        cleaner.clean_client(&c).await;
        assert_eq!(handle.await.unwrap(), HeartbeatState::Alive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_that_stops_answering() {
        let (c, cleaner, _) = registered(SinkMode::Accept);
        let timeout = Duration::from_secs(10);
        let handle = tokio::spawn(HeartbeatMonitor::new(c.clone(), cleaner, timeout).unwrap().run());

        // Answer for 30s, then go silent.
        for _ in 0..15 {
            tokio::time::sleep(Duration::from_secs(2)).await;
            c.record_pong();
        }
        let went_silent = Instant::now();

        assert_eq!(handle.await.unwrap(), HeartbeatState::Dead);
        let elapsed = went_silent.elapsed();
        assert!(elapsed >= timeout, "cleaned too early: {elapsed:?}");
        assert!(elapsed < timeout + timeout / 10, "cleaned too late: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_detection_not_delayed_to_next_ping() {
        let (c, cleaner, _) = registered(SinkMode::Accept);
        let timeout = Duration::from_secs(10);
        let handle = tokio::spawn(HeartbeatMonitor::new(c.clone(), cleaner, timeout).unwrap().run());

        // Last pong just after a ping, so the deadline falls mid-interval.
        tokio::time::sleep(Duration::from_secs(1)).await;
        c.record_pong();
        let last_pong = Instant::now();

        assert_eq!(handle.await.unwrap(), HeartbeatState::Dead);
        // The next ping would only come at t=15.
        let elapsed = last_pong.elapsed();
        assert!(elapsed >= timeout, "cleaned too early: {elapsed:?}");
        assert!(elapsed < timeout + Duration::from_secs(1), "cleaned too late: {elapsed:?}");
    }

    #[tokio::test]
    async fn test_ping_failure_is_fatal() {
        let (c, cleaner, clients) = registered(SinkMode::Fail);
        let monitor = HeartbeatMonitor::new(c.clone(), cleaner, Duration::from_secs(30)).unwrap();
        let state = tokio::time::timeout(Duration::from_secs(1), monitor.run())
            .await
            .unwrap();
        assert_eq!(state, HeartbeatState::Dead);
        assert!(clients.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_keepalive_pings() {
        let rooms = Arc::new(RoomRegistry::with_rooms(1, [5]));
        let clients = Arc::new(ClientRegistry::new());
        let (c, sink) = client(5, SinkMode::Accept);
        clients.add(c.clone());
        let cleaner = Cleaner::new(rooms, clients);

        let monitor = HeartbeatMonitor::new(c.clone(), cleaner, Duration::from_secs(4)).unwrap();
        monitor.run().await;

        let pings = sink
            .frames()
            .into_iter()
            .filter(|m| matches!(m, Message::Ping(p) if p.as_ref() == b"keepalive"))
            .count();
        // Pings at t=0 and t=2; declared dead at t=4 before a third ping.
        assert_eq!(pings, 2);
    }
}
