//! Exactly-once client teardown.
//!
//! Three independent detectors may decide a client is gone: the ingress
//! read loop, a failed broadcast write and the heartbeat. All of them call
//! [`Cleaner::clean_client`]; the first caller wins the client's atomic
//! terminal transition and performs teardown, the rest return immediately.
//!
//! Teardown order: room membership → client registry → transport close.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::client::Client;
use crate::registry::ClientRegistry;
use crate::room::RoomRegistry;

#[derive(Clone)]
pub struct Cleaner {
    rooms: Arc<RoomRegistry>,
    clients: Arc<ClientRegistry>,
}

impl Cleaner {
    pub fn new(rooms: Arc<RoomRegistry>, clients: Arc<ClientRegistry>) -> Self {
        Self { rooms, clients }
    }

    /// Tear a client down. Returns `true` only for the call that did the work.
    pub async fn clean_client(&self, client: &Arc<Client>) -> bool {
        if !client.try_mark_cleaned() {
            return false;
        }

        // A retired room no longer resolves; its membership dies with it.
        if let Ok(room) = self.rooms.get(client.room_id()) {
            self.rooms.remove_member(&room, client);
        }
        self.clients.remove(client);
        client.close().await;

        log::info!(
            "Client {} ({:?}) left room {}",
            client.id(),
            client.addr(),
            client.room_id()
        );
        true
    }

    /// Run [`clean_client`](Self::clean_client) on its own task so the
    /// caller never waits on a teardown.
    pub fn spawn_clean(&self, client: Arc<Client>) -> JoinHandle<bool> {
        let cleaner = self.clone();
        tokio::spawn(async move { cleaner.clean_client(&client).await })
    }
}

/// Scoped cleanup for a task that owns a client's lifetime.
///
/// Call [`finish`](Self::finish) on the normal exit path. If the owning task
/// is aborted or panics first, dropping the guard schedules the cleanup.
pub struct CleanupGuard {
    cleaner: Cleaner,
    client: Option<Arc<Client>>,
}

impl CleanupGuard {
    pub fn new(cleaner: Cleaner, client: Arc<Client>) -> Self {
        Self {
            cleaner,
            client: Some(client),
        }
    }

    pub async fn finish(mut self) -> bool {
        match self.client.take() {
            Some(client) => self.cleaner.clean_client(&client).await,
            None => false,
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let cleaner = self.cleaner.clone();
                handle.spawn(async move {
                    cleaner.clean_client(&client).await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::client::test_support::{client, SinkMode};

    fn setup() -> (Cleaner, Arc<RoomRegistry>, Arc<ClientRegistry>) {
        let rooms = Arc::new(RoomRegistry::with_rooms(4, [7, 8]));
        let clients = Arc::new(ClientRegistry::new());
        (Cleaner::new(rooms.clone(), clients.clone()), rooms, clients)
    }

    fn register(rooms: &RoomRegistry, clients: &ClientRegistry, c: &Arc<Client>) {
        let room = rooms.get(c.room_id()).unwrap();
        rooms.add_member(&room, c);
        clients.add(c.clone());
    }

    #[tokio::test]
    async fn test_clean_removes_everywhere() {
        let (cleaner, rooms, clients) = setup();
        let (c, sink) = client(7, SinkMode::Accept);
        register(&rooms, &clients, &c);

        assert!(cleaner.clean_client(&c).await);

        let room = rooms.get(7).unwrap();
        assert!(rooms.snapshot(&room).is_empty());
        assert!(!clients.contains(c.id()));
        assert!(c.is_closed());
        assert_eq!(sink.close_count(), 1);
    }

    #[tokio::test]
    async fn test_second_clean_is_noop() {
        let (cleaner, rooms, clients) = setup();
        let (c, sink) = client(7, SinkMode::Accept);
        register(&rooms, &clients, &c);

        assert!(cleaner.clean_client(&c).await);
        assert!(!cleaner.clean_client(&c).await);
        assert_eq!(sink.close_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_clean_exactly_once() {
        let (cleaner, rooms, clients) = setup();
        let (c, sink) = client(7, SinkMode::Accept);
        let (other, _) = client(7, SinkMode::Accept);
        register(&rooms, &clients, &c);
        register(&rooms, &clients, &other);

        let mut handles = Vec::new();
        for _ in 0..16 {
            handles.push(cleaner.spawn_clean(c.clone()));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(sink.close_count(), 1);
        assert!(!clients.contains(c.id()));
        let members = rooms.snapshot(&rooms.get(7).unwrap());
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id(), other.id());
    }

    #[tokio::test]
    async fn test_clean_after_room_retired() {
        let (cleaner, rooms, clients) = setup();
        let (c, sink) = client(8, SinkMode::Accept);
        register(&rooms, &clients, &c);
        rooms.retire(8);

        assert!(cleaner.clean_client(&c).await);
        assert!(clients.is_empty());
        assert_eq!(sink.close_count(), 1);
    }

    #[tokio::test]
    async fn test_clean_with_stalled_transport_is_bounded() {
        let (cleaner, rooms, clients) = setup();
        let (c, _) = client(7, SinkMode::Stall);
        register(&rooms, &clients, &c);

        let done = tokio::time::timeout(Duration::from_secs(2), cleaner.clean_client(&c)).await;
        assert_eq!(done.ok(), Some(true));
        assert!(clients.is_empty());
    }

    #[tokio::test]
    async fn test_guard_finish() {
        let (cleaner, rooms, clients) = setup();
        let (c, _) = client(7, SinkMode::Accept);
        register(&rooms, &clients, &c);

        let guard = CleanupGuard::new(cleaner, c.clone());
        assert!(guard.finish().await);
        assert!(c.is_cleaned());
    }

    #[tokio::test]
    async fn test_guard_cleans_on_abort() {
        let (cleaner, rooms, clients) = setup();
        let (c, _) = client(7, SinkMode::Accept);
        register(&rooms, &clients, &c);

        let task = {
            let guard = CleanupGuard::new(cleaner, c.clone());
            tokio::spawn(async move {
                let _guard = guard;
                std::future::pending::<()>().await;
            })
        };
        tokio::task::yield_now().await;
        task.abort();
        let _ = task.await;

        tokio::time::timeout(Duration::from_secs(1), c.closed())
            .await
            .unwrap();
        assert!(clients.is_empty());
    }
}
