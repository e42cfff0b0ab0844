//! Rooms and the sharded room registry.
//!
//! Rooms are provisioned from outside the connection path (configuration or
//! an operator call); connecting to an unknown room is a lookup failure and
//! never creates one.
//!
//! ```text
//! RoomRegistry
//! ├── shard 0: RwLock<{room_id → Arc<Room>}>
//! ├── shard 1: RwLock<{room_id → Arc<Room>}>
//! └── …                 │
//!                       ▼
//!                 Room { members: Mutex<{client_id → Weak<Client>}> }
//! ```
//!
//! A room references its members weakly; the client registry keeps them
//! alive. Locks are held only to mutate or copy, never across I/O.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::client::{Client, ClientId};
use crate::error::{GatewayError, Result};
use crate::protocol::RoomId;

/// Default number of registry shards.
pub const DEFAULT_SHARDS: usize = 16;

/// A multicast group of clients.
pub struct Room {
    id: RoomId,
    members: Mutex<HashMap<ClientId, Weak<Client>>>,
}

impl Room {
    fn new(id: RoomId) -> Self {
        Self {
            id,
            members: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> RoomId {
        self.id
    }

    /// Number of membership entries, including not-yet-pruned dead ones.
    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("members", &self.len())
            .finish()
    }
}

/// Lookup table of provisioned rooms, partitioned by room id.
pub struct RoomRegistry {
    shards: Box<[RwLock<HashMap<RoomId, Arc<Room>>>]>,
}

impl RoomRegistry {
    /// Create a registry with `shard_count` shards (at least one).
    pub fn new(shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self { shards }
    }

    /// Create a registry and provision the given rooms.
    pub fn with_rooms(shard_count: usize, rooms: impl IntoIterator<Item = RoomId>) -> Self {
        let registry = Self::new(shard_count);
        for id in rooms {
            registry.provision(id);
        }
        registry
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_index(&self, id: RoomId) -> usize {
        // Fibonacci hashing spreads sequential ids across shards.
        let hash = (id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        (hash >> 32) as usize % self.shards.len()
    }

    fn shard(&self, id: RoomId) -> &RwLock<HashMap<RoomId, Arc<Room>>> {
        &self.shards[self.shard_index(id)]
    }

    // ─── Provisioning ─────────────────────────────────────────────────

    /// Make a room available. Idempotent: returns the existing room if any.
    pub fn provision(&self, id: RoomId) -> Arc<Room> {
        let mut shard = self.shard(id).write();
        shard
            .entry(id)
            .or_insert_with(|| {
                log::info!("Room {id} provisioned");
                Arc::new(Room::new(id))
            })
            .clone()
    }

    /// Withdraw a room from lookup. Current members are left connected.
    pub fn retire(&self, id: RoomId) -> Option<Arc<Room>> {
        let removed = self.shard(id).write().remove(&id);
        if removed.is_some() {
            log::info!("Room {id} retired");
        }
        removed
    }

    pub fn contains(&self, id: RoomId) -> bool {
        self.shard(id).read().contains_key(&id)
    }

    pub fn room_count(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn room_ids(&self) -> Vec<RoomId> {
        self.shards
            .iter()
            .flat_map(|s| s.read().keys().copied().collect::<Vec<_>>())
            .collect()
    }

    // ─── Lookup & membership ──────────────────────────────────────────

    /// Resolve a provisioned room.
    pub fn get(&self, id: RoomId) -> Result<Arc<Room>> {
        self.shard(id)
            .read()
            .get(&id)
            .cloned()
            .ok_or(GatewayError::RoomNotFound(id))
    }

    pub fn add_member(&self, room: &Room, client: &Arc<Client>) {
        debug_assert_eq!(room.id, client.room_id());
        room.members
            .lock()
            .insert(client.id(), Arc::downgrade(client));
    }

    /// Remove a member. Removing an absent member is a no-op.
    pub fn remove_member(&self, room: &Room, client: &Client) -> bool {
        room.members.lock().remove(&client.id()).is_some()
    }

    /// Point-in-time copy of the live members, safe to iterate while
    /// writing to them. Entries whose client has been dropped are pruned.
    pub fn snapshot(&self, room: &Room) -> Vec<Arc<Client>> {
        let mut members = room.members.lock();
        let mut live = Vec::with_capacity(members.len());
        members.retain(|_, weak| match weak.upgrade() {
            Some(client) => {
                live.push(client);
                true
            }
            None => false,
        });
        live
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::client::test_support::{client, SinkMode};

    #[test]
    fn test_get_unknown_room_fails() {
        let registry = RoomRegistry::default();
        assert!(matches!(registry.get(42), Err(GatewayError::RoomNotFound(42))));
        // Lookup must not create the room.
        assert!(!registry.contains(42));
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn test_provision_is_idempotent() {
        let registry = RoomRegistry::default();
        let a = registry.provision(42);
        let b = registry.provision(42);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.room_count(), 1);
        assert!(Arc::ptr_eq(&registry.get(42).unwrap(), &a));
    }

    #[test]
    fn test_retire_room() {
        let registry = RoomRegistry::with_rooms(4, [1, 2, 3]);
        assert!(registry.retire(2).is_some());
        assert!(registry.retire(2).is_none());
        assert!(registry.get(2).is_err());
        let mut ids = registry.room_ids();
        ids.sort();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_add_and_snapshot() {
        let registry = RoomRegistry::default();
        let room = registry.provision(42);
        let (c, _) = client(42, SinkMode::Accept);
        registry.add_member(&room, &c);

        let snapshot = registry.snapshot(&room);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), c.id());
    }

    #[test]
    fn test_remove_member_idempotent() {
        let registry = RoomRegistry::default();
        let room = registry.provision(7);
        let (c, _) = client(7, SinkMode::Accept);
        registry.add_member(&room, &c);

        assert!(registry.remove_member(&room, &c));
        assert!(!registry.remove_member(&room, &c));
        assert!(registry.snapshot(&room).is_empty());
    }

    #[test]
    fn test_add_member_twice_no_duplicate() {
        let registry = RoomRegistry::default();
        let room = registry.provision(7);
        let (c, _) = client(7, SinkMode::Accept);
        registry.add_member(&room, &c);
        registry.add_member(&room, &c);
        assert_eq!(registry.snapshot(&room).len(), 1);
    }

    #[test]
    fn test_snapshot_prunes_dropped_clients() {
        let registry = RoomRegistry::default();
        let room = registry.provision(7);
        let (kept, _) = client(7, SinkMode::Accept);
        {
            let (dropped, _) = client(7, SinkMode::Accept);
            registry.add_member(&room, &dropped);
        }
        registry.add_member(&room, &kept);
        assert_eq!(room.len(), 2);

        let snapshot = registry.snapshot(&room);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(room.len(), 1);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let registry = RoomRegistry::default();
        let room = registry.provision(7);
        let (a, _) = client(7, SinkMode::Accept);
        let (b, _) = client(7, SinkMode::Accept);
        registry.add_member(&room, &a);

        let snapshot = registry.snapshot(&room);
        registry.add_member(&room, &b);
        registry.remove_member(&room, &a);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), a.id());
    }

    #[test]
    fn test_rooms_are_isolated() {
        let registry = RoomRegistry::with_rooms(2, [7, 8]);
        let room7 = registry.get(7).unwrap();
        let room8 = registry.get(8).unwrap();
        let (c, _) = client(7, SinkMode::Accept);
        registry.add_member(&room7, &c);
        assert!(registry.snapshot(&room8).is_empty());
    }

    #[test]
    fn test_shard_index_in_range() {
        let registry = RoomRegistry::new(5);
        for id in [-1_000_000, -1, 0, 1, 42, i64::MAX, i64::MIN] {
            assert!(registry.shard_index(id) < 5);
        }
        assert_eq!(RoomRegistry::new(0).shard_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_membership_is_serializable() {
        let registry = Arc::new(RoomRegistry::default());
        let room = registry.provision(1);

        let clients: Vec<_> = (0..64).map(|_| client(1, SinkMode::Accept).0).collect();

        // Every client joins; odd-indexed clients then leave.
        let mut handles = Vec::new();
        for (i, c) in clients.iter().enumerate() {
            let registry = registry.clone();
            let room = room.clone();
            let c = c.clone();
            handles.push(tokio::spawn(async move {
                registry.add_member(&room, &c);
                tokio::task::yield_now().await;
                if i % 2 == 1 {
                    registry.remove_member(&room, &c);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let expected: HashSet<_> = clients
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 2 == 0)
            .map(|(_, c)| c.id())
            .collect();
        let actual: HashSet<_> = registry.snapshot(&room).iter().map(|c| c.id()).collect();
        assert_eq!(actual, expected);
    }
}
