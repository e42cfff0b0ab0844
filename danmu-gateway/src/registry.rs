//! Global table of live clients.
//!
//! The registry is a plain idempotent set. It does not decide who tears a
//! client down; that is gated by the client's own terminal flag (see
//! [`crate::cleaner`]), so racing removals are harmless here.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::client::{Client, ClientId};

#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, Arc<Client>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client. Returns `false` if it was already present.
    pub fn add(&self, client: Arc<Client>) -> bool {
        self.clients.write().insert(client.id(), client).is_none()
    }

    /// Unregister a client. Removing an absent client is a no-op.
    pub fn remove(&self, client: &Client) -> bool {
        self.clients.write().remove(&client.id()).is_some()
    }

    pub fn get(&self, id: ClientId) -> Option<Arc<Client>> {
        self.clients.read().get(&id).cloned()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Copy of every registered client.
    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.clients.read().values().cloned().collect()
    }
}
