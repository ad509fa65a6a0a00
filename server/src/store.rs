//! Shared registry of connected clients and their last reported state
//!
//! This module owns the only piece of state that several connection workers
//! mutate concurrently:
//! - Identity issuing for new connections
//! - Field-by-field merging of partial state updates
//! - Point-in-time snapshots for broadcasting
//!
//! Each entry pairs a client's state with the outbox of its connection, so a
//! client is visible in snapshots exactly while it can receive them. All access
//! goes through one mutex that is held only for map operations, never across
//! an await point or any socket I/O.

use crate::connection::Outbox;
use log::info;
use shared::{ClientId, ClientState, StateSnapshot, StateUpdate};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A registered client: its state plus the outbox feeding its socket
#[derive(Debug)]
struct Entry {
    state: ClientState,
    outbox: Outbox,
}

#[derive(Debug)]
struct Registry {
    /// Next identity to hand out; never reused within the process
    next_id: u64,
    clients: HashMap<ClientId, Entry>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            next_id: 1,
            clients: HashMap::new(),
        }
    }
}

/// Everything one broadcast round needs, copied out under a single lock
#[derive(Debug)]
pub struct BroadcastRound {
    pub snapshot: StateSnapshot,
    pub recipients: Vec<(ClientId, Outbox)>,
}

/// Cloneable handle to the shared client registry
///
/// Clones share the same underlying map. Callers never see the map itself,
/// only copies of the states in it.
#[derive(Debug, Clone, Default)]
pub struct StateStore {
    inner: Arc<Mutex<Registry>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map operations cannot leave the registry half-updated, so a panic in
    /// another holder does not invalidate it.
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issues a fresh identity with the default state and attaches the
    /// connection's outbox to it.
    pub fn register(&self, outbox: Outbox) -> ClientId {
        let mut registry = self.lock();

        let id = ClientId::new(registry.next_id);
        registry.next_id += 1;

        registry.clients.insert(
            id,
            Entry {
                state: ClientState::default(),
                outbox,
            },
        );

        info!(
            "Client {} registered. Total clients: {}",
            id,
            registry.clients.len()
        );
        id
    }

    /// Registers and returns a guard that unregisters when dropped.
    pub fn register_guarded(&self, outbox: Outbox) -> Registration {
        let id = self.register(outbox);
        Registration {
            id,
            store: self.clone(),
        }
    }

    /// Merges `update` into the client's state.
    ///
    /// Returns false, changing nothing, if the client already left.
    pub fn update(&self, id: ClientId, update: &StateUpdate) -> bool {
        match self.lock().clients.get_mut(&id) {
            Some(entry) => {
                entry.state.apply(update);
                true
            }
            None => false,
        }
    }

    /// Removes the client. Returns false if it was already gone.
    pub fn unregister(&self, id: ClientId) -> bool {
        let mut registry = self.lock();
        let removed = registry.clients.remove(&id).is_some();

        if removed {
            info!(
                "Client {} unregistered. Total clients: {}",
                id,
                registry.clients.len()
            );
        }
        removed
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.lock()
            .clients
            .iter()
            .map(|(id, entry)| (*id, entry.state))
            .collect()
    }

    /// Merges `update`, then copies the resulting snapshot and the outboxes
    /// of every registered client, all in one critical section.
    ///
    /// Returns None if `id` is no longer registered.
    pub fn update_and_snapshot(&self, id: ClientId, update: &StateUpdate) -> Option<BroadcastRound> {
        let mut registry = self.lock();

        registry.clients.get_mut(&id)?.state.apply(update);

        let snapshot = registry
            .clients
            .iter()
            .map(|(id, entry)| (*id, entry.state))
            .collect();
        let recipients = registry
            .clients
            .iter()
            .map(|(id, entry)| (*id, entry.outbox.clone()))
            .collect();

        Some(BroadcastRound {
            snapshot,
            recipients,
        })
    }

    pub fn get(&self, id: ClientId) -> Option<ClientState> {
        self.lock().clients.get(&id).map(|entry| entry.state)
    }

    pub fn len(&self) -> usize {
        self.lock().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().clients.is_empty()
    }
}

/// Scoped registration of one connection
///
/// Dropping it unregisters the client, whichever way the connection ended.
#[derive(Debug)]
pub struct Registration {
    id: ClientId,
    store: StateStore,
}

impl Registration {
    pub fn id(&self) -> ClientId {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.store.unregister(self.id);
    }
}
