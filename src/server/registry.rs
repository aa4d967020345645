//! Connection registry.
//!
//! The only structure the server mutates from several flows at once: the
//! accept path adds, the failure path removes, broadcast snapshots. One
//! mutex guards exactly those three operations and is never held across
//! I/O.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use crate::transport::{Connection, ConnectionId};

/// One registered connection.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// The connection handle.
    pub connection: Connection,
    /// When the connection reached `ready` and was registered.
    pub arrived_at: Instant,
}

impl RegistryEntry {
    /// Connection identifier.
    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }
}

/// Concurrency-safe set of active server-side connections, keyed by id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: Mutex<BTreeMap<ConnectionId, RegistryEntry>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ConnectionId, RegistryEntry>> {
        // A panicking holder cannot leave the map half-updated.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a connection. Returns `false` if its id is already present.
    pub fn add(&self, connection: Connection) -> bool {
        let mut entries = self.lock();
        let id = connection.id();
        if entries.contains_key(&id) {
            return false;
        }
        entries.insert(
            id,
            RegistryEntry {
                connection,
                arrived_at: Instant::now(),
            },
        );
        true
    }

    /// Remove a connection, returning its entry if it was registered.
    pub fn remove(&self, id: ConnectionId) -> Option<RegistryEntry> {
        self.lock().remove(&id)
    }

    /// Check whether `id` is registered.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Point-in-time copy of every entry, ordered by id.
    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        self.lock().values().cloned().collect()
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<RegistryEntry> {
        std::mem::take(&mut *self.lock()).into_values().collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
