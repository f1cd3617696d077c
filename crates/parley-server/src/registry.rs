//! Connection registry: every live socket keyed by id.
//!
//! The registry is the single owner of [`Connection`] handles. Removing a
//! connection notifies the installed [`RegistryListener`] (the session
//! directory) so session membership never outlives the socket.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use parley_core::{ConnectionId, Outbound};
use tracing::debug;

use crate::connection::Connection;
use crate::metrics::{CONNECTIONS_ACTIVE, CONNECTIONS_CLOSED_TOTAL};

/// Hook run after a connection leaves the registry.
pub trait RegistryListener: Send + Sync {
    /// Called once per removed connection, outside the registry lock.
    fn on_unregister(&self, connection: &Connection);
}

/// Live connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    listener: RwLock<Option<Arc<dyn RegistryListener>>>,
}

impl ConnectionRegistry {
    /// Empty registry without a listener.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty registry notifying `listener` on removal.
    pub fn with_listener(listener: Arc<dyn RegistryListener>) -> Self {
        let registry = Self::new();
        registry.set_listener(listener);
        registry
    }

    /// Install or replace the removal hook.
    pub fn set_listener(&self, listener: Arc<dyn RegistryListener>) {
        *self.listener.write() = Some(listener);
    }

    /// Add a connection.
    pub fn register(&self, connection: Arc<Connection>) {
        let id = connection.id().clone();
        let replaced = self.connections.write().insert(id.clone(), connection);
        if replaced.is_none() {
            metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
        }
        debug!(connection_id = %id, "connection registered");
    }

    /// Remove a connection and run the removal hook.
    ///
    /// Idempotent: a second call for the same id returns `None` and does
    /// nothing.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.write().remove(id)?;
        metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
        metrics::counter!(CONNECTIONS_CLOSED_TOTAL).increment(1);

        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.on_unregister(&removed);
        }
        debug!(connection_id = %id, "connection unregistered");
        Some(removed)
    }

    /// Look up a connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(id).cloned()
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.read().contains_key(id)
    }

    /// Visit every connection under the read lock.
    ///
    /// `f` must not call back into the registry's mutating methods; use
    /// [`snapshot`](Self::snapshot) for that.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Connection>),
    {
        for connection in self.connections.read().values() {
            f(connection);
        }
    }

    /// Clone of every connection handle.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    /// Send an envelope to one connection. `false` if absent or unreachable.
    pub fn send_to(&self, id: &ConnectionId, message: &Outbound) -> bool {
        self.get(id).is_some_and(|c| c.send(message))
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}
