use crate::{identifier::ConnectionId, transport::StreamConnectionRef};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::{debug, info};

pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Whether the pool may dial new connections on send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionMode {
    #[default]
    Automatic,
    /// Only connections that already exist are used; a send without one
    /// fails instead of dialing.
    Manual,
}

struct PoolState {
    connections: HashMap<ConnectionId, StreamConnectionRef>,
    max_connections: usize,
    mode: ConnectionMode,
}

/// Live connections of one connection-oriented transport, keyed by
/// [`ConnectionId`].
///
/// The pool never does I/O under its lock: connections displaced by
/// [`ConnectionPool::insert`] or [`ConnectionPool::set_max_connections`] are
/// handed back for the caller to close.
pub struct ConnectionPool {
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub fn new(max_connections: usize, mode: ConnectionMode) -> Self {
        Self {
            state: Mutex::new(PoolState {
                connections: HashMap::new(),
                max_connections: max_connections.max(1),
                mode,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<StreamConnectionRef> {
        self.state().connections.get(id).cloned()
    }

    /// Adds a connection. An existing connection under the same id is
    /// replaced (last writer wins); when the pool is full the connections
    /// with the oldest activity are evicted. Both are returned.
    pub fn insert(&self, connection: StreamConnectionRef) -> Vec<StreamConnectionRef> {
        let mut state = self.state();
        let mut displaced = Vec::new();
        let id = connection.id().clone();

        if let Some(existing) = state.connections.remove(&id) {
            if !same_connection(&existing, &connection) {
                info!(%id, "replacing pooled connection");
                displaced.push(existing);
            }
        }
        while state.connections.len() >= state.max_connections {
            match evict_oldest(&mut state.connections) {
                Some(evicted) => displaced.push(evicted),
                None => break,
            }
        }
        state.connections.insert(id, connection);
        displaced
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<StreamConnectionRef> {
        self.state().connections.remove(id)
    }

    /// Removes `connection` only if it is still the one pooled under its id,
    /// so a closing connection never takes out its replacement.
    pub fn remove_if_same(&self, connection: &StreamConnectionRef) -> bool {
        let mut state = self.state();
        let id = connection.id();
        match state.connections.get(id) {
            Some(current) if same_connection(current, connection) => {
                state.connections.remove(id);
                true
            }
            _ => false,
        }
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.state().connections.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn drain(&self) -> Vec<StreamConnectionRef> {
        self.state().connections.drain().map(|(_, c)| c).collect()
    }

    pub fn mode(&self) -> ConnectionMode {
        self.state().mode
    }

    pub fn set_mode(&self, mode: ConnectionMode) {
        self.state().mode = mode;
    }

    pub fn max_connections(&self) -> usize {
        self.state().max_connections
    }

    /// Clamped to at least one. Lowering the bound evicts down to it at once.
    pub fn set_max_connections(&self, max_connections: usize) -> Vec<StreamConnectionRef> {
        let mut state = self.state();
        state.max_connections = max_connections.max(1);
        let mut evicted = Vec::new();
        while state.connections.len() > state.max_connections {
            match evict_oldest(&mut state.connections) {
                Some(connection) => evicted.push(connection),
                None => break,
            }
        }
        evicted
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONNECTIONS, ConnectionMode::default())
    }
}

fn same_connection(a: &StreamConnectionRef, b: &StreamConnectionRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn evict_oldest(
    connections: &mut HashMap<ConnectionId, StreamConnectionRef>,
) -> Option<StreamConnectionRef> {
    let oldest = connections
        .iter()
        .min_by_key(|(_, c)| c.last_activity())
        .map(|(id, _)| id.clone())?;
    debug!(id = %oldest, "evicting least recently active connection");
    connections.remove(&oldest)
}
