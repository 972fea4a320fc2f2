//! The live-connection registry a server keeps over its connections.
//!
//! The registry is shared between the accept loop and every connection
//! worker. It supports O(1) insert and remove by handle, exposes the live
//! count, and carries each connection's lifecycle word so shutdown and
//! diagnostics can observe where a connection stands.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

/// Lifecycle of one connection.
///
/// `Active` from registration until teardown begins, `Stopping` while the
/// worker unwinds, `Inactive` once cleanup completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    Inactive,
    Active,
    Stopping,
}

/// Atomically updated `ConnState` shared between a registry entry and the
/// connection's worker.
#[derive(Debug)]
pub(crate) struct StateWord(AtomicI8);

const STATE_INACTIVE: i8 = 0;
const STATE_ACTIVE: i8 = 1;
const STATE_STOPPING: i8 = -1;

impl StateWord {
    fn active() -> StateWord {
        StateWord(AtomicI8::new(STATE_ACTIVE))
    }

    pub(crate) fn set(&self, state: ConnState) {
        let raw = match state {
            ConnState::Inactive => STATE_INACTIVE,
            ConnState::Active => STATE_ACTIVE,
            ConnState::Stopping => STATE_STOPPING,
        };
        self.0.store(raw, Ordering::Release);
    }

    pub(crate) fn get(&self) -> ConnState {
        match self.0.load(Ordering::Acquire) {
            STATE_ACTIVE => ConnState::Active,
            STATE_STOPPING => ConnState::Stopping,
            _ => ConnState::Inactive,
        }
    }
}

struct Entry {
    peer_addr: SocketAddr,
    state: Arc<StateWord>,
}

/// The set of live connections owned by one server.
///
/// The count and the map always agree: both are updated under the same
/// lock, and the lock is held only for the insert or remove itself.
pub(crate) struct Registry {
    connections: Mutex<HashMap<u64, Entry>>,
    next_id: AtomicU64,
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Inserts a new connection and returns its registration handle. The
    /// entry starts `Active`; dropping the handle removes it.
    pub(crate) fn register(self: Arc<Registry>, peer_addr: SocketAddr) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(StateWord::active());

        {
            let mut connections = self.connections.lock().unwrap();
            connections.insert(
                id,
                Entry {
                    peer_addr,
                    state: Arc::clone(&state),
                },
            );
        }

        Registration {
            registry: self,
            id,
            state,
        }
    }

    /// Number of live connections.
    pub(crate) fn len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    fn deregister(&self, id: u64) {
        let removed = self.connections.lock().unwrap().remove(&id);
        if let Some(entry) = removed {
            debug!(id, peer = %entry.peer_addr, state = ?entry.state.get(), "connection deregistered");
        }
    }
}

/// Handle to one registry entry, owned by the connection's worker.
///
/// Marks the entry `Stopping` when teardown begins and removes it (the
/// count going with it) on drop, so an entry can never outlive its worker.
pub(crate) struct Registration {
    registry: Arc<Registry>,
    id: u64,
    state: Arc<StateWord>,
}

impl Registration {
    pub(crate) fn set_stopping(&self) {
        self.state.set(ConnState::Stopping);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.state.set(ConnState::Inactive);
        self.registry.deregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn count_follows_registration() {
        let registry = Arc::new(Registry::new());
        assert_eq!(registry.len(), 0);

        let a = Arc::clone(&registry).register(addr());
        let b = Arc::clone(&registry).register(addr());
        assert_eq!(registry.len(), 2);

        drop(a);
        assert_eq!(registry.len(), 1);
        drop(b);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn state_word_transitions() {
        let registry = Arc::new(Registry::new());
        let registration = Arc::clone(&registry).register(addr());
        assert_eq!(registration.state.get(), ConnState::Active);

        registration.set_stopping();
        assert_eq!(registration.state.get(), ConnState::Stopping);

        let state = Arc::clone(&registration.state);
        drop(registration);
        assert_eq!(state.get(), ConnState::Inactive);
    }
}
