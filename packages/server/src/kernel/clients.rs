//! Registry of connected client sessions.
//!
//! Kernel services use it to disconnect masters on re-pairing, enforce the
//! max-connections cap, purge connections stuck in authorization, and feed
//! the authorization registry's live-session view.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Authorization state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Authorization {
    Waiting = 0,
    Client = 1,
    Master = 2,
    Fail = 3,
}

impl Authorization {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Authorization::Client,
            2 => Authorization::Master,
            3 => Authorization::Fail,
            _ => Authorization::Waiting,
        }
    }
}

/// Shared handle of one connected session.
pub struct ClientHandle {
    pub id: u64,
    pub connected_at: DateTime<Utc>,
    name: Mutex<String>,
    authorization: AtomicU8,
    /// Cancelling this token disconnects the session.
    pub disconnect: CancellationToken,
}

impl ClientHandle {
    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock().unwrap() = name.into();
    }

    pub fn authorization(&self) -> Authorization {
        Authorization::from_u8(self.authorization.load(Ordering::SeqCst))
    }

    pub fn set_authorization(&self, authorization: Authorization) {
        self.authorization
            .store(authorization as u8, Ordering::SeqCst);
    }
}

/// How long an un-authorized connection may linger before being purged,
/// in seconds.
pub const AUTH_PURGE_AFTER_SECONDS: i64 = 60;

/// Lock-protected client list.
#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<Vec<Arc<ClientHandle>>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session.
    pub fn register(&self, name: impl Into<String>, now: DateTime<Utc>) -> Arc<ClientHandle> {
        let handle = Arc::new(ClientHandle {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            connected_at: now,
            name: Mutex::new(name.into()),
            authorization: AtomicU8::new(Authorization::Waiting as u8),
            disconnect: CancellationToken::new(),
        });
        self.clients.lock().unwrap().push(handle.clone());
        handle
    }

    pub fn unregister(&self, id: u64) {
        self.clients.lock().unwrap().retain(|c| c.id != id);
    }

    pub fn len(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of currently connected clients.
    pub fn live_names(&self) -> HashSet<String> {
        self.clients
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.name())
            .collect()
    }

    /// Disconnect every session authorized as master.
    pub fn disconnect_masters(&self) -> usize {
        let clients = self.clients.lock().unwrap();
        let mut count = 0;
        for client in clients.iter() {
            if client.authorization() == Authorization::Master {
                client.disconnect.cancel();
                count += 1;
            }
        }
        count
    }

    /// Disconnect sessions stuck in authorization past the purge timeout.
    /// Returns how many were disconnected.
    pub fn purge_unauthorized(&self, now: DateTime<Utc>) -> usize {
        let clients = self.clients.lock().unwrap();
        let mut count = 0;
        for client in clients.iter() {
            let stuck = matches!(
                client.authorization(),
                Authorization::Waiting | Authorization::Fail
            );
            if stuck && (now - client.connected_at).num_seconds() >= AUTH_PURGE_AFTER_SECONDS {
                client.disconnect.cancel();
                count += 1;
            }
        }
        count
    }

    /// Whether a new connection may be accepted under the cap. When full,
    /// a purge pass may free a slot first.
    pub fn has_capacity(&self, max_connections: u32) -> bool {
        self.len() < max_connections as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    #[test]
    fn test_register_unregister() {
        let registry = ClientRegistry::new();
        let handle = registry.register("c1", at(0));
        assert_eq!(registry.len(), 1);
        registry.unregister(handle.id);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_disconnect_masters_only() {
        let registry = ClientRegistry::new();
        let master = registry.register("m", at(0));
        master.set_authorization(Authorization::Master);
        let client = registry.register("c", at(0));
        client.set_authorization(Authorization::Client);

        assert_eq!(registry.disconnect_masters(), 1);
        assert!(master.disconnect.is_cancelled());
        assert!(!client.disconnect.is_cancelled());
    }

    #[test]
    fn test_purge_unauthorized_after_timeout() {
        let registry = ClientRegistry::new();
        let stale = registry.register("stale", at(0));
        let fresh = registry.register("fresh", at(55));
        let authorized = registry.register("ok", at(0));
        authorized.set_authorization(Authorization::Client);

        assert_eq!(registry.purge_unauthorized(at(60)), 1);
        assert!(stale.disconnect.is_cancelled());
        assert!(!fresh.disconnect.is_cancelled());
        assert!(!authorized.disconnect.is_cancelled());
    }

    #[test]
    fn test_capacity() {
        let registry = ClientRegistry::new();
        registry.register("a", at(0));
        registry.register("b", at(0));
        assert!(registry.has_capacity(3));
        assert!(!registry.has_capacity(2));
    }
}
