use crate::connection::PeerConnection;
use crate::error::ConnectError;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use peerwire_common::DisconnectReason;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// A connection attempt that any number of callers can await.
pub type ConnectFuture = Shared<BoxFuture<'static, Result<PeerConnection, ConnectError>>>;

/// Concurrent identity -> connection table.
///
/// Holds at most one entry per identity. The table does not own connections;
/// each one lives as long as its I/O task.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, PeerConnection>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection under its identity.
    ///
    /// A different connection already stored for the same identity is
    /// replaced and, if still open, disconnected with
    /// [`DisconnectReason::AlreadyConnected`]. Returns the replaced entry.
    pub fn register(&self, conn: PeerConnection) -> Option<PeerConnection> {
        let identity = conn.identity().to_owned();
        let replaced = self
            .connections
            .insert(identity, conn.clone())
            .filter(|old| !old.ptr_eq(&conn));

        if let Some(old) = &replaced {
            debug!(peer = %old.identity(), "replacing existing connection");
            old.disconnect(DisconnectReason::AlreadyConnected);
        }
        replaced
    }

    /// Remove `conn` only if it is the entry currently stored for its
    /// identity.
    pub fn unregister(&self, conn: &PeerConnection) -> bool {
        self.connections
            .remove_if(conn.identity(), |_, stored| stored.ptr_eq(conn))
            .is_some()
    }

    /// Look up a connection by identity.
    #[must_use]
    pub fn get(&self, identity: &str) -> Option<PeerConnection> {
        self.connections.get(identity).map(|e| e.value().clone())
    }

    /// Point-in-time copy of every registered connection.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PeerConnection> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Disconnect every registered connection.
    ///
    /// Works on a snapshot, so connections that unregister themselves while
    /// this runs do not disturb the loop. Returns how many were asked to
    /// disconnect.
    pub fn disconnect_all(&self, reason: DisconnectReason) -> usize {
        let all = self.snapshot();
        for conn in &all {
            conn.disconnect(reason);
        }
        all.len()
    }
}

struct PendingEntry {
    future: ConnectFuture,
    expires_at: Instant,
}

/// Short-lived cache of outbound connection attempts keyed by endpoint.
///
/// Lookup and creation happen under one lock for the whole cache, so two
/// callers can never both create an attempt for the same endpoint. Entries
/// expire a fixed TTL after they were written and are never evicted before
/// that; a connection already produced by an expired entry is unaffected.
pub struct PendingConnects {
    ttl: Duration,
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingConnects {
    /// Create a cache whose entries live for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the live attempt for `endpoint`, or run `create` and cache its
    /// result. Expired entries are dropped first.
    ///
    /// The boolean is `true` when `create` ran.
    pub fn get_or_create<F>(&self, endpoint: &str, create: F) -> (ConnectFuture, bool)
    where
        F: FnOnce() -> ConnectFuture,
    {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        purge(&mut entries, now);

        if let Some(entry) = entries.get(endpoint) {
            return (entry.future.clone(), false);
        }

        let future = create();
        entries.insert(
            endpoint.to_owned(),
            PendingEntry {
                future: future.clone(),
                expires_at: now + self.ttl,
            },
        );
        (future, true)
    }

    /// Drop expired entries. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        purge(&mut self.entries.lock(), Instant::now())
    }

    /// Forget every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of cached entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn purge(entries: &mut HashMap<String, PendingEntry>, now: Instant) -> usize {
    let before = entries.len();
    entries.retain(|_, e| e.expires_at > now);
    before - entries.len()
}

impl std::fmt::Debug for PendingConnects {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingConnects")
            .field("ttl", &self.ttl)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::test_connection;
    use crate::connection::LifecycleState;
    use crate::events::DisconnectEvent;
    use crate::subscribers::{FailurePolicy, Subscribers};
    use futures_util::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn hooks() -> Arc<Subscribers<DisconnectEvent>> {
        Arc::new(Subscribers::new(FailurePolicy::Propagate))
    }

    fn ready_future(result: Result<PeerConnection, ConnectError>) -> ConnectFuture {
        futures_util::future::ready(result).boxed().shared()
    }

    #[test]
    fn test_register_and_get() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = test_connection("alpha", hooks());

        assert!(registry.register(conn.clone()).is_none());
        assert!(registry.get("alpha").unwrap().ptr_eq(&conn));
        assert!(registry.get("beta").is_none());
    }

    #[test]
    fn test_register_same_identity_replaces_and_disconnects_old() {
        let registry = ConnectionRegistry::new();
        let (old, mut old_rx) = test_connection("alpha", hooks());
        let (new, _rx) = test_connection("alpha", hooks());

        registry.register(old.clone());
        let replaced = registry.register(new.clone()).unwrap();

        assert!(replaced.ptr_eq(&old));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("alpha").unwrap().ptr_eq(&new));
        assert_eq!(old.state(), LifecycleState::Disconnecting);
        assert!(old_rx.try_recv().is_ok());
    }

    #[test]
    fn test_registering_same_connection_twice_is_not_a_replacement() {
        let registry = ConnectionRegistry::new();
        let (conn, _rx) = test_connection("alpha", hooks());

        registry.register(conn.clone());
        assert!(registry.register(conn.clone()).is_none());
        assert!(conn.is_open());
    }

    #[test]
    fn test_unregister_stale_connection_keeps_newer_entry() {
        let registry = ConnectionRegistry::new();
        let (old, _rx1) = test_connection("alpha", hooks());
        let (new, _rx2) = test_connection("alpha", hooks());

        registry.register(old.clone());
        registry.register(new.clone());

        assert!(!registry.unregister(&old));
        assert!(registry.get("alpha").unwrap().ptr_eq(&new));
        assert!(registry.unregister(&new));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_disconnect_all_reaches_every_connection() {
        let registry = ConnectionRegistry::new();
        let mut keep = Vec::new();
        for id in ["a", "b", "c"] {
            let (conn, rx) = test_connection(id, hooks());
            registry.register(conn.clone());
            keep.push((conn, rx));
        }
        // One of them is already gone; the loop must still reach the rest.
        keep[0].0.terminate(DisconnectReason::Unknown, true);

        assert_eq!(registry.disconnect_all(DisconnectReason::Unknown), 3);
        for (conn, _) in &keep[1..] {
            assert_eq!(conn.state(), LifecycleState::Disconnecting);
        }
    }

    #[test]
    fn test_pending_connect_reuses_live_entry() {
        let cache = PendingConnects::new(Duration::from_secs(30));
        let created = AtomicUsize::new(0);

        for _ in 0..5 {
            let _ = cache.get_or_create("10.0.0.1:1", || {
                created.fetch_add(1, Ordering::SeqCst);
                ready_future(Err(ConnectError::Timeout))
            });
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pending_connect_expired_entry_is_recreated() {
        let cache = PendingConnects::new(Duration::ZERO);

        let (_, first) = cache.get_or_create("e", || ready_future(Err(ConnectError::Timeout)));
        let (_, second) = cache.get_or_create("e", || ready_future(Err(ConnectError::Aborted)));
        assert!(first);
        assert!(second);
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_pending_connect_keeps_every_live_entry() {
        let cache = PendingConnects::new(Duration::from_secs(30));
        let created = AtomicUsize::new(0);
        let endpoints: Vec<String> = (0..2000)
            .map(|i| format!("10.0.{}.{}:1", i / 250, i % 250))
            .collect();

        for endpoint in endpoints.iter().chain(endpoints.iter()) {
            let _ = cache.get_or_create(endpoint, || {
                created.fetch_add(1, Ordering::SeqCst);
                ready_future(Err(ConnectError::Timeout))
            });
        }
        assert_eq!(created.load(Ordering::SeqCst), endpoints.len());
        assert_eq!(cache.len(), endpoints.len());
    }

    #[test]
    fn test_pending_connect_drops_expired_entries_on_insert() {
        let cache = PendingConnects::new(Duration::ZERO);
        for endpoint in ["a:1", "b:1", "c:1"] {
            let _ = cache.get_or_create(endpoint, || ready_future(Err(ConnectError::Timeout)));
        }
        // Only the entry written last can still be present.
        assert!(cache.len() <= 1);
    }

    #[tokio::test]
    async fn test_shared_future_hands_same_failure_to_every_waiter() {
        let cache = PendingConnects::new(Duration::from_secs(30));
        let (a, _) = cache.get_or_create("e", || ready_future(Err(ConnectError::Shutdown)));
        let (b, _) = cache.get_or_create("e", || ready_future(Err(ConnectError::Aborted)));

        assert_eq!(a.await.unwrap_err(), ConnectError::Shutdown);
        assert_eq!(b.await.unwrap_err(), ConnectError::Shutdown);
    }

    #[test]
    fn test_concurrent_get_or_create_creates_once() {
        let cache = Arc::new(PendingConnects::new(Duration::from_secs(30)));
        let created = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let created = Arc::clone(&created);
                std::thread::spawn(move || {
                    cache.get_or_create("shared", || {
                        created.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(5));
                        ready_future(Err(ConnectError::Timeout))
                    });
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }
}
