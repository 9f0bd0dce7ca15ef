//! Authoritative table of live connections.
//!
//! Each entry pairs the connection's outbound handle with its session
//! metadata, so the set of live connections and the set of named sessions are
//! always updated together under one lock. Connections that have been accepted
//! but have not finished the handshake are live with no [`SessionInfo`] yet.

use std::{
    collections::BTreeMap,
    fmt,
    net::SocketAddr,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::SystemTime,
};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Number of payloads that may wait for a slow peer before it is dropped.
pub const OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub addr: SocketAddr,
    pub name: String,
    pub joined_at: SystemTime,
}

impl SessionInfo {
    pub fn new(addr: SocketAddr, name: String) -> Self {
        Self {
            addr,
            name,
            joined_at: SystemTime::now(),
        }
    }
}

/// Outbound side of one connection.
///
/// Payloads are queued for the connection's writer task, which is the only
/// code that touches the socket's write half. Cancelling the close token tells
/// both the writer and the owning session to wind down.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    outbound: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// The writer has stopped, usually because the socket write failed.
    Closed,
    /// The peer is not draining its queue.
    Backlogged,
}

impl ConnectionHandle {
    pub fn channel() -> (Self, mpsc::Receiver<Bytes>) {
        let (outbound, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let handle = Self {
            outbound,
            closed: CancellationToken::new(),
        };
        (handle, rx)
    }

    pub fn send(&self, payload: Bytes) -> Result<(), DeliveryFailure> {
        if self.is_closed() {
            return Err(DeliveryFailure::Closed);
        }
        self.outbound.try_send(payload).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DeliveryFailure::Backlogged,
            mpsc::error::TrySendError::Closed(_) => DeliveryFailure::Closed,
        })
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub(crate) fn close_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub handle: ConnectionHandle,
    pub info: Option<SessionInfo>,
}

#[derive(Default)]
pub struct Registry {
    entries: Mutex<BTreeMap<ConnectionId, Entry>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn add(&self, id: ConnectionId, handle: ConnectionHandle) {
        self.lock().insert(id, Entry { handle, info: None });
    }

    /// Returns `false` if the connection is no longer live.
    pub fn set_info(&self, id: ConnectionId, info: SessionInfo) -> bool {
        match self.lock().get_mut(&id) {
            Some(entry) => {
                entry.info = Some(info);
                true
            }
            None => false,
        }
    }

    /// Removes a connection. Only the first caller for a given id gets the entry back.
    pub fn remove(&self, id: ConnectionId) -> Option<Entry> {
        self.lock().remove(&id)
    }

    #[cfg(test)]
    pub(crate) fn info(&self, id: ConnectionId) -> Option<SessionInfo> {
        self.lock().get(&id).and_then(|entry| entry.info.clone())
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Every live connection, ordered by id.
    ///
    /// Clones the entries so callers can deliver without holding the lock.
    pub fn snapshot(&self) -> Vec<(ConnectionId, Entry)> {
        self.lock()
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.lock()
            .values()
            .filter_map(|entry| entry.info.as_ref().map(|info| info.name.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drops every entry and hands back the handles so the caller can close them.
    pub fn clear(&self) -> Vec<ConnectionHandle> {
        std::mem::take(&mut *self.lock())
            .into_values()
            .map(|entry| entry.handle)
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ConnectionId, Entry>> {
        // Every critical section leaves the map consistent, so a panic elsewhere
        // cannot leave a half-written entry behind.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn accepted_connections_are_live_before_handshake() {
        let registry = Registry::new();
        let id = registry.next_id();
        let (handle, _rx) = ConnectionHandle::channel();

        registry.add(id, handle);

        assert!(registry.contains(id));
        assert_eq!(registry.info(id), None);
        assert!(registry.names().is_empty());
    }

    #[test]
    fn set_info_requires_live_connection() {
        let registry = Registry::new();
        let id = registry.next_id();
        let (handle, _rx) = ConnectionHandle::channel();

        assert!(!registry.set_info(id, SessionInfo::new(addr(4000), "ghost".into())));

        registry.add(id, handle);
        assert!(registry.set_info(id, SessionInfo::new(addr(4000), "alice".into())));
        assert_eq!(registry.names(), vec!["alice".to_string()]);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = Registry::new();
        let id = registry.next_id();
        let (handle, _rx) = ConnectionHandle::channel();
        registry.add(id, handle);

        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_is_ordered_by_id() {
        let registry = Registry::new();
        let ids: Vec<_> = (0..3).map(|_| registry.next_id()).collect();
        for id in ids.iter().rev() {
            let (handle, _rx) = ConnectionHandle::channel();
            registry.add(*id, handle);
        }

        let seen: Vec<_> = registry.snapshot().into_iter().map(|(id, _)| id).collect();
        assert_eq!(seen, ids);
    }

    #[test]
    fn clear_returns_every_handle() {
        let registry = Registry::new();
        for _ in 0..4 {
            let (handle, _rx) = ConnectionHandle::channel();
            registry.add(registry.next_id(), handle);
        }

        let handles = registry.clear();
        assert_eq!(handles.len(), 4);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn handle_reports_closed_queue() {
        let (handle, rx) = ConnectionHandle::channel();
        drop(rx);
        assert_eq!(
            handle.send(Bytes::from_static(b"hi")),
            Err(DeliveryFailure::Closed)
        );

        let (handle, _rx) = ConnectionHandle::channel();
        handle.close();
        assert!(handle.is_closed());
        assert_eq!(
            handle.send(Bytes::from_static(b"hi")),
            Err(DeliveryFailure::Closed)
        );
    }

    #[test]
    fn handle_reports_backlog() {
        let (handle, _rx) = ConnectionHandle::channel();
        for _ in 0..OUTBOUND_CAPACITY {
            handle.send(Bytes::from_static(b"x")).expect("queue has room");
        }
        assert_eq!(
            handle.send(Bytes::from_static(b"x")),
            Err(DeliveryFailure::Backlogged)
        );
    }

    #[test]
    fn quiescent_registry_keeps_names_and_live_set_in_step() {
        let registry = Registry::new();
        let mut ids = Vec::new();
        for (port, name) in [(5001, "alice"), (5002, "bob"), (5003, "carol")] {
            let id = registry.next_id();
            let (handle, _rx) = ConnectionHandle::channel();
            registry.add(id, handle);
            registry.set_info(id, SessionInfo::new(addr(port), name.into()));
            ids.push(id);
        }
        registry.remove(ids[1]);

        let snapshot = registry.snapshot();
        assert!(snapshot.iter().all(|(_, entry)| entry.info.is_some()));
        assert_eq!(snapshot.len(), registry.names().len());
        assert!(!registry.contains(ids[1]));
    }
}
