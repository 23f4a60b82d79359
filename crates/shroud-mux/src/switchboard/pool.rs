//! Pool of physical connections attached to one session

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Pool-local identifier of a physical connection
pub(crate) type ConnId = u32;

/// Handle to the writer and reader tasks of one physical connection
pub(crate) struct ConnHandle {
    /// Records queued for the writer task
    pub(crate) tx: mpsc::Sender<Bytes>,
    /// Stops both tasks
    pub(crate) cancel: CancellationToken,
}

/// Physical connections indexed by connection ID
pub(crate) struct ConnectionPool {
    conns: DashMap<ConnId, ConnHandle>,
    next_id: AtomicU32,
    cursor: AtomicUsize,
}

impl ConnectionPool {
    /// Create a new empty pool
    pub(crate) fn new() -> Self {
        Self {
            conns: DashMap::new(),
            next_id: AtomicU32::new(0),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Register a connection and return its ID
    pub(crate) fn insert(&self, handle: ConnHandle) -> ConnId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.conns.insert(id, handle);
        id
    }

    /// Next connection in round-robin order
    pub(crate) fn pick(&self) -> Option<(ConnId, mpsc::Sender<Bytes>)> {
        let mut ids: Vec<ConnId> = self.conns.iter().map(|entry| *entry.key()).collect();
        if ids.is_empty() {
            return None;
        }
        ids.sort_unstable();

        let id = ids[self.cursor.fetch_add(1, Ordering::Relaxed) % ids.len()];
        self.conns.get(&id).map(|entry| (id, entry.tx.clone()))
    }

    /// Remove a connection and stop its tasks
    pub(crate) fn remove(&self, id: ConnId) -> bool {
        match self.conns.remove(&id) {
            Some((_, handle)) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove every connection, returning how many there were
    pub(crate) fn clear(&self) -> usize {
        let ids: Vec<ConnId> = self.conns.iter().map(|entry| *entry.key()).collect();
        ids.into_iter().filter(|id| self.remove(*id)).count()
    }

    /// Number of attached connections
    pub(crate) fn len(&self) -> usize {
        self.conns.len()
    }

    /// Check if pool is empty
    pub(crate) fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}
