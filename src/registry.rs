//! Registry of live connections.
//!
//! The only state shared between the acceptor and the connection handlers.
//! Enforces the concurrent-connection limit at admission time and lets the
//! lifecycle controller cancel every handler during drain.

use crate::connection::ConnectionId;
use slab::Slab;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A registered handler: its id serial, peer and cancellation handle.
#[derive(Debug)]
struct Entry {
    serial: u64,
    peer: SocketAddr,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct Inner {
    entries: Slab<Entry>,
    next_serial: u64,
    accepting: bool,
}

/// Registry of active connections using slab allocation.
///
/// All operations take an internal lock, so any number of handlers and the
/// acceptor may call them concurrently.
#[derive(Debug)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    max_connections: usize,
    emptied: Notify,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                entries: Slab::with_capacity(max_connections),
                next_serial: 1,
                accepting: true,
            }),
            max_connections,
            emptied: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a connection if the registry is under its limit.
    ///
    /// Returns `None` without side effect when at capacity or when admission
    /// has been closed for draining. The returned [`Admission`] unregisters
    /// the connection when dropped.
    pub fn admit(self: &Arc<Self>, peer: SocketAddr) -> Option<Admission> {
        let mut inner = self.lock();
        if !inner.accepting || inner.entries.len() >= self.max_connections {
            return None;
        }

        let serial = inner.next_serial;
        inner.next_serial += 1;

        let cancel = CancellationToken::new();
        let key = inner.entries.insert(Entry {
            serial,
            peer,
            cancel: cancel.clone(),
        });
        let id = ConnectionId::new(key, serial);
        trace!(conn = %id, %peer, active = inner.entries.len(), "Admitted");

        Some(Admission {
            id,
            peer,
            cancel,
            registry: Arc::clone(self),
        })
    }

    /// Remove a connection. Removing an absent or stale id is a no-op.
    ///
    /// Returns whether an entry was removed.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let mut inner = self.lock();
        let matches = inner
            .entries
            .get(id.key)
            .is_some_and(|entry| entry.serial == id.serial);
        if !matches {
            return false;
        }

        inner.entries.remove(id.key);
        trace!(conn = %id, active = inner.entries.len(), "Removed");
        if inner.entries.is_empty() {
            self.emptied.notify_waiters();
        }
        true
    }

    /// Ids of all currently registered connections.
    pub fn snapshot(&self) -> Vec<ConnectionId> {
        self.lock()
            .entries
            .iter()
            .map(|(key, entry)| ConnectionId::new(key, entry.serial))
            .collect()
    }

    /// Peer address of a registered connection.
    pub fn peer(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.lock()
            .entries
            .get(id.key)
            .filter(|entry| entry.serial == id.serial)
            .map(|entry| entry.peer)
    }

    /// Signal every registered handler to stop. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let inner = self.lock();
        for (key, entry) in inner.entries.iter() {
            let id = ConnectionId::new(key, entry.serial);
            debug!(conn = %id, peer = %entry.peer, "Cancelling connection");
            entry.cancel.cancel();
        }
        inner.entries.len()
    }

    /// Refuse all further admissions.
    pub fn close_admission(&self) {
        self.lock().accepting = false;
    }

    /// Whether `admit` may still succeed.
    pub fn is_accepting(&self) -> bool {
        self.lock().accepting
    }

    /// Suspend until no connections remain registered.
    pub async fn wait_empty(&self) {
        loop {
            // Registered before the check so a removal in between is not missed.
            let emptied = self.emptied.notified();
            if self.is_empty() {
                return;
            }
            emptied.await;
        }
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}

/// Proof that a connection holds a registry slot.
///
/// Dropping it removes the entry exactly once, whether the handler finished,
/// panicked or was aborted.
#[derive(Debug)]
pub struct Admission {
    id: ConnectionId,
    peer: SocketAddr,
    cancel: CancellationToken,
    registry: Arc<ConnectionRegistry>,
}

impl Admission {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Token cancelled when the registry asks this handler to stop.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
