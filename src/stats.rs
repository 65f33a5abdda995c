//! Server-wide counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters updated by the acceptor and the handlers.
#[derive(Debug, Default)]
pub struct ServerStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    peer_closed: AtomicU64,
    timed_out: AtomicU64,
    errored: AtomicU64,
    cancelled: AtomicU64,
    bytes_received: AtomicU64,
    bytes_echoed: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub peer_closed: u64,
    pub timed_out: u64,
    pub errored: u64,
    pub cancelled: u64,
    pub bytes_received: u64,
    pub bytes_echoed: u64,
}

impl StatsSnapshot {
    /// Connections whose handler has finished, for any reason.
    pub fn finished(&self) -> u64 {
        self.peer_closed + self.timed_out + self.errored + self.cancelled
    }
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_peer_closed(&self) {
        self.peer_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timed_out(&self) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_errored(&self) {
        self.errored.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_echoed(&self, bytes: u64) {
        self.bytes_echoed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            peer_closed: self.peer_closed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_echoed: self.bytes_echoed.load(Ordering::Relaxed),
        }
    }
}
