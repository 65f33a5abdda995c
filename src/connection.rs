//! Per-connection bookkeeping.
//!
//! A `Connection` is owned by the handler serving it. The registry only
//! knows its `ConnectionId`.

use chrono::{DateTime, Utc};
use std::fmt;
use std::net::SocketAddr;

/// Unique identifier for an accepted connection.
///
/// `key` is the registry slot; `serial` is never reused, so an id that
/// outlives its slot cannot be confused with a newer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub(crate) key: usize,
    pub(crate) serial: u64,
}

impl ConnectionId {
    pub(crate) fn new(key: usize, serial: u64) -> Self {
        Self { key, serial }
    }

    /// Monotonic serial number of this connection.
    pub fn serial(&self) -> u64 {
        self.serial
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.serial)
    }
}

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Echoing.
    Active,
    /// Shutting down the write half.
    Closing,
    /// Socket released.
    Closed,
}

/// A single client connection.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    created_at: DateTime<Utc>,
    state: ConnState,
    bytes_read: u64,
    bytes_written: u64,
}

impl Connection {
    /// Create a new connection in the active state.
    pub fn new(id: ConnectionId, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            created_at: Utc::now(),
            state: ConnState::Active,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Time since the connection was accepted.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }

    pub(crate) fn record_read(&mut self, n: usize) {
        self.bytes_read += n as u64;
    }

    pub(crate) fn record_written(&mut self, n: usize) {
        self.bytes_written += n as u64;
    }

    /// Mark connection as closing.
    pub(crate) fn start_closing(&mut self) {
        if self.state == ConnState::Active {
            self.state = ConnState::Closing;
        }
    }

    /// Mark connection as closed.
    pub(crate) fn close(&mut self) {
        self.state = ConnState::Closed;
    }
}
