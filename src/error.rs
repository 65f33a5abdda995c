//! Error types surfaced to callers.
//!
//! Failures local to one served connection are not errors at this level;
//! they end up as a [`crate::handler::Outcome`].

use std::io;
use thiserror::Error;

/// The server could not bind its listening socket.
///
/// Fatal at startup and never retried.
#[derive(Debug, Error)]
#[error("Failed to bind {addr}: {source}")]
pub struct BindError {
    /// The `host:port` that was requested.
    pub addr: String,
    #[source]
    pub source: io::Error,
}

impl BindError {
    pub fn new(addr: impl Into<String>, source: io::Error) -> Self {
        Self {
            addr: addr.into(),
            source,
        }
    }

    /// Kind of the underlying I/O failure (e.g. `AddrInUse`).
    pub fn kind(&self) -> io::ErrorKind {
        self.source.kind()
    }
}

/// Errors returned by the client driver.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The server could not be reached.
    #[error("Connection to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The echo did not come back in time.
    #[error("Timed out waiting for echo ({received} of {expected} bytes received)")]
    EchoTimeout { expected: usize, received: usize },

    /// The server closed the connection before the echo was complete.
    #[error("Server closed the connection ({received} of {expected} bytes received)")]
    Closed { expected: usize, received: usize },

    /// The bytes that came back differ from the ones sent.
    #[error("Echoed bytes do not match the payload")]
    Mismatch,

    /// The session was already closed.
    #[error("Session is closed")]
    SessionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    /// True when the server could not be reached at all.
    pub fn is_connect(&self) -> bool {
        matches!(self, ClientError::Connect { .. })
    }

    /// True when the server was reachable but too slow to echo.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::EchoTimeout { .. })
    }

    /// True when the connect attempt was actively refused.
    pub fn is_refused(&self) -> bool {
        matches!(
            self,
            ClientError::Connect { source, .. } if source.kind() == io::ErrorKind::ConnectionRefused
        )
    }
}
