//! Echo loop for a single connection.
//!
//! Reads up to `read_buffer_size` bytes, writes exactly those bytes back,
//! and repeats until the peer closes, the connection goes idle, an I/O
//! error occurs or the registry cancels it. Cancellation is only observed
//! while waiting for input, so an echo that has started is always written
//! out in full.

use crate::config::Config;
use crate::connection::Connection;
use crate::registry::Admission;
use bytes::BytesMut;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Upper bound on shutting down the write half once the loop has ended.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// How a connection ended.
#[derive(Debug)]
pub enum Outcome {
    /// The peer closed its side cleanly.
    PeerClosed,
    /// No data arrived (or could be written) within the idle timeout.
    Timeout,
    /// Stopped by the registry, usually during shutdown.
    Cancelled,
    /// The connection failed mid-session.
    ConnectionError(io::Error),
}

impl Outcome {
    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::ConnectionError(_))
    }
}

/// Final state of a handler run.
#[derive(Debug)]
pub struct Report {
    pub connection: Connection,
    pub outcome: Outcome,
}

/// Owns one admitted connection for its whole lifetime.
pub struct ConnectionHandler<S> {
    stream: S,
    connection: Connection,
    buffer: BytesMut,
    idle_timeout: Option<Duration>,
    // Dropped with the handler, which unregisters the connection.
    admission: Admission,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, admission: Admission, config: &Config) -> Self {
        Self {
            stream,
            connection: Connection::new(admission.id(), admission.peer()),
            buffer: BytesMut::zeroed(config.read_buffer_size),
            idle_timeout: config.idle_timeout,
            admission,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Run the echo loop to completion and close the connection.
    pub async fn run(mut self) -> Report {
        let outcome = self.echo_loop().await;

        self.connection.start_closing();
        // Best effort: the peer may already be gone.
        let _ = tokio::time::timeout(CLOSE_GRACE, self.stream.shutdown()).await;
        self.connection.close();

        let Self {
            stream,
            connection,
            admission,
            ..
        } = self;
        drop(stream);
        drop(admission);

        Report {
            connection,
            outcome,
        }
    }

    async fn echo_loop(&mut self) -> Outcome {
        let cancel = self.admission.cancellation().clone();

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Outcome::Cancelled,
                read = with_idle_timeout(self.idle_timeout, self.stream.read(&mut self.buffer[..])) => read,
            };

            let n = match read {
                None => return Outcome::Timeout,
                Some(Ok(0)) => return Outcome::PeerClosed,
                Some(Ok(n)) => n,
                Some(Err(e)) => return Outcome::ConnectionError(e),
            };
            self.connection.record_read(n);
            trace!(conn = %self.connection.id(), bytes = n, "Echoing");

            let write =
                with_idle_timeout(self.idle_timeout, self.stream.write_all(&self.buffer[..n])).await;
            match write {
                None => return Outcome::Timeout,
                Some(Ok(())) => self.connection.record_written(n),
                Some(Err(e)) => return Outcome::ConnectionError(e),
            }
        }
    }
}

/// Await `fut`, giving up after `limit` if one is set.
async fn with_idle_timeout<F: std::future::Future>(
    limit: Option<Duration>,
    fut: F,
) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}
