//! TCP acceptor with admission control.
//!
//! Binds the configured address, accepts connections and spawns one
//! handler task per admitted connection. Connections arriving while the
//! registry is full are closed straight away. The accept loop never waits
//! on a handler.

use crate::config::Config;
use crate::error::BindError;
use crate::handler::{ConnectionHandler, Outcome, Report};
use crate::registry::ConnectionRegistry;
use crate::stats::ServerStats;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Listen backlog passed to `listen(2)`.
const BACKLOG: i32 = 1024;

/// Pause after a failed accept so a persistent error (e.g. EMFILE) does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// A bound listener that feeds the connection registry.
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
    config: Arc<Config>,
    registry: Arc<ConnectionRegistry>,
    stats: Arc<ServerStats>,
    tasks: JoinSet<()>,
}

impl Listener {
    /// Bind to the configured address.
    ///
    /// Fails fast; nothing is retried.
    pub async fn bind(
        config: Arc<Config>,
        registry: Arc<ConnectionRegistry>,
        stats: Arc<ServerStats>,
    ) -> Result<Self, BindError> {
        let bind_addr = config.bind_addr();

        let addr = tokio::net::lookup_host(&bind_addr)
            .await
            .map_err(|e| BindError::new(&bind_addr, e))?
            .next()
            .ok_or_else(|| {
                BindError::new(
                    &bind_addr,
                    io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing"),
                )
            })?;

        let std_listener = create_listener(addr).map_err(|e| BindError::new(&bind_addr, e))?;
        let inner = TcpListener::from_std(std_listener).map_err(|e| BindError::new(&bind_addr, e))?;
        let local_addr = inner
            .local_addr()
            .map_err(|e| BindError::new(&bind_addr, e))?;

        info!(
            address = %local_addr,
            max_connections = registry.capacity(),
            "Listener bound"
        );

        Ok(Self {
            inner,
            local_addr,
            config,
            registry,
            stats,
            tasks: JoinSet::new(),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `stop` is cancelled.
    ///
    /// The listening socket is closed on return. Handler tasks that are
    /// still running are handed back so the caller can drain them.
    pub async fn run(mut self, stop: CancellationToken) -> JoinSet<()> {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Connection handler panicked");
                        }
                    }
                    continue;
                }
                accepted = self.inner.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => self.dispatch(stream, peer),
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        info!(address = %self.local_addr, "Listener stopped");
        let Self { inner, tasks, .. } = self;
        drop(inner);
        tasks
    }

    /// Admit or reject one accepted connection.
    fn dispatch(&mut self, stream: TcpStream, peer: SocketAddr) {
        let Some(admission) = self.registry.admit(peer) else {
            self.stats.record_rejected();
            info!(
                %peer,
                max_connections = self.registry.capacity(),
                "Connection rejected: at capacity"
            );
            // Dropping the stream closes it without reading anything.
            drop(stream);
            return;
        };

        self.stats.record_accepted();
        debug!(conn = %admission.id(), %peer, "Connection accepted");

        if let Err(e) = stream.set_nodelay(true) {
            debug!(conn = %admission.id(), error = %e, "Failed to set TCP_NODELAY");
        }

        let handler = ConnectionHandler::new(stream, admission, &self.config);
        let stats = Arc::clone(&self.stats);
        self.tasks.spawn(async move {
            let report = handler.run().await;
            log_report(&report, &stats);
        });
    }
}

/// Record a finished connection in the stats and the log.
fn log_report(report: &Report, stats: &ServerStats) {
    let conn = &report.connection;
    stats.record_received(conn.bytes_read());
    stats.record_echoed(conn.bytes_written());

    match &report.outcome {
        Outcome::PeerClosed => {
            stats.record_peer_closed();
            debug!(
                conn = %conn.id(),
                peer = %conn.peer(),
                bytes_read = conn.bytes_read(),
                bytes_written = conn.bytes_written(),
                "Connection closed"
            );
        }
        Outcome::Timeout => {
            stats.record_timed_out();
            info!(
                conn = %conn.id(),
                peer = %conn.peer(),
                bytes_read = conn.bytes_read(),
                "Connection timed out"
            );
        }
        Outcome::Cancelled => {
            stats.record_cancelled();
            debug!(
                conn = %conn.id(),
                peer = %conn.peer(),
                bytes_written = conn.bytes_written(),
                "Connection cancelled"
            );
        }
        Outcome::ConnectionError(e) => {
            stats.record_errored();
            warn!(
                conn = %conn.id(),
                peer = %conn.peer(),
                error = %e,
                "Connection error"
            );
        }
    }
}

/// Create a non-blocking listening socket.
///
/// `SO_REUSEADDR` lets the server restart while old sockets sit in
/// TIME_WAIT. `SO_REUSEPORT` is deliberately left off so a second server on
/// the same port fails to bind.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}
