//! Lifecycle controller for the echo server.
//!
//! ```text
//! Starting ──bind ok──▶ Running ──stop/signal──▶ Draining ──▶ Stopped
//!     └──────────── bind error ─────────────────────────────────▲
//! ```
//!
//! Draining closes admission, stops the acceptor, cancels every registered
//! handler and waits for the registry to empty. Handlers still alive at the
//! drain deadline are aborted, which closes their sockets.

use crate::config::Config;
use crate::error::BindError;
use crate::listener::Listener;
use crate::registry::ConnectionRegistry;
use crate::stats::{ServerStats, StatsSnapshot};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Lifecycle phase of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// Result of a completed drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
    /// Handlers asked to stop when draining began.
    pub cancelled: usize,
    /// Handlers aborted at the drain deadline.
    pub force_closed: usize,
    pub stats: StatsSnapshot,
}

/// Server instance
pub struct Server {
    config: Arc<Config>,
    listener: Listener,
    registry: Arc<ConnectionRegistry>,
    stats: Arc<ServerStats>,
    stop: CancellationToken,
    phase: watch::Sender<Phase>,
}

impl Server {
    /// Bind the listener and enter `Running`.
    ///
    /// This is the only fallible step of the lifecycle; on error no server
    /// exists.
    pub async fn bind(config: Config) -> Result<Self, BindError> {
        let (phase, _) = watch::channel(Phase::Starting);
        let config = Arc::new(config);
        let registry = ConnectionRegistry::new(config.max_connections);
        let stats = Arc::new(ServerStats::new());

        let listener = Listener::bind(
            Arc::clone(&config),
            Arc::clone(&registry),
            Arc::clone(&stats),
        )
        .await?;

        phase.send_replace(Phase::Running);

        Ok(Server {
            config,
            listener,
            registry,
            stats,
            stop: CancellationToken::new(),
            phase,
        })
    }

    /// Address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A cloneable handle for stopping and observing the server.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            stop: self.stop.clone(),
            phase: self.phase.subscribe(),
            registry: Arc::clone(&self.registry),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Serve until [`ServerHandle::stop`] is called, then drain.
    pub async fn run(self) -> DrainReport {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Serve until `signal` completes or [`ServerHandle::stop`] is called,
    /// then drain.
    pub async fn run_until<F>(self, signal: F) -> DrainReport
    where
        F: Future<Output = ()>,
    {
        let Server {
            config,
            listener,
            registry,
            stats,
            stop,
            phase,
        } = self;

        let trigger = async {
            tokio::select! {
                _ = signal => {
                    info!("Shutdown signal received");
                    stop.cancel();
                }
                _ = stop.cancelled() => {}
            }
        };
        let (mut tasks, ()) = tokio::join!(listener.run(stop.clone()), trigger);

        phase.send_replace(Phase::Draining);
        registry.close_admission();
        let cancelled = registry.cancel_all();
        info!(
            active = cancelled,
            deadline_ms = config.drain_deadline.as_millis() as u64,
            "Draining connections"
        );

        let drained = tokio::time::timeout(config.drain_deadline, registry.wait_empty())
            .await
            .is_ok();
        let force_closed = if drained { 0 } else { registry.len() };
        if force_closed > 0 {
            warn!(
                remaining = force_closed,
                "Drain deadline elapsed, force-closing connections"
            );
        }
        // Aborting drops each handler, closing its socket and registry entry.
        tasks.shutdown().await;

        let snapshot = stats.snapshot();
        info!(
            accepted = snapshot.accepted,
            rejected = snapshot.rejected,
            peer_closed = snapshot.peer_closed,
            timed_out = snapshot.timed_out,
            errored = snapshot.errored,
            cancelled = snapshot.cancelled,
            bytes_received = snapshot.bytes_received,
            bytes_echoed = snapshot.bytes_echoed,
            "Server stopped"
        );
        phase.send_replace(Phase::Stopped);

        DrainReport {
            cancelled,
            force_closed,
            stats: snapshot,
        }
    }
}

/// Stops and observes a running [`Server`].
#[derive(Debug, Clone)]
pub struct ServerHandle {
    stop: CancellationToken,
    phase: watch::Receiver<Phase>,
    registry: Arc<ConnectionRegistry>,
    stats: Arc<ServerStats>,
}

impl ServerHandle {
    /// Trigger shutdown. Calling it again, or after the server stopped, is a no-op.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Wait until the server reaches `Stopped`.
    pub async fn wait_stopped(&mut self) {
        // A dropped sender means the server is gone, which is as stopped as it gets.
        let _ = self
            .phase
            .wait_for(|phase| *phase == Phase::Stopped)
            .await;
    }

    /// Number of connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
