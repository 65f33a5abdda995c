//! echo-server: serve the echo protocol until SIGINT/SIGTERM.
//!
//! Exits 0 after a clean drain, non-zero if configuration or bind fails.

use echo_service::config::Config;
use echo_service::server::Server;
use echo_service::signals::shutdown_signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        max_connections = config.max_connections,
        idle_timeout_secs = config.idle_timeout.map(|d| d.as_secs()).unwrap_or(0),
        drain_deadline_secs = config.drain_deadline.as_secs(),
        read_buffer_size = config.read_buffer_size,
        "Starting echo server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    runtime.block_on(serve(config))
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let server = match Server::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Startup failed");
            return Err(e.into());
        }
    };
    info!(address = %server.local_addr(), "Server listening");

    let report = server.run_until(shutdown_signal()).await;
    info!(
        cancelled = report.cancelled,
        force_closed = report.force_closed,
        "Shutdown complete"
    );
    Ok(())
}
