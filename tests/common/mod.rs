//! Shared utilities for integration testing.

use echo_service::config::Config;
use echo_service::server::{DrainReport, Server, ServerHandle};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A server running on an ephemeral loopback port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub handle: ServerHandle,
    pub task: JoinHandle<DrainReport>,
}

impl TestServer {
    /// Stop the server and wait for its drain report.
    pub async fn shutdown(self) -> DrainReport {
        self.handle.stop();
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("server did not stop")
            .expect("server task panicked")
    }
}

/// Config bound to 127.0.0.1 on a port chosen by the OS.
pub fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        max_connections: 64,
        idle_timeout: Some(Duration::from_secs(30)),
        drain_deadline: Duration::from_secs(2),
        ..Config::default()
    }
}

pub async fn start_server(config: Config) -> TestServer {
    let server = Server::bind(config).await.expect("bind failed");
    let addr = server.local_addr();
    let handle = server.handle();
    let task = tokio::spawn(server.run());
    TestServer { addr, handle, task }
}

/// Poll `condition` until it holds, panicking after `limit`.
pub async fn wait_until<F>(limit: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}", limit);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
