//! echo-service: a concurrent TCP echo server and its client driver.
//!
//! The server returns every byte it receives, in order, on the connection it
//! arrived on. Around that it provides:
//! - One task per connection, with a cap on concurrent connections
//! - Idle timeouts for silent peers
//! - Graceful drain on shutdown with a hard deadline
//! - Configuration via CLI arguments or TOML file

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod listener;
pub mod registry;
pub mod server;
pub mod signals;
pub mod stats;

pub use client::Session;
pub use config::Config;
pub use error::{BindError, ClientError};
pub use server::{DrainReport, Phase, Server, ServerHandle};
