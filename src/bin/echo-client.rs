//! echo-client: talk to an echo server from the terminal.
//!
//! Exit codes: 0 on quit or end of input, 1 when the server cannot be
//! reached, 2 when an echo times out or comes back wrong.

use clap::Parser;
use echo_service::client::{run_interactive, Session};
use echo_service::error::ClientError;
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the echo client
#[derive(Parser, Debug)]
#[command(name = "echo-client")]
#[command(version = "0.1.0")]
#[command(about = "Interactive client for the echo server", long_about = None)]
struct Args {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Seconds to wait for each echo
    #[arg(short, long, default_value_t = 5)]
    timeout: u64,

    /// Send this message instead of reading stdin (repeatable)
    #[arg(short, long)]
    message: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut session = match Session::connect(&args.host, args.port).await {
        Ok(session) => session.with_echo_timeout(Duration::from_secs(args.timeout)),
        Err(e) if e.is_refused() => {
            eprintln!(
                "Connection to {}:{} was refused. Is the server running?",
                args.host, args.port
            );
            return ExitCode::from(1);
        }
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(1);
        }
    };
    println!("Connected to server at {}:{}", args.host, args.port);

    let result = if args.message.is_empty() {
        run_interactive(
            &mut session,
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
        )
        .await
    } else {
        send_messages(&mut session, &args.message).await
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let _ = session.close().await;
            report(&e)
        }
    }
}

async fn send_messages(session: &mut Session, messages: &[String]) -> Result<(), ClientError> {
    for message in messages {
        let echoed = session.send(message.as_bytes()).await?;
        println!("Received: {}", String::from_utf8_lossy(&echoed));
    }
    session.close().await
}

fn report(e: &ClientError) -> ExitCode {
    match e {
        ClientError::EchoTimeout { .. } => {
            eprintln!("Server is not responding: {e}");
            ExitCode::from(2)
        }
        ClientError::Closed { .. } | ClientError::Mismatch => {
            eprintln!("Echo failed: {e}");
            ExitCode::from(2)
        }
        _ => {
            eprintln!("Connection lost: {e}");
            ExitCode::from(1)
        }
    }
}
