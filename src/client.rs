//! Client driver for the echo server.
//!
//! A [`Session`] sends payloads and waits for each one to come back in
//! full, accumulating partial reads. It is used by the interactive
//! `echo-client` binary and by tests.

use crate::error::ClientError;
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Default time to wait for a payload to be echoed.
pub const DEFAULT_ECHO_TIMEOUT: Duration = Duration::from_secs(5);

/// Prompt shown before each line in interactive mode.
pub const PROMPT: &str = "Enter message (or 'quit' to exit): ";

const READ_CHUNK: usize = 4096;

/// An open connection to an echo server.
#[derive(Debug)]
pub struct Session {
    stream: Option<TcpStream>,
    peer: SocketAddr,
    /// Bytes received but not yet matched to a payload.
    pending: BytesMut,
    /// Bytes still owed by the server for payloads whose echo timed out.
    owed: usize,
    echo_timeout: Duration,
}

impl Session {
    /// Connect to `host:port`.
    pub async fn connect(host: &str, port: u16) -> Result<Self, ClientError> {
        let addr = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };

        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: addr.clone(),
                source,
            })?;
        let peer = stream
            .peer_addr()
            .map_err(|source| ClientError::Connect { addr, source })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
        }

        debug!(%peer, "Connected");

        Ok(Self {
            stream: Some(stream),
            peer,
            pending: BytesMut::with_capacity(READ_CHUNK),
            owed: 0,
            echo_timeout: DEFAULT_ECHO_TIMEOUT,
        })
    }

    /// Set the per-call echo timeout.
    pub fn with_echo_timeout(mut self, echo_timeout: Duration) -> Self {
        self.echo_timeout = echo_timeout;
        self
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Send `payload` and wait for exactly the same bytes to come back.
    ///
    /// The payload is written while its echo is read back, so a payload
    /// larger than the socket buffers cannot stall either side. The echo
    /// timeout covers both. If it fires, the bytes the server still owes
    /// (everything written so far) are discarded when they arrive during a
    /// later call. An empty payload returns immediately.
    pub async fn send(&mut self, payload: &[u8]) -> Result<Bytes, ClientError> {
        let stream = self.stream.as_mut().ok_or(ClientError::SessionClosed)?;
        if payload.is_empty() {
            return Ok(Bytes::new());
        }

        let peer = self.peer;
        let wanted = self.owed + payload.len();
        let pending = &mut self.pending;
        let mut written = 0usize;
        let (mut reader, mut writer) = stream.split();

        let write = async {
            while written < payload.len() {
                let n = writer.write(&payload[written..]).await?;
                if n == 0 {
                    return Err(ClientError::Io(io::ErrorKind::WriteZero.into()));
                }
                written += n;
            }
            trace!(%peer, bytes = written, "Sent");
            Ok::<(), ClientError>(())
        };
        let fill = async {
            while pending.len() < wanted {
                pending.reserve(READ_CHUNK);
                let n = reader.read_buf(&mut *pending).await?;
                if n == 0 {
                    return Err(ClientError::Closed {
                        expected: wanted,
                        received: pending.len(),
                    });
                }
            }
            Ok::<(), ClientError>(())
        };

        let round_trip = async { tokio::try_join!(write, fill) };
        match tokio::time::timeout(self.echo_timeout, round_trip).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                let received = self.pending.len().saturating_sub(self.owed);
                // Only what reached the socket will be echoed.
                self.owed += written;
                return Err(ClientError::EchoTimeout {
                    expected: payload.len(),
                    received: received.min(payload.len()),
                });
            }
        }

        self.pending.advance(self.owed);
        self.owed = 0;
        let response = self.pending.split_to(payload.len()).freeze();
        if response != payload {
            return Err(ClientError::Mismatch);
        }
        Ok(response)
    }

    /// Close the connection. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        if let Some(mut stream) = self.stream.take() {
            debug!(peer = %self.peer, "Closing session");
            // The server may already have gone away.
            let _ = stream.shutdown().await;
        }
        Ok(())
    }
}

/// Line-oriented interactive loop.
///
/// Reads lines from `input`, sends each one, and prints `Received: <line>`
/// to `output`. `quit` (any case) or end of input closes the session
/// without sending anything.
pub async fn run_interactive<R, W>(
    session: &mut Session,
    mut input: R,
    mut output: W,
) -> Result<(), ClientError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = String::new();

    loop {
        output.write_all(PROMPT.as_bytes()).await?;
        output.flush().await?;

        line.clear();
        if input.read_line(&mut line).await? == 0 {
            output.write_all(b"\n").await?;
            break;
        }

        let message = line.trim_end_matches(['\r', '\n']);
        if message.trim().eq_ignore_ascii_case("quit") {
            break;
        }

        let echoed = session.send(message.as_bytes()).await?;
        let text = String::from_utf8_lossy(&echoed);
        output
            .write_all(format!("Received: {text}\n").as_bytes())
            .await?;
    }

    output.flush().await?;
    session.close().await
}
