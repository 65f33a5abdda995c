//! End-to-end tests against a real server on loopback.

use echo_service::client::Session;
use echo_service::config::Config;
use echo_service::server::{Phase, Server};
use std::io;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

mod common;

use common::{start_server, test_config, wait_until};

async fn session(port: u16) -> Session {
    Session::connect("127.0.0.1", port).await.unwrap()
}

/// Read until EOF or error; returns the bytes seen before the close.
async fn read_until_closed<R: AsyncRead + Unpin>(stream: &mut R) -> Vec<u8> {
    let mut seen = Vec::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return seen,
            Ok(n) => seen.extend_from_slice(&buf[..n]),
        }
    }
}

#[tokio::test]
async fn test_ping() {
    let server = start_server(test_config()).await;
    let mut client = session(server.addr.port()).await;

    let echoed = client.send(b"ping").await.unwrap();
    assert_eq!(&echoed[..], b"ping");

    client.close().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_round_trip_identity() {
    let server = start_server(test_config()).await;
    let mut client = session(server.addr.port()).await;

    let every_byte: Vec<u8> = (0..=255u8).collect();
    let large: Vec<u8> = (0..64 * 1024).map(|i| (i * 31 % 251) as u8).collect();
    let payloads: [&[u8]; 5] = [b"a", b"\r\n\0\xff", &every_byte, &large, b"tail"];

    for payload in payloads {
        let echoed = client.send(payload).await.unwrap();
        assert_eq!(&echoed[..], payload);
    }

    client.close().await.unwrap();
    let report = server.shutdown().await;
    let sent: usize = payloads.iter().map(|p| p.len()).sum();
    assert_eq!(report.stats.bytes_echoed, sent as u64);
}

#[tokio::test]
async fn test_multi_megabyte_payload_round_trip() {
    let server = start_server(test_config()).await;
    let mut client = session(server.addr.port())
        .await
        .with_echo_timeout(Duration::from_secs(30));

    // Larger than both directions' socket buffers combined.
    let payload: Vec<u8> = (0..8 * 1024 * 1024).map(|i| (i * 7 % 253) as u8).collect();
    let echoed = tokio::time::timeout(Duration::from_secs(60), client.send(&payload))
        .await
        .expect("large send deadlocked")
        .unwrap();
    assert_eq!(echoed.len(), payload.len());
    assert!(echoed[..] == payload[..]);

    // The session stays usable afterwards
    assert_eq!(&client.send(b"after").await.unwrap()[..], b"after");

    client.close().await.unwrap();
    let report = server.shutdown().await;
    assert_eq!(report.stats.bytes_echoed, payload.len() as u64 + 5);
}

#[tokio::test]
async fn test_responses_preserve_send_order() {
    let server = start_server(test_config()).await;
    let mut stream = TcpStream::connect(server.addr).await.unwrap();

    // Pipeline all sends before reading anything back
    let mut expected = Vec::new();
    for i in 0..100 {
        let message = format!("message-{i};");
        stream.write_all(message.as_bytes()).await.unwrap();
        expected.extend_from_slice(message.as_bytes());
    }

    let mut echoed = vec![0u8; expected.len()];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, expected);

    drop(stream);
    server.shutdown().await;
}

#[tokio::test]
async fn test_many_concurrent_connections() {
    let server = start_server(test_config()).await;
    let port = server.addr.port();

    let clients: Vec<_> = (0..32)
        .map(|i| {
            tokio::spawn(async move {
                let mut client = session(port).await;
                for round in 0..10 {
                    let payload = format!("client {i} round {round}");
                    let echoed = client.send(payload.as_bytes()).await.unwrap();
                    assert_eq!(&echoed[..], payload.as_bytes());
                }
                client.close().await.unwrap();
            })
        })
        .collect();

    for client in clients {
        client.await.unwrap();
    }

    let handle = server.handle.clone();
    wait_until(Duration::from_secs(2), || handle.active_connections() == 0).await;
    let report = server.shutdown().await;
    assert_eq!(report.stats.accepted, 32);
    assert_eq!(report.stats.rejected, 0);
    assert_eq!(report.stats.errored, 0);
}

#[tokio::test]
async fn test_connection_over_limit_is_rejected() {
    let config = Config {
        max_connections: 3,
        ..test_config()
    };
    let server = start_server(config).await;
    let port = server.addr.port();

    let mut admitted = Vec::new();
    for i in 0..3 {
        let mut client = session(port).await;
        let payload = format!("client {i}");
        client.send(payload.as_bytes()).await.unwrap();
        admitted.push(client);
    }
    assert_eq!(server.handle.active_connections(), 3);

    let mut extra = TcpStream::connect(server.addr).await.unwrap();
    let _ = extra.write_all(b"hello?").await;
    let seen = tokio::time::timeout(Duration::from_secs(2), read_until_closed(&mut extra))
        .await
        .expect("rejected connection was left open");
    assert!(seen.is_empty());

    // Admitted connections are unaffected
    for client in admitted.iter_mut() {
        let echoed = client.send(b"still here").await.unwrap();
        assert_eq!(&echoed[..], b"still here");
    }
    assert_eq!(server.handle.stats().rejected, 1);

    // Freeing a slot lets the next connection in
    let mut first = admitted.remove(0);
    first.close().await.unwrap();
    let handle = server.handle.clone();
    wait_until(Duration::from_secs(2), || handle.active_connections() == 2).await;

    let mut late = session(port).await;
    assert_eq!(&late.send(b"late").await.unwrap()[..], b"late");

    server.shutdown().await;
}

#[tokio::test]
async fn test_idle_connection_times_out() {
    let config = Config {
        idle_timeout: Some(Duration::from_millis(200)),
        ..test_config()
    };
    let server = start_server(config).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(b"once").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();

    let started = Instant::now();
    let seen = tokio::time::timeout(Duration::from_secs(5), read_until_closed(&mut stream))
        .await
        .expect("idle connection was not closed");
    assert!(seen.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(150));

    let handle = server.handle.clone();
    wait_until(Duration::from_secs(2), || handle.stats().timed_out == 1).await;
    assert_eq!(handle.stats().errored, 0);
    assert_eq!(handle.active_connections(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_empty_session_is_clean_close() {
    let server = start_server(test_config()).await;
    let handle = server.handle.clone();
    let before = handle.active_connections();

    let mut client = session(server.addr.port()).await;
    assert!(client.send(b"").await.unwrap().is_empty());
    client.close().await.unwrap();

    wait_until(Duration::from_secs(2), || handle.stats().peer_closed == 1).await;
    assert_eq!(handle.active_connections(), before);
    assert_eq!(handle.stats().errored, 0);
    assert_eq!(handle.stats().bytes_echoed, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_drains_active_connections() {
    let config = Config {
        drain_deadline: Duration::from_secs(2),
        ..test_config()
    };
    let server = start_server(config).await;
    let port = server.addr.port();

    let mut streams = Vec::new();
    for i in 0..4 {
        let mut client = session(port).await;
        client.send(format!("before shutdown {i}").as_bytes()).await.unwrap();
        streams.push(client);
    }
    assert_eq!(server.handle.active_connections(), 4);

    let mut handle = server.handle.clone();
    let started = Instant::now();
    let report = server.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.cancelled, 4);
    assert_eq!(report.force_closed, 0);
    assert_eq!(report.stats.cancelled, 4);
    assert_eq!(handle.active_connections(), 0);

    handle.wait_stopped().await;
    assert_eq!(handle.phase(), Phase::Stopped);

    // Every client sees its connection closed
    for mut client in streams {
        assert!(client.send(b"after").await.is_err());
    }
}

#[tokio::test]
async fn test_drain_delivers_unread_echo_before_close() {
    let config = Config {
        idle_timeout: None,
        drain_deadline: Duration::from_secs(5),
        ..test_config()
    };
    let server = start_server(config).await;

    // Echoed in full, but left unread until the drain has begun.
    let payload: Vec<u8> = (0..32 * 1024).map(|i| (i % 241) as u8).collect();
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream.write_all(&payload).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let handle = server.handle.clone();
    let stopping = tokio::spawn(server.shutdown());
    wait_until(Duration::from_secs(2), || handle.phase() != Phase::Running).await;

    let mut echoed = vec![0u8; payload.len()];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, payload);
    let mut rest = [0u8; 16];
    assert_eq!(stream.read(&mut rest).await.unwrap(), 0);

    let report = stopping.await.unwrap();
    assert_eq!(report.cancelled, 1);
    assert_eq!(report.force_closed, 0);
    assert_eq!(report.stats.bytes_echoed, payload.len() as u64);
}

#[tokio::test]
async fn test_drain_lets_in_flight_echo_finish() {
    let config = Config {
        idle_timeout: None,
        read_buffer_size: 256 * 1024,
        drain_deadline: Duration::from_secs(5),
        ..test_config()
    };
    let server = start_server(config).await;

    // Don't read yet, so the server stalls partway through an echo write.
    let payload: Vec<u8> = (0..8 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let stream = TcpStream::connect(server.addr).await.unwrap();
    let (mut reader, mut writer) = stream.into_split();
    let sent = payload.clone();
    let feeder = tokio::spawn(async move {
        let _ = writer.write_all(&sent).await;
        // Keep the write half open: the drain, not EOF, ends the session.
        std::future::pending::<()>().await;
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.handle.active_connections(), 1);

    let handle = server.handle.clone();
    let stopping = tokio::spawn(server.shutdown());
    wait_until(Duration::from_secs(2), || handle.phase() != Phase::Running).await;

    let echoed = tokio::time::timeout(Duration::from_secs(10), read_until_closed(&mut reader))
        .await
        .expect("connection was not closed after the drain");
    assert!(echoed[..] == payload[..echoed.len()]);

    let report = stopping.await.unwrap();
    assert_eq!(report.cancelled, 1);
    assert_eq!(report.force_closed, 0);
    assert_eq!(report.stats.cancelled, 1);
    // Every byte the server took in went back out.
    assert!(report.stats.bytes_echoed > 0);
    assert_eq!(report.stats.bytes_echoed, report.stats.bytes_received);
    feeder.abort();
}

#[tokio::test]
async fn test_drain_deadline_force_closes_stalled_echo() {
    let config = Config {
        idle_timeout: None,
        drain_deadline: Duration::from_millis(200),
        ..test_config()
    };
    let server = start_server(config).await;

    // Flood the server without reading so its echo write stalls.
    let stream = TcpStream::connect(server.addr).await.unwrap();
    let (mut reader, mut writer) = stream.into_split();
    let flood = tokio::spawn(async move {
        let chunk = vec![0x5a; 64 * 1024];
        while writer.write_all(&chunk).await.is_ok() {}
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.handle.active_connections(), 1);

    let handle = server.handle.clone();
    let started = Instant::now();
    let report = server.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.cancelled, 1);
    assert_eq!(report.force_closed, 1);
    assert_eq!(handle.active_connections(), 0);

    // The server side is gone: draining what was echoed ends in EOF or reset.
    let mut buf = vec![0u8; 64 * 1024];
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    flood.abort();
}

#[tokio::test]
async fn test_second_server_on_same_port_fails() {
    let server = start_server(test_config()).await;

    let config = Config {
        port: server.addr.port(),
        ..test_config()
    };
    let err = match Server::bind(config).await {
        Err(e) => e,
        Ok(_) => panic!("bind on a live port succeeded"),
    };
    assert_eq!(err.kind(), io::ErrorKind::AddrInUse);

    // The running server is unaffected
    let mut client = session(server.addr.port()).await;
    assert_eq!(&client.send(b"ok").await.unwrap()[..], b"ok");
    server.shutdown().await;
}

#[tokio::test]
async fn test_client_distinguishes_down_from_slow() {
    let server = start_server(test_config()).await;
    let port = server.addr.port();
    server.shutdown().await;

    let err = Session::connect("127.0.0.1", port).await.unwrap_err();
    assert!(err.is_connect());
    assert!(!err.is_timeout());
}
