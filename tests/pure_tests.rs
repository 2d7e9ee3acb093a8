//! End-to-end tests for the pure proxy: host sniffing with carryover
//! replay, raw CONNECT tunneling, oversized-head rejection and shutdown.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use mproxy::{Error, PureProxy};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

async fn spawn_pure(proxy: &PureProxy) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let proxy = proxy.clone();
    tokio::spawn(async move {
        let _ = proxy.serve(listener).await;
    });
    addr
}

#[tokio::test]
async fn host_sniff_forwards_every_byte() {
    let (backend, captured) = common::spawn_capture().await;
    let request = format!("GET /path HTTP/1.1\r\nHost: {backend}\r\nX: y\r\n\r\nhello");

    let proxy = PureProxy::new();
    let addr = spawn_pure(&proxy).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(request.as_bytes()).await.unwrap();
    client.shutdown().await.unwrap();

    // The backend receives the request line, every header and the body
    // byte-for-byte, whether they arrived as carryover or via the copy.
    let captured = timeout(Duration::from_secs(5), captured)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(captured, request.into_bytes());
    proxy.close();
}

#[tokio::test]
async fn connect_opens_raw_tunnel() {
    let echo = common::spawn_echo().await;
    let proxy = PureProxy::new();
    let addr = spawn_pure(&proxy).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(format!("CONNECT {echo} HTTP/1.1\r\n\r\n").as_bytes())
        .await
        .unwrap();

    let mut established = [0u8; 19];
    client.read_exact(&mut established).await.unwrap();
    assert_eq!(&established, b"HTTP/1.0 200 OK\r\n\r\n");

    client.write_all(b"raw bytes").await.unwrap();
    let mut echoed = [0u8; 9];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"raw bytes");
    proxy.close();
}

#[tokio::test]
async fn oversized_head_gets_bad_gateway() {
    let proxy = PureProxy::new();
    let addr = spawn_pure(&proxy).await;

    let client = TcpStream::connect(addr).await.unwrap();
    let (mut reader, mut writer) = client.into_split();

    let writer_task = tokio::spawn(async move {
        if writer.write_all(b"GET / HTTP/1.1\r\n").await.is_err() {
            return;
        }
        let line = [b'A'; 4096];
        // Push well past the 1 MiB cap; the proxy closes on us eventually.
        for _ in 0..1024 {
            if writer.write_all(&line).await.is_err() {
                break;
            }
            if writer.write_all(b"\r\n").await.is_err() {
                break;
            }
        }
    });

    let mut response = Vec::new();
    let _ = timeout(Duration::from_secs(10), reader.read_to_end(&mut response)).await;
    assert!(
        response.starts_with(b"HTTP/1.1 502 Bad Gateway"),
        "got: {}",
        String::from_utf8_lossy(&response)
    );
    writer_task.await.unwrap();
    proxy.close();
}

#[tokio::test]
async fn close_terminates_active_connections() {
    let proxy = PureProxy::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serve_task = tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.serve(listener).await }
    });

    // Park a few connections in the head-reading state.
    let mut conns = Vec::new();
    for _ in 0..3 {
        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        conns.push(conn);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    proxy.close();

    let served = timeout(Duration::from_secs(2), serve_task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(served, Err(Error::ServerClosed)));

    // Every active connection's socket is closed within a bounded time.
    for mut conn in conns {
        let mut buf = [0u8; 64];
        let read = timeout(Duration::from_secs(2), conn.read(&mut buf))
            .await
            .expect("socket not closed after shutdown");
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    // Shut-down servers refuse to serve again.
    let again = proxy.listen_and_serve("127.0.0.1:0").await;
    assert!(matches!(again, Err(Error::ServerClosed)));
}

#[tokio::test]
async fn read_timeout_cuts_off_slow_clients() {
    let proxy = PureProxy::with_read_timeout(Duration::from_millis(100));
    let addr = spawn_pure(&proxy).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    // Never finish the request head.
    client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

    let mut response = Vec::new();
    let read = timeout(Duration::from_secs(5), client.read_to_end(&mut response)).await;
    assert!(read.is_ok(), "proxy kept the slow connection open");
    assert!(
        response.starts_with(b"HTTP/1.1 502 Bad Gateway"),
        "got: {}",
        String::from_utf8_lossy(&response)
    );
    proxy.close();
}

#[tokio::test]
async fn close_is_idempotent() {
    let proxy = PureProxy::new();
    let addr = spawn_pure(&proxy).await;
    let _ = TcpStream::connect(addr).await.unwrap();
    proxy.close();
    proxy.close();
    let again = proxy.listen_and_serve("127.0.0.1:0").await;
    assert!(matches!(again, Err(Error::ServerClosed)));
}
