//! Scenario tests (S1-S6) run against in-process loopback mock remotes,
//! exercising the full accept -> sniff -> tunnel -> rebind pipeline.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use proxy_pool::pool::{BindingTable, RotationOrchestrator};
use proxy_pool::registry::RemoteRegistry;
use proxy_pool::statistic::Statistics;
use proxy_pool::{listener, PoolError};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Spin up the binding table, orchestrator, and one listener task for `port`,
/// warming up every port from `registry`.
async fn start_pool(
    port: u16,
    registry: RemoteRegistry,
) -> (Arc<BindingTable>, Arc<Statistics>, CancellationToken) {
    let table = Arc::new(BindingTable::new(port, 1, Arc::new(registry)));
    let shutdown = CancellationToken::new();
    let orchestrator = Arc::new(RotationOrchestrator::new(table.clone(), shutdown.clone()));
    let stats = Arc::new(Statistics::new());
    orchestrator.warmup(1);

    let tcp_listener = listener::bind_port(port).await.unwrap();
    let t = table.clone();
    let o = orchestrator.clone();
    let s = stats.clone();
    let sd = shutdown.clone();
    tokio::spawn(async move {
        let _ = listener::serve(port, tcp_listener, t, o, s, sd).await;
    });

    // warmup dispatches the rebind to a background worker; give it a moment.
    wait_until(|| table.active_ready_ports() >= 1, Duration::from_secs(1)).await;

    (table, stats, shutdown)
}

async fn wait_until<F: Fn() -> bool>(condition: F, deadline: Duration) {
    let start = tokio::time::Instant::now();
    while !condition() {
        if start.elapsed() > deadline {
            panic!("condition did not become true within {:?}", deadline);
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// S1: SOCKS5 happy path against a single socks5 remote.
#[tokio::test]
async fn s1_socks5_happy_path() {
    let remote_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = remote_listener.local_addr().unwrap();
    let remote_task = tokio::spawn(async move {
        let (mut s, _) = remote_listener.accept().await.unwrap();
        let mut greeting = [0u8; 4];
        s.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [0x05, 0x02, 0x00, 0x02]);
        s.write_all(&[0x05, 0x02]).await.unwrap();

        let mut sub_header = [0u8; 2];
        s.read_exact(&mut sub_header).await.unwrap();
        let mut user = vec![0u8; sub_header[1] as usize];
        s.read_exact(&mut user).await.unwrap();
        let mut plen = [0u8; 1];
        s.read_exact(&mut plen).await.unwrap();
        let mut pass = vec![0u8; plen[0] as usize];
        s.read_exact(&mut pass).await.unwrap();
        assert_eq!(user, b"u");
        assert_eq!(pass, b"p");
        s.write_all(&[0x01, 0x00]).await.unwrap();

        let mut connect = [0u8; 3 + 1 + 1 + 11 + 2];
        s.read_exact(&mut connect).await.unwrap();
        assert_eq!(&connect[0..3], &[0x05, 0x01, 0x00]);
        assert_eq!(&connect[4..5 + 11], b"\x0bexample.com");
        assert_eq!(&connect[connect.len() - 2..], &[0x00, 0x50]);
        s.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        let mut echo = [0u8; 5];
        s.read_exact(&mut echo).await.unwrap();
        s.write_all(&echo).await.unwrap();
    });

    let registry_text = format!("{} {} u p socks5\n", remote_addr.ip(), remote_addr.port());
    let registry = RemoteRegistry::from_str(&registry_text).unwrap();
    let (table, _stats, shutdown) = start_pool(19201, registry).await;

    let mut client = TcpStream::connect(("127.0.0.1", 19201)).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();
    assert_eq!(method_reply, [0x05, 0x00]);

    let mut connect_req = vec![0x05, 0x01, 0x00, 0x03, 11];
    connect_req.extend_from_slice(b"example.com");
    connect_req.extend_from_slice(&80u16.to_be_bytes());
    client.write_all(&connect_req).await.unwrap();
    let mut connect_reply = [0u8; 10];
    client.read_exact(&mut connect_reply).await.unwrap();
    assert_eq!(connect_reply[1], 0x00);

    client.write_all(b"hello").await.unwrap();
    let mut echo = [0u8; 5];
    client.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"hello");
    drop(client);

    remote_task.await.unwrap();
    wait_until(|| table.active_ready_ports() >= 1, Duration::from_secs(1)).await;
    shutdown.cancel();
}

/// S2: HTTP CONNECT against a basic-auth HTTP remote.
#[tokio::test]
async fn s2_http_connect() {
    let remote_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = remote_listener.local_addr().unwrap();
    let remote_task = tokio::spawn(async move {
        let (mut s, _) = remote_listener.accept().await.unwrap();
        let mut buf = vec![0u8; 1024];
        let n = s.read(&mut buf).await.unwrap();
        let request = String::from_utf8_lossy(&buf[..n]).to_string();
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1"));
        let expected_auth = format!("Basic {}", BASE64.encode(b"u:p"));
        assert!(request.contains(&expected_auth));
        s.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await
            .unwrap();

        let mut echo = [0u8; 5];
        s.read_exact(&mut echo).await.unwrap();
        s.write_all(&echo).await.unwrap();
    });

    let registry_text = format!("{} {} u p http\n", remote_addr.ip(), remote_addr.port());
    let registry = RemoteRegistry::from_str(&registry_text).unwrap();
    let (table, _stats, shutdown) = start_pool(19202, registry).await;

    let mut client = TcpStream::connect(("127.0.0.1", 19202)).await.unwrap();
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();

    let mut buf = vec![0u8; 1024];
    let n = client.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200"));

    client.write_all(b"hello").await.unwrap();
    let mut echo = [0u8; 5];
    client.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"hello");
    drop(client);

    remote_task.await.unwrap();
    let _ = table;
    shutdown.cancel();
}

/// S3: a remote that refuses every connection is marked known-bad and the
/// port rebinds to the next remote in the LRU queue.
#[tokio::test]
async fn s3_remote_handshake_failure_marks_remote_bad() {
    let dead_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead_listener.local_addr().unwrap();
    drop(dead_listener); // nobody is listening; connect will be refused

    let good_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let good_addr = good_listener.local_addr().unwrap();
    let good_task = tokio::spawn(async move {
        let (mut s, _) = good_listener.accept().await.unwrap();
        let mut greeting = [0u8; 4];
        s.read_exact(&mut greeting).await.unwrap();
        s.write_all(&[0x05, 0x00]).await.unwrap();
        let mut connect = [0u8; 3 + 1 + 1 + 11 + 2];
        s.read_exact(&mut connect).await.unwrap();
        s.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
    });

    let registry_text = format!(
        "{} {} - - socks5\n{} {} - - socks5\n",
        dead_addr.ip(),
        dead_addr.port(),
        good_addr.ip(),
        good_addr.port()
    );
    let registry = RemoteRegistry::from_str(&registry_text).unwrap();
    let (table, stats, shutdown) = start_pool(19203, registry).await;

    // First client hits the dead remote (LRU head = index 0) and fails.
    let mut client = TcpStream::connect(("127.0.0.1", 19203)).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();

    let mut connect_req = vec![0x05, 0x01, 0x00, 0x03, 11];
    connect_req.extend_from_slice(b"example.com");
    connect_req.extend_from_slice(&80u16.to_be_bytes());
    client.write_all(&connect_req).await.unwrap();
    let mut connect_reply = [0u8; 10];
    client.read_exact(&mut connect_reply).await.unwrap();
    assert_ne!(connect_reply[1], 0x00); // general failure reply
    drop(client);

    wait_until(|| table.known_bad_remotes() >= 1, Duration::from_secs(2)).await;
    wait_until(|| table.active_ready_ports() >= 1, Duration::from_secs(2)).await;

    // Second client must now be served by the good remote.
    let mut client = TcpStream::connect(("127.0.0.1", 19203)).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();
    assert_eq!(method_reply, [0x05, 0x00]);
    client.write_all(&connect_req).await.unwrap();
    let mut connect_reply = [0u8; 10];
    client.read_exact(&mut connect_reply).await.unwrap();
    assert_eq!(connect_reply[1], 0x00);
    drop(client);

    good_task.await.unwrap();
    assert_eq!(table.known_bad_remotes(), 1);
    assert!(stats.snapshot(&table).tunnels_failed_remote >= 1);
    shutdown.cancel();
}

/// S4: one-shot — a second reservation before any client connects must
/// never return the same (port, generation) pair.
#[tokio::test]
async fn s4_one_shot_reservation() {
    let registry = RemoteRegistry::from_str("127.0.0.1 1 - - socks5\n127.0.0.1 2 - - socks5\n").unwrap();
    let table = Arc::new(BindingTable::new(20000, 2, Arc::new(registry)));
    table.rebind(20000);
    table.rebind(20001);

    let (port_a, gen_a) = table.reserve_ready_port().unwrap();
    let (port_b, gen_b) = table.reserve_ready_port().unwrap();
    assert_ne!((port_a, gen_a), (port_b, gen_b));

    match table.reserve_ready_port() {
        Err(PoolError::NoReady) => {}
        other => panic!("expected NoReady, got {:?}", other),
    }
}

/// S5: protocol sniff correctly classifies or rejects the connection based
/// on the first byte, without ever hanging.
#[tokio::test]
async fn s5_protocol_sniff_rejects_socks4_and_bare_origin_form() {
    let registry = RemoteRegistry::from_str("127.0.0.1 1 - - socks5\n").unwrap();
    let (_table, _stats, shutdown) = start_pool(19205, registry).await;

    // SOCKS4 (first byte 0x04) must be closed immediately.
    let mut client = TcpStream::connect(("127.0.0.1", 19205)).await.unwrap();
    client.write_all(&[0x04, 0x01, 0, 80]).await.unwrap();
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "socks4 connection should be closed, not answered");
    shutdown.cancel();

    let registry = RemoteRegistry::from_str("127.0.0.1 1 - - socks5\n").unwrap();
    let (_table, _stats, shutdown) = start_pool(19206, registry).await;

    // Origin-form HTTP (no absolute URI) is rejected by the handler, not hung.
    let mut client = TcpStream::connect(("127.0.0.1", 19206)).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.0\r\n\r\n")
        .await
        .unwrap();
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "bare origin-form request should be closed, not answered");
    shutdown.cancel();
}

/// S6: exhaustion — once every port is InUse, `acquire` reports `NoReady`
/// until a completed binding rebinds.
#[tokio::test]
async fn s6_exhaustion_then_recovery() {
    let registry = RemoteRegistry::from_str("127.0.0.1 1 - - socks5\n127.0.0.1 2 - - socks5\n").unwrap();
    let table = Arc::new(BindingTable::new(20100, 2, Arc::new(registry)));
    table.rebind(20100);
    table.rebind(20101);

    let (_p1, g1) = table.reserve_ready_port().unwrap();
    let (_p2, _g2) = table.reserve_ready_port().unwrap();
    assert!(matches!(table.reserve_ready_port(), Err(PoolError::NoReady)));

    table.complete(20100, g1, proxy_pool::pool::Outcome::ClientDone);
    table.rebind(20100);

    let (port, _gen) = table.reserve_ready_port().unwrap();
    assert_eq!(port, 20100);
}
