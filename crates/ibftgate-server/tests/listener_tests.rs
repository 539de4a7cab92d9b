//! End-to-end listener tests over loopback
//!
//! Database pools are lazy and point at a closed port; the reference processor
//! only selects a pool, it never connects.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use ibftgate_core::{DatabaseConfig, ListenerConfig};
use ibftgate_pool::PoolManager;
use ibftgate_server::{Listener, ServerState, ShutdownCause, ShutdownReport};
use ibftgate_transport::{ProcessingError, RequestContext, RequestProcessor};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Failing;

#[async_trait]
impl RequestProcessor for Failing {
    async fn process(&self, payload: Bytes, _ctx: &RequestContext) -> Result<Bytes, ProcessingError> {
        if payload.as_ref() == b"ok" {
            return Ok(Bytes::from_static(b"fine"));
        }
        Err(ProcessingError::backend("switch unreachable"))
    }
}

/// Ignores cancellation entirely
#[derive(Debug)]
struct Stuck;

#[async_trait]
impl RequestProcessor for Stuck {
    async fn process(&self, _payload: Bytes, _ctx: &RequestContext) -> Result<Bytes, ProcessingError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Bytes::from_static(b"late"))
    }
}

fn listener_config() -> ListenerConfig {
    ListenerConfig {
        bind_address: "127.0.0.1".to_string(),
        port: 0,
        stats_interval_secs: 0,
        drain_grace_ms: 200,
        drain_window_ms: 2_000,
        ..ListenerConfig::default()
    }
}

fn pools(n: usize) -> Arc<PoolManager> {
    let manager = PoolManager::new(DatabaseConfig {
        connection_string: "postgres://ibft@127.0.0.1:1/ibft".to_string(),
        number_of_pools: n,
        min_pool_size: 0,
        max_pool_size: 2,
        command_timeout_secs: 1,
        ..DatabaseConfig::default()
    });
    assert_ok!(manager.initialize());
    Arc::new(manager)
}

struct Running {
    addr: std::net::SocketAddr,
    token: CancellationToken,
    task: JoinHandle<ShutdownReport>,
}

impl Running {
    async fn stop(self) -> ShutdownReport {
        self.token.cancel();
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("shutdown did not finish")
            .unwrap()
    }
}

fn run(listener: Listener) -> Running {
    let addr = listener.local_addr();
    let token = CancellationToken::new();
    let task = tokio::spawn(listener.run(token.clone()));
    Running { addr, token, task }
}

async fn exchange(client: &mut TcpStream, request: &[u8]) -> Vec<u8> {
    assert_ok!(client.write_all(request).await);
    let mut buf = vec![0u8; 4096];
    let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("no response")
        .unwrap();
    assert!(n > 0, "connection closed instead of responding");
    buf.truncate(n);
    buf
}

fn response_code(body: &[u8]) -> String {
    let value: serde_json::Value = serde_json::from_slice(body).unwrap();
    value["responseCode"].as_str().unwrap().to_string()
}

/// Whether the server closed the connection within `within`
async fn closed_by_server(client: &mut TcpStream, within: Duration) -> bool {
    let mut buf = [0u8; 64];
    match tokio::time::timeout(within, client.read(&mut buf)).await {
        Ok(Ok(0) | Err(_)) => true,
        Ok(Ok(_)) | Err(_) => false,
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_admission_ceiling_rejects_extra_connection() {
    let config = ListenerConfig {
        max_connections: 2,
        ..listener_config()
    };
    let listener = Listener::bind(config, pools(2)).await.unwrap();
    let metrics = listener.metrics();
    let registry = listener.registry();
    let server = run(listener);

    let mut a = TcpStream::connect(server.addr).await.unwrap();
    let mut b = TcpStream::connect(server.addr).await.unwrap();
    assert_eq!(response_code(&exchange(&mut a, b"MT103 A").await), "00");
    assert_eq!(response_code(&exchange(&mut b, b"MT103 B").await), "00");

    let mut c = TcpStream::connect(server.addr).await.unwrap();
    assert!(closed_by_server(&mut c, Duration::from_secs(2)).await);
    eventually("rejection", || metrics.connections_rejected() == 1).await;

    // freeing a slot admits the next client
    drop(a);
    eventually("slot release", || registry.len() == 1).await;
    let mut d = TcpStream::connect(server.addr).await.unwrap();
    assert_eq!(response_code(&exchange(&mut d, b"MT103 D").await), "00");

    let report = server.stop().await;
    assert_eq!(report.accepted, 3);
    assert_eq!(report.rejected, 1);
    assert_eq!(report.cause, ShutdownCause::Requested);
}

#[tokio::test]
async fn test_round_robin_across_requests() {
    let listener = Listener::bind(listener_config(), pools(2)).await.unwrap();
    let server = run(listener);

    let mut client = TcpStream::connect(server.addr).await.unwrap();
    let mut via = Vec::new();
    for _ in 0..4 {
        let body = exchange(&mut client, b"MT202").await;
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        via.push(value["responseMessage"].as_str().unwrap().to_string());
    }
    assert_eq!(
        via,
        vec![
            "Acknowledged 5 bytes via pool_1",
            "Acknowledged 5 bytes via pool_2",
            "Acknowledged 5 bytes via pool_1",
            "Acknowledged 5 bytes via pool_2",
        ]
    );
    server.stop().await;
}

#[tokio::test]
async fn test_processor_failure_keeps_connection_open() {
    let listener = Listener::builder(listener_config(), pools(1))
        .processor(Arc::new(Failing))
        .bind()
        .await
        .unwrap();
    let metrics = listener.metrics();
    let server = run(listener);

    let mut client = TcpStream::connect(server.addr).await.unwrap();
    assert_eq!(response_code(&exchange(&mut client, b"MT103").await), "91");
    assert_eq!(exchange(&mut client, b"ok").await, b"fine".to_vec());

    assert_eq!(metrics.exchange.requests_failed.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.exchange.requests_successful.load(Ordering::Relaxed), 1);
    server.stop().await;
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let config = ListenerConfig {
        idle_timeout_ms: 200,
        ..listener_config()
    };
    let listener = Listener::bind(config, pools(1)).await.unwrap();
    let metrics = listener.metrics();
    let server = run(listener);

    let mut client = TcpStream::connect(server.addr).await.unwrap();
    assert!(closed_by_server(&mut client, Duration::from_secs(3)).await);
    eventually("idle close", || {
        metrics.connections_idle_closed.load(Ordering::Relaxed) == 1
    })
    .await;
    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_drains_idle_connections() {
    let listener = Listener::bind(listener_config(), pools(3)).await.unwrap();
    let handle = listener.shutdown_handle();
    let server = run(listener);

    let mut a = TcpStream::connect(server.addr).await.unwrap();
    let mut b = TcpStream::connect(server.addr).await.unwrap();
    exchange(&mut a, b"MT103").await;
    exchange(&mut b, b"MT103").await;

    handle.shutdown();
    let report = tokio::time::timeout(Duration::from_secs(5), server.task)
        .await
        .unwrap()
        .unwrap();

    assert!(report.is_clean());
    assert_eq!(report.draining, 2);
    assert_eq!(report.drained, 2);
    assert_eq!(report.pools_cleared, 3);
    assert_eq!(handle.state().await, ServerState::Stopped);
    assert!(closed_by_server(&mut a, Duration::from_secs(1)).await);
    assert!(closed_by_server(&mut b, Duration::from_secs(1)).await);
    assert!(TcpStream::connect(server.addr).await.is_err());
}

#[tokio::test]
async fn test_shutdown_is_bounded_by_drain_window() {
    let config = ListenerConfig {
        drain_grace_ms: 10_000,
        drain_window_ms: 300,
        ..listener_config()
    };
    let listener = Listener::builder(config, pools(1))
        .processor(Arc::new(Stuck))
        .bind()
        .await
        .unwrap();
    let registry = listener.registry();
    let server = run(listener);

    let mut client = TcpStream::connect(server.addr).await.unwrap();
    client.write_all(b"MT103").await.unwrap();
    eventually("request in flight", || {
        registry
            .snapshot()
            .iter()
            .any(|c| c.state == ibftgate_transport::HandlerState::Processing)
    })
    .await;

    let started = Instant::now();
    let report = server.stop().await;
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(report.forced, 1);
    assert_eq!(report.drained, 0);
    assert!(!report.is_clean());
    assert!(registry.is_empty());
}
