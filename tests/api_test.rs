//! HTTP endpoint tests over a real loopback socket.

use proxysql_agent::admin::{AdminFault, SimulatedAdmin};
use proxysql_agent::api::{ApiHandle, ApiServer};
use proxysql_agent::config::ShutdownConfig;
use proxysql_agent::control::{ControlPlane, ShutdownPhase};
use proxysql_agent::probe::HealthProbes;
use proxysql_agent::shutdown::ShutdownOrchestrator;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

struct Fixture {
    admin: SimulatedAdmin,
    control: Arc<ControlPlane>,
    handle: Arc<ApiHandle>,
    _dir: TempDir,
}

async fn start() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let admin = SimulatedAdmin::with_placeholder(6032);
    let control = Arc::new(ControlPlane::new(Arc::new(admin.clone())));
    let settings = ShutdownConfig {
        draining_file: dir.path().join("draining"),
        ..ShutdownConfig::default()
    };
    let probes = Arc::new(HealthProbes::new(control.clone(), settings.draining_file.clone()));
    let orchestrator = Arc::new(ShutdownOrchestrator::new(control.clone(), settings));

    let handle = ApiServer::new(probes, orchestrator.clone(), Duration::from_secs(10))
        .start("127.0.0.1:0")
        .await
        .unwrap();
    orchestrator.register_transport(handle.clone());

    Fixture {
        admin,
        control,
        handle,
        _dir: dir,
    }
}

async fn request(addr: SocketAddr, method: &str, path: &str) -> (u16, serde_json::Value) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let req = format!("{} {} HTTP/1.1\r\nHost: localhost\r\n\r\n", method, path);
    stream.write_all(req.as_bytes()).await.unwrap();

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();

    let status = raw
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap();
    let body = raw.split("\r\n\r\n").nth(1).unwrap_or("null");
    (status, serde_json::from_str(body).unwrap())
}

#[tokio::test]
async fn test_probe_routes() {
    let f = start().await;
    let addr = f.handle.local_addr();
    f.admin.set_backends(3, 3, 0);

    let (status, body) = request(addr, "GET", "/healthz/started").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");

    let (status, body) = request(addr, "GET", "/healthz/ready").await;
    assert_eq!(status, 200);
    assert_eq!(body["probe"], "readiness");
    assert_eq!(body["backends"]["online"], 3);

    f.admin.set_backends(3, 0, 3);
    let (status, body) = request(addr, "GET", "/healthz/live").await;
    assert_eq!(status, 503);
    assert_eq!(body["status"], "unhealthy");
}

#[tokio::test]
async fn test_startup_failure_is_bad_gateway() {
    let f = start().await;
    f.admin.inject(AdminFault::FailPing);

    let (status, body) = request(f.handle.local_addr(), "GET", "/healthz/started").await;
    assert_eq!(status, 502);
    assert_eq!(body["status"], "unhealthy");
}

#[tokio::test]
async fn test_unknown_route_and_method() {
    let f = start().await;
    let addr = f.handle.local_addr();

    let (status, _) = request(addr, "GET", "/nope").await;
    assert_eq!(status, 404);

    let (status, _) = request(addr, "DELETE", "/healthz/ready").await;
    assert_eq!(status, 405);
}

#[tokio::test]
async fn test_draining_member_stays_live_but_not_ready() {
    let f = start().await;
    let addr = f.handle.local_addr();
    f.control.advance(ShutdownPhase::Draining);

    let (status, body) = request(addr, "GET", "/healthz/ready").await;
    assert_eq!(status, 503);
    assert_eq!(body["message"], "shutting down");

    let (status, body) = request(addr, "GET", "/healthz/live").await;
    assert_eq!(status, 200);
    assert_eq!(body["draining"], true);
}

#[tokio::test]
async fn test_shutdown_route_runs_sequence_and_stops_listener() {
    let f = start().await;
    let addr = f.handle.local_addr();

    let (status, body) = request(addr, "POST", "/shutdown").await;
    assert_eq!(status, 200);
    assert_eq!(body["message"], "shutdown initiated");

    assert_eq!(f.control.phase(), ShutdownPhase::Stopped);
    assert!(f.admin.is_paused());
    assert!(f.admin.is_shut_down());

    // Accept loop is gone
    let refused = tokio::time::timeout(Duration::from_secs(1), TcpStream::connect(addr)).await;
    assert!(!matches!(refused, Ok(Ok(_))));
}
