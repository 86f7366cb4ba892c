//! HTTP probe endpoints
//!
//! | Route              | Passes | Fails              |
//! |--------------------|--------|--------------------|
//! | GET /healthz/started | 200  | 502                |
//! | GET /healthz/ready   | 200  | 503                |
//! | GET /healthz/live    | 200  | 503                |
//! | GET/POST /shutdown   | 200  | 500                |
//!
//! One request per connection; responses carry `Connection: close`.

use crate::probe::HealthProbes;
use crate::shutdown::{ShutdownOrchestrator, TransportHandle};
use bytes::BytesMut;
use parking_lot::Mutex;
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// Shared state for request handlers
pub struct ApiServer {
    probes: Arc<HealthProbes>,
    orchestrator: Arc<ShutdownOrchestrator>,
    /// Bound on the drain wait for a `/shutdown` request
    shutdown_timeout: Duration,
}

/// Running listener; stopping it ends the accept loop but lets in-flight
/// requests finish
pub struct ApiHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    connections: TaskTracker,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Response {
    status: u16,
    body: String,
}

impl Response {
    fn json(status: u16, body: serde_json::Value) -> Self {
        Response {
            status,
            body: body.to_string(),
        }
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            500 => "Internal Server Error",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            _ => "Unknown",
        }
    }

    fn encode(&self) -> Vec<u8> {
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.status,
            self.reason(),
            self.body.len(),
            self.body
        )
        .into_bytes()
    }
}

impl ApiServer {
    pub fn new(
        probes: Arc<HealthProbes>,
        orchestrator: Arc<ShutdownOrchestrator>,
        shutdown_timeout: Duration,
    ) -> Self {
        ApiServer {
            probes,
            orchestrator,
            shutdown_timeout,
        }
    }

    /// Bind `addr` and start accepting
    pub async fn start(self, addr: &str) -> std::io::Result<Arc<ApiHandle>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "API listening");

        let server = Arc::new(self);
        let cancel = CancellationToken::new();
        let connections = TaskTracker::new();

        let accept_task = {
            let cancel = cancel.clone();
            let connections = connections.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = listener.accept() => match result {
                            Ok((stream, peer)) => {
                                let server = server.clone();
                                connections.spawn(async move {
                                    if let Err(e) = server.handle_connection(stream).await {
                                        debug!(%peer, error = %e, "API connection error");
                                    }
                                });
                            }
                            Err(e) => warn!(error = %e, "API accept error"),
                        }
                    }
                }
                debug!("API accept loop stopped");
            })
        };

        Ok(Arc::new(ApiHandle {
            local_addr,
            cancel,
            connections,
            accept_task: Mutex::new(Some(accept_task)),
        }))
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> std::io::Result<()> {
        let mut buffer = BytesMut::with_capacity(1024);
        let mut read_buf = [0u8; 1024];

        let head = loop {
            if let Some(end) = find_head_end(&buffer) {
                break buffer.split_to(end);
            }
            if buffer.len() > MAX_REQUEST_HEAD {
                let response = Response::json(400, json!({"status": "error", "message": "request too large"}));
                stream.write_all(&response.encode()).await?;
                return Ok(());
            }
            let n = stream.read(&mut read_buf).await?;
            if n == 0 {
                return Ok(());
            }
            buffer.extend_from_slice(&read_buf[..n]);
        };

        let response = match parse_request_line(&head) {
            Some((method, path)) => self.route(method, path).await,
            None => Response::json(400, json!({"status": "error", "message": "malformed request"})),
        };

        stream.write_all(&response.encode()).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn route(&self, method: &str, path: &str) -> Response {
        match (method, path) {
            ("GET", "/healthz/started") => self.started().await,
            ("GET", "/healthz/ready") => self.ready().await,
            ("GET", "/healthz/live") => self.live().await,
            ("GET" | "POST", "/shutdown") => self.shutdown().await,
            (_, "/healthz/started" | "/healthz/ready" | "/healthz/live" | "/shutdown") => {
                Response::json(405, json!({"status": "error", "message": "method not allowed"}))
            }
            _ => Response::json(404, json!({"status": "error", "message": "not found"})),
        }
    }

    async fn started(&self) -> Response {
        match self.probes.startup().await {
            Ok(_) => Response::json(200, json!({"status": "ok", "message": "ok"})),
            Err(e) => {
                error!(error = %e, "startup probe failed");
                Response::json(502, json!({"status": "unhealthy", "message": e.to_string()}))
            }
        }
    }

    async fn ready(&self) -> Response {
        match self.probes.readiness().await {
            Ok(verdict) => Response::json(
                if verdict.passing { 200 } else { 503 },
                json!(verdict.result),
            ),
            Err(e) => {
                error!(error = %e, "readiness probe failed");
                Response::json(503, json!({"status": "error", "message": e.to_string()}))
            }
        }
    }

    async fn live(&self) -> Response {
        match self.probes.liveness().await {
            Ok(verdict) => Response::json(
                if verdict.passing { 200 } else { 503 },
                json!(verdict.result),
            ),
            Err(e) => {
                error!(error = %e, "liveness probe failed");
                Response::json(503, json!({"status": "error", "message": e.to_string()}))
            }
        }
    }

    /// Pre-stop hook. The drain wait is bounded so the hook cannot hold up
    /// pod termination.
    async fn shutdown(&self) -> Response {
        let cancel = CancellationToken::new();
        let timer = {
            let cancel = cancel.clone();
            let timeout = self.shutdown_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                cancel.cancel();
            })
        };

        let result = self.orchestrator.begin_shutdown(&cancel).await;
        timer.abort();

        match result {
            Ok(()) => Response::json(200, json!({"status": "ok", "message": "shutdown initiated"})),
            Err(e) => {
                error!(error = %e, "pre-stop shutdown failed");
                Response::json(500, json!({"status": "error", "message": "shutdown failed"}))
            }
        }
    }
}

impl ApiHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait up to `timeout` for in-flight requests, e.g. so a `/shutdown`
    /// caller gets its response before the process exits
    pub async fn wait_for_connections(&self, timeout: Duration) -> bool {
        self.connections.close();
        tokio::time::timeout(timeout, self.connections.wait())
            .await
            .is_ok()
    }
}

impl TransportHandle for ApiHandle {
    fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>> {
        Box::pin(async move {
            self.cancel.cancel();
            self.connections.close();
            let task = self.accept_task.lock().take();
            match task {
                Some(task) => task.await.map_err(|e| e.to_string()),
                None => Ok(()),
            }
        })
    }
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// `GET /path HTTP/1.1` -> (`GET`, `/path`); query strings are dropped
fn parse_request_line(head: &[u8]) -> Option<(&str, &str)> {
    let line_end = head.windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(&head[..line_end]).ok()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    if !parts.next()?.starts_with("HTTP/") {
        return None;
    }
    let path = target.split('?').next().unwrap_or(target);
    Some((method, path))
}
