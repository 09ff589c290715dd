//! tests/common/harness.rs
//!
//! Test building blocks: spawning a full `App` on ephemeral ports, a
//! minimal tunnel-client "agent" that registers an endpoint and serves
//! HTTP/TCP traffic back, and small HTTP helpers for driving the proxy
//! port without pulling in a full HTTP client crate.

use anyhow::{bail, Context, Result};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use piko::tunnel::frame::StreamType;
use piko::tunnel::Session;
use piko::{App, Config};
use std::convert::Infallible;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;

/// A running `App` bound to ephemeral ports, driven to completion in a
/// background task.
pub struct TestNode {
    pub config: Config,
    pub shutdown: CancellationToken,
}

impl TestNode {
    pub async fn spawn(join_addrs: Vec<String>) -> Result<Self> {
        let mut config = Config::default();
        config.proxy_addr = ephemeral_addr()?;
        config.upstream_addr = ephemeral_addr()?;
        config.gossip_addr = ephemeral_addr()?;
        config.join_addrs = join_addrs;
        config.gossip.interval_ms = 100;
        config.gossip.compaction_tombstone_threshold = 10;
        config.rebalance.floor = 0;
        config.grace_period_secs = 0;
        config.node_expiry_secs = 5;

        let app = App::new(config.clone()).context("failed to construct App")?;
        let shutdown = app.shutdown_handle();
        tokio::spawn(async move {
            if let Err(e) = app.run().await {
                tracing::warn!(error = %e, "test node exited with error");
            }
        });
        // Give the gossip/tunnel/proxy listeners time to bind.
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(Self { config, shutdown })
    }

    pub fn join_addr(&self) -> String {
        self.config.gossip_addr.to_string()
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn ephemeral_addr() -> Result<SocketAddr> {
    let listener = StdTcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?)
}

/// A minimal tunnel client standing in for an upstream agent: registers an
/// endpoint over the RPC wire form and serves `/hello` -> `"world"` plus a
/// byte-for-byte echo for anything else, on both HTTP and TCP logical
/// streams, until the underlying session closes.
pub struct TestAgent {
    pub session: Arc<Session>,
}

impl TestAgent {
    pub async fn connect(upstream_addr: SocketAddr, endpoint_id: &str, token: Option<&str>) -> Result<Arc<Self>> {
        let url = format!("ws://{upstream_addr}/piko/v1/upstream/ws");
        let (ws, _) = connect_async(url).await.context("agent websocket connect failed")?;
        let session = Session::spawn(ws, Duration::from_secs(5), Duration::from_secs(30));

        let registration = session.open(StreamType::ListenRegister).await?;
        let body = serde_json::to_vec(&serde_json::json!({ "endpoint_id": endpoint_id, "token": token }))?;
        registration.write(&body).await?;
        let resp = registration.read().await.context("no listener registration response")?;
        let resp: serde_json::Value = serde_json::from_slice(&resp)?;
        if resp.get("ok") != Some(&serde_json::Value::Bool(true)) {
            bail!("listener registration rejected: {resp}");
        }

        let agent = Arc::new(Self { session });
        agent.clone().spawn_server_loop();
        Ok(agent)
    }

    /// Simulates an upstream disconnecting mid-session.
    pub async fn disconnect(&self) {
        self.session.close().await;
    }

    fn spawn_server_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            while let Some(logical) = self.session.accept().await {
                match logical.stream_type {
                    StreamType::HttpProxy => {
                        tokio::spawn(serve_http(logical));
                    }
                    StreamType::TcpProxy => {
                        tokio::spawn(serve_echo_tcp(logical));
                    }
                    StreamType::ListenRegister => {}
                }
            }
        });
    }
}

async fn serve_http(logical: piko::tunnel::LogicalStream) {
    let io = TokioIo::new(logical.into_io());
    let service = service_fn(|req: Request<Incoming>| async move {
        let path = req.uri().path().to_string();
        if path == "/hello" {
            Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"world"))))
        } else {
            let body = req.into_body().collect().await.map(|c| c.to_bytes()).unwrap_or_default();
            Ok(Response::new(Full::new(body)))
        }
    });
    let _ = hyper::server::conn::http1::Builder::new().serve_connection(io, service).await;
}

async fn serve_echo_tcp(logical: piko::tunnel::LogicalStream) {
    while let Some(chunk) = logical.read().await {
        if logical.write(&chunk).await.is_err() {
            break;
        }
    }
}

/// Issues a single HTTP/1 request against `addr` and returns the status
/// and buffered response body.
pub async fn http_request(addr: SocketAddr, req: Request<Full<Bytes>>) -> Result<(StatusCode, Bytes)> {
    let stream = TcpStream::connect(addr).await.context("failed to dial proxy port")?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
    tokio::spawn(async move {
        let _ = conn.await;
    });
    let resp = sender.send_request(req).await?;
    let status = resp.status();
    let body = resp.into_body().collect().await?.to_bytes();
    Ok((status, body))
}
