//! src/tunnel/listener.rs
//!
//! The upstream tunnel listener: accepts inbound agent connections,
//! completes the WebSocket handshake, and handles listener registration
//! in both wire forms the spec allows — a legacy path-addressed form
//! (`/piko/v1/listener/<endpointID>?token=...`) and a newer RPC form
//! (`/piko/v1/upstream/ws`, with endpoint ID and token in a JSON body sent
//! over the registration stream). A registered session is handed to the
//! `UpstreamManager` and removed again once it closes.

use super::auth::Validator;
use super::frame::StreamType;
use super::{Session, UpstreamStream};
use crate::config::TunnelConfig;
use crate::upstream::UpstreamManager;
use http::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;

const LEGACY_PATH_PREFIX: &str = "/piko/v1/listener/";
const RPC_PATH: &str = "/piko/v1/upstream/ws";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls handshake failed: {0}")]
    Tls(std::io::Error),
    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid listener auth configuration: {0}")]
    AuthConfig(#[from] super::auth::AuthError),
}

#[derive(Debug, Deserialize)]
struct ListenRequest {
    endpoint_id: String,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct ListenResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retryable: Option<bool>,
}

impl ListenResponse {
    fn ok() -> Self {
        Self { ok: true, error: None, retryable: None }
    }

    fn rejected(message: impl Into<String>, retryable: bool) -> Self {
        Self { ok: false, error: Some(message.into()), retryable: Some(retryable) }
    }
}

/// Runs the upstream tunnel accept loop until `shutdown` fires.
pub async fn run(
    bind_addr: std::net::SocketAddr,
    tls_acceptor: Option<TlsAcceptor>,
    config: TunnelConfig,
    upstream: UpstreamManager,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let listener = TcpListener::bind(bind_addr).await?;
    let validator = Arc::new(Validator::from_config(config.auth_algorithm.as_deref(), config.auth_secret.as_deref())?);
    tracing::info!(%bind_addr, "upstream tunnel listener started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept upstream connection");
                        continue;
                    }
                };
                let validator = validator.clone();
                let upstream = upstream.clone();
                let tls_acceptor = tls_acceptor.clone();
                let heartbeat_interval = config.heartbeat_interval();
                let heartbeat_timeout = config.heartbeat_timeout();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, tls_acceptor, validator, upstream, heartbeat_interval, heartbeat_timeout).await {
                        tracing::warn!(%peer_addr, error = %e, "upstream tunnel connection failed");
                    }
                });
            }
        }
    }
    tracing::info!("upstream tunnel listener stopped");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    tls_acceptor: Option<TlsAcceptor>,
    validator: Arc<Validator>,
    upstream: UpstreamManager,
    heartbeat_interval: std::time::Duration,
    heartbeat_timeout: std::time::Duration,
) -> Result<(), Error> {
    let transport = match tls_acceptor {
        Some(acceptor) => UpstreamStream::Tls(Box::new(acceptor.accept(stream).await.map_err(Error::Tls)?)),
        None => UpstreamStream::Plain(stream),
    };

    let captured: Arc<StdMutex<Option<(String, Option<String>, Option<String>)>>> = Arc::new(StdMutex::new(None));
    let captured_write = captured.clone();
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let uri = req.uri();
        let auth_header = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        *captured_write.lock().unwrap() = Some((uri.path().to_string(), uri.query().map(str::to_string), auth_header));
        Ok(resp)
    };
    let ws = tokio_tungstenite::accept_hdr_async(transport, callback).await?;
    let (path, query, auth_header) = captured.lock().unwrap().clone().unwrap_or_default();

    let session = Session::spawn(ws, heartbeat_interval, heartbeat_timeout);

    let Some(registration) = session.accept().await else {
        return Ok(());
    };
    if registration.stream_type != StreamType::ListenRegister {
        registration.close().await;
        return Ok(());
    }

    let request = match parse_listen_request(&path, query.as_deref(), auth_header.as_deref(), &registration).await {
        Some(req) => req,
        None => {
            let body = serde_json::to_vec(&ListenResponse::rejected("malformed listener registration", false)).unwrap_or_default();
            let _ = registration.write(&body).await;
            return Ok(());
        }
    };

    if let Err(e) = validator.validate(request.token.as_deref(), &request.endpoint_id) {
        tracing::info!(endpoint_id = %request.endpoint_id, error = %e, "listener registration rejected");
        let body = serde_json::to_vec(&ListenResponse::rejected(e.to_string(), e.is_retryable())).unwrap_or_default();
        let _ = registration.write(&body).await;
        return Ok(());
    }

    let body = serde_json::to_vec(&ListenResponse::ok()).unwrap_or_default();
    let _ = registration.write(&body).await;

    tracing::info!(endpoint_id = %request.endpoint_id, "listener registered");
    upstream.accept(&request.endpoint_id, session.clone()).await;

    while !session.is_closed() {
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }
    upstream.remove(&request.endpoint_id, &session).await;
    tracing::info!(endpoint_id = %request.endpoint_id, "listener session closed");
    Ok(())
}

/// Parses a `ListenRequest` out of either wire form: the legacy form
/// carries the endpoint ID in the path and the token in a query string or,
/// failing that, an `Authorization: Bearer <token>` header; the RPC form
/// expects a JSON body on the registration stream.
async fn parse_listen_request(
    path: &str,
    query: Option<&str>,
    auth_header: Option<&str>,
    registration: &super::LogicalStream,
) -> Option<ListenRequest> {
    if let Some(endpoint_id) = path.strip_prefix(LEGACY_PATH_PREFIX) {
        let token = query
            .and_then(|q| {
                q.split('&').find_map(|pair| {
                    let (k, v) = pair.split_once('=')?;
                    (k == "token").then(|| v.to_string())
                })
            })
            .or_else(|| auth_header.and_then(|h| h.strip_prefix("Bearer ")).map(str::to_string));
        return Some(ListenRequest { endpoint_id: endpoint_id.to_string(), token });
    }

    if path == RPC_PATH {
        let body = registration.read().await?;
        return serde_json::from_slice(&body).ok();
    }

    None
}
