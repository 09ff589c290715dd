//! src/router/http.rs
//!
//! Handles every downstream HTTP request: resolve the endpoint ID, then
//! either proxy it over a local tunnel session or forward it once to a
//! remote node that holds one.

use super::client::UpstreamResponse;
use super::{already_forwarded, client, resolve_endpoint_id, Error, RouterState, FORWARD_HEADER};
use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use http::header::UPGRADE;
use http::HeaderMap;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use rand::seq::SliceRandom;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;

const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

pub async fn handle(State(state): State<RouterState>, req: Request) -> Response {
    match handle_inner(state, req).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

async fn handle_inner(state: RouterState, mut req: Request) -> Result<Response, Error> {
    let endpoint_id = resolve_endpoint_id(req.headers()).ok_or(Error::MissingEndpointId)?;
    // A WebSocket upgrade's lifetime isn't bounded by the request timeout
    // below, so take ownership of the downstream's upgrade future before
    // it's lost to `into_parts`.
    let on_upgrade = is_websocket_upgrade(req.headers()).then(|| hyper::upgrade::on(&mut req));

    let (mut parts, body) = req.into_parts();
    let bytes = to_bytes(body, MAX_BODY_BYTES).await.map_err(|_| Error::UpstreamUnreachable)?;

    if let Some(session) = state.upstream.pick_local(&endpoint_id).await {
        let logical = session
            .open(crate::tunnel::frame::StreamType::HttpProxy)
            .await
            .map_err(|_| Error::UpstreamUnreachable)?;
        let io = logical.into_io();
        let req = http::Request::from_parts(parts, Full::<Bytes>::from(bytes));
        return proxy_request(state.config.request_timeout_ms, io, req, on_upgrade).await;
    }

    if already_forwarded(&parts.headers) {
        return Err(Error::NoUpstreams);
    }

    let candidates = state.registry.lookup_endpoint(&endpoint_id).await;
    let chosen = candidates
        .iter()
        .filter_map(|n| n.proxy_addr)
        .collect::<Vec<_>>()
        .choose(&mut rand::thread_rng())
        .copied()
        .ok_or(Error::NoUpstreams)?;

    parts.headers.insert(FORWARD_HEADER, "true".parse().unwrap());
    let tcp = TcpStream::connect(chosen).await.map_err(|_| Error::UpstreamUnreachable)?;
    let req = http::Request::from_parts(parts, Full::<Bytes>::from(bytes));
    proxy_request(state.config.request_timeout_ms, tcp, req, on_upgrade).await
}

/// Sends `req` upstream over `io`. A non-upgrade request is buffered and
/// bounded by `timeout_ms` as usual; a WebSocket upgrade instead runs
/// unbounded and, once the upstream answers 101, bridges the two raw byte
/// streams until either side closes.
async fn proxy_request<T>(
    timeout_ms: u64,
    io: T,
    req: http::Request<Full<Bytes>>,
    on_upgrade: Option<hyper::upgrade::OnUpgrade>,
) -> Result<Response, Error>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let Some(on_upgrade) = on_upgrade else {
        let resp = with_timeout(timeout_ms, client::send_request(io, req)).await?;
        return Ok(client::buffer_body(resp).await?.into_response());
    };

    match client::send_maybe_upgrade(io, req).await? {
        UpstreamResponse::Buffered(resp) => Ok(resp.into_response()),
        UpstreamResponse::Upgraded { response_parts, upstream_io } => {
            tokio::spawn(async move {
                let downstream_io = match on_upgrade.await {
                    Ok(upgraded) => upgraded,
                    Err(e) => {
                        tracing::debug!(error = %e, "downstream never completed its half of the upgrade");
                        return;
                    }
                };
                let mut downstream_io = TokioIo::new(downstream_io);
                let mut upstream_io = TokioIo::new(upstream_io);
                if let Err(e) = copy_bidirectional(&mut downstream_io, &mut upstream_io).await {
                    tracing::debug!(error = %e, "websocket upgrade proxy connection ended");
                }
            });
            Ok(http::Response::from_parts(response_parts, axum::body::Body::empty()).into_response())
        }
    }
}

async fn with_timeout<T>(timeout_ms: u64, fut: impl std::future::Future<Output = Result<T, Error>>) -> Result<T, Error> {
    match tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::UpstreamTimeout),
    }
}
