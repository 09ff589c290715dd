//! src/router/client.rs
//!
//! Issues a single HTTP/1 request over a freshly dialed transport — either
//! a logical tunnel stream or a plain TCP connection to a remote node's
//! proxy port — and returns the response. Deliberately does not pool or
//! reuse connections: logical streams are cheap to open and each carries
//! exactly one request, per spec.

use http::{Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};

use super::Error;

pub async fn send_request<T>(io: T, req: Request<Full<Bytes>>) -> Result<http::Response<Incoming>, Error>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(io);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|_| Error::UpstreamUnreachable)?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "upstream connection task ended");
        }
    });

    sender.send_request(req).await.map_err(|_| Error::UpstreamUnreachable)
}

/// Buffers a response body to bytes, for forwarding back through axum.
pub async fn buffer_body(resp: http::Response<Incoming>) -> Result<http::Response<axum::body::Body>, Error> {
    let (parts, body) = resp.into_parts();
    let bytes = body.collect().await.map_err(|_| Error::UpstreamUnreachable)?.to_bytes();
    Ok(http::Response::from_parts(parts, axum::body::Body::from(bytes)))
}

/// The outcome of `send_maybe_upgrade`: either an ordinary response body
/// we can buffer and forward, or an upstream that switched protocols and
/// handed back a raw byte stream that must be bridged, not parsed as HTTP.
pub enum UpstreamResponse {
    Buffered(http::Response<axum::body::Body>),
    Upgraded { response_parts: http::response::Parts, upstream_io: Upgraded },
}

/// Sends a request that may carry `Upgrade: websocket`. If the upstream
/// answers with 101 Switching Protocols, takes ownership of its upgraded
/// connection instead of trying to read an HTTP body from it.
pub async fn send_maybe_upgrade<T>(io: T, req: Request<Full<Bytes>>) -> Result<UpstreamResponse, Error>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(io);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|_| Error::UpstreamUnreachable)?;

    let conn = conn.with_upgrades();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "upstream connection task ended");
        }
    });

    let mut resp = sender.send_request(req).await.map_err(|_| Error::UpstreamUnreachable)?;
    if resp.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Ok(UpstreamResponse::Buffered(buffer_body(resp).await?));
    }

    let upstream_io = hyper::upgrade::on(&mut resp).await.map_err(|_| Error::UpstreamUnreachable)?;
    let (response_parts, _) = resp.into_parts();
    Ok(UpstreamResponse::Upgraded { response_parts, upstream_io })
}
