//! src/router/mod.rs
//!
//! The downstream request router: resolves an endpoint ID from an
//! incoming HTTP or TCP-tunnel request, then either proxies it over a
//! locally-held tunnel session or forwards it once to a remote node that
//! holds one.

pub mod client;
pub mod http;
pub mod tcp;

use crate::config::RouterConfig;
use crate::registry::ClusterRegistry;
use crate::upstream::UpstreamManager;
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde_json::json;

pub const FORWARD_HEADER: &str = "x-piko-forward";
pub const ENDPOINT_HEADER: &str = "x-piko-endpoint";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing endpoint id")]
    MissingEndpointId,
    #[error("no available upstreams")]
    NoUpstreams,
    #[error("upstream unreachable")]
    UpstreamUnreachable,
    #[error("upstream timeout")]
    UpstreamTimeout,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match self {
            Error::MissingEndpointId => axum::http::StatusCode::BAD_REQUEST,
            Error::NoUpstreams | Error::UpstreamUnreachable => axum::http::StatusCode::BAD_GATEWAY,
            Error::UpstreamTimeout => axum::http::StatusCode::GATEWAY_TIMEOUT,
        };
        (status, axum::Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Clone)]
pub struct RouterState {
    pub upstream: UpstreamManager,
    pub registry: ClusterRegistry,
    pub config: RouterConfig,
}

/// Builds the axum `Router` served on the downstream proxy port.
pub fn build(state: RouterState) -> Router {
    Router::new()
        .route("/_piko/v1/tcp/:endpoint_id", axum::routing::get(tcp::handle))
        .fallback(http::handle)
        .with_state(state)
}

/// Resolves the endpoint ID for a request: the `x-piko-endpoint` header if
/// present, else the first label of the `Host` header if it contains a
/// dot.
pub fn resolve_endpoint_id(headers: &axum::http::HeaderMap) -> Option<String> {
    if let Some(v) = headers.get(ENDPOINT_HEADER).and_then(|v| v.to_str().ok()) {
        if !v.is_empty() {
            return Some(v.to_string());
        }
    }
    let host = headers.get(axum::http::header::HOST).and_then(|v| v.to_str().ok())?;
    let host = host.split(':').next().unwrap_or(host);
    if !host.contains('.') {
        return None;
    }
    host.split('.').next().map(str::to_string).filter(|s| !s.is_empty())
}

pub fn already_forwarded(headers: &axum::http::HeaderMap) -> bool {
    headers.get(FORWARD_HEADER).and_then(|v| v.to_str().ok()) == Some("true")
}
