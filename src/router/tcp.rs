//! src/router/tcp.rs
//!
//! The TCP tunnel path: a downstream client connects with
//! `GET /_piko/v1/tcp/<endpointID>` over WebSocket (the only way to carry
//! an endpoint ID without application-level headers over a raw TCP
//! tunnel); bytes are copied between that socket and a freshly opened
//! logical stream until either side closes.

use super::{already_forwarded, Error, RouterState, FORWARD_HEADER};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

enum Target {
    Local(Arc<crate::tunnel::Session>),
    Remote(SocketAddr),
}

pub async fn handle(State(state): State<RouterState>, Path(endpoint_id): Path<String>, headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    match resolve(&state, &endpoint_id, &headers).await {
        Ok(Target::Local(session)) => ws.on_upgrade(move |socket| proxy_local(socket, session)),
        Ok(Target::Remote(addr)) => ws.on_upgrade(move |socket| proxy_remote(socket, addr, endpoint_id)),
        Err(e) => e.into_response(),
    }
}

async fn resolve(state: &RouterState, endpoint_id: &str, headers: &HeaderMap) -> Result<Target, Error> {
    if let Some(session) = state.upstream.pick_local(endpoint_id).await {
        return Ok(Target::Local(session));
    }
    if already_forwarded(headers) {
        return Err(Error::NoUpstreams);
    }
    let candidates = state.registry.lookup_endpoint(endpoint_id).await;
    candidates
        .iter()
        .find_map(|n| n.proxy_addr)
        .map(Target::Remote)
        .ok_or(Error::NoUpstreams)
}

async fn proxy_local(socket: WebSocket, session: Arc<crate::tunnel::Session>) {
    let logical = match session.open(crate::tunnel::frame::StreamType::TcpProxy).await {
        Ok(l) => l,
        Err(e) => {
            tracing::warn!(error = %e, "failed to open tcp-proxy logical stream");
            return;
        }
    };
    pump_websocket_to_logical(socket, logical).await;
}

async fn proxy_remote(socket: WebSocket, addr: SocketAddr, endpoint_id: String) {
    let url = format!("ws://{addr}/_piko/v1/tcp/{endpoint_id}");
    let mut request = match url.into_client_request() {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "failed to build remote tcp-tunnel request");
            return;
        }
    };
    request.headers_mut().insert(FORWARD_HEADER, "true".parse().unwrap());

    let (remote_ws, _) = match tokio_tungstenite::connect_async(request).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(error = %e, %addr, "failed to dial remote node for tcp tunnel");
            return;
        }
    };

    let (mut down_sink, mut down_stream) = socket.split();
    let (mut up_sink, mut up_stream) = remote_ws.split();

    let up = async {
        while let Some(Ok(msg)) = down_stream.next().await {
            let forward = match msg {
                Message::Binary(b) => tokio_tungstenite::tungstenite::Message::Binary(b),
                Message::Close(_) => break,
                _ => continue,
            };
            if up_sink.send(forward).await.is_err() {
                break;
            }
        }
    };
    let down = async {
        while let Some(Ok(msg)) = up_stream.next().await {
            let forward = match msg {
                tokio_tungstenite::tungstenite::Message::Binary(b) => Message::Binary(b),
                tokio_tungstenite::tungstenite::Message::Close(_) => break,
                _ => continue,
            };
            if down_sink.send(forward).await.is_err() {
                break;
            }
        }
    };
    tokio::select! {
        _ = up => {},
        _ = down => {},
    }
}

async fn pump_websocket_to_logical(socket: WebSocket, logical: crate::tunnel::LogicalStream) {
    let (mut sink, mut stream) = socket.split();
    let logical = Arc::new(logical);
    let reader = logical.clone();

    let inbound = async move {
        while let Some(chunk) = reader.read().await {
            if sink.send(Message::Binary(chunk)).await.is_err() {
                break;
            }
        }
    };
    let outbound = async move {
        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                Message::Binary(b) => {
                    if logical.write(&b).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        logical.close().await;
    };
    tokio::select! {
        _ = inbound => {},
        _ = outbound => {},
    }
}
