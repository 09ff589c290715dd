//! src/tunnel/mod.rs
//!
//! The tunnel session layer: each accepted upstream connection is wrapped
//! in a `Session` multiplexing typed logical streams (listener
//! registration, HTTP proxying, TCP proxying) over WebSocket binary
//! frames, with an application-level heartbeat used to detect dead peers.
//! WebSocket was chosen, per spec, because it traverses ordinary HTTP load
//! balancers that a raw TCP tunnel would not.

pub mod auth;
pub mod frame;
pub mod listener;

use frame::{Frame, StreamType};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("listener registration failed: {0}")]
    Registration(String),
    #[error("token validation failed: {0}")]
    Auth(#[from] auth::AuthError),
    #[error("session is closed")]
    Closed,
    #[error(transparent)]
    Listener(#[from] listener::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The transport underlying a tunnel's WebSocket framing: plain TCP or
/// TLS-over-TCP. Both halves are `Unpin`, so delegation doesn't need pin
/// projection.
pub enum UpstreamStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// One end of a multiplexed logical stream within a `Session`.
pub struct LogicalStream {
    pub id: u32,
    pub stream_type: StreamType,
    outbound_tx: mpsc::Sender<Message>,
    inbound_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl LogicalStream {
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let frame = Frame::Data { stream_id: self.id, payload: data.to_vec() };
        self.outbound_tx.send(Message::Binary(frame.encode())).await.map_err(|_| Error::Closed)
    }

    /// Reads the next chunk written by the peer, or `None` once the
    /// logical stream has been closed.
    pub async fn read(&self) -> Option<Vec<u8>> {
        self.inbound_rx.lock().await.recv().await
    }

    pub async fn close(&self) {
        let frame = Frame::Close { stream_id: self.id };
        let _ = self.outbound_tx.send(Message::Binary(frame.encode())).await;
    }

    /// Bridges this logical stream to an ordinary bidirectional
    /// `AsyncRead`+`AsyncWrite` object via an in-process duplex buffer, so
    /// byte-stream consumers like an HTTP/1 client connection can treat it
    /// as a regular socket. Two pump tasks own the logical stream from
    /// here on; dropping the returned handle eventually closes it.
    pub fn into_io(self) -> DuplexStream {
        let (io_side, remote_side) = tokio::io::duplex(64 * 1024);
        let logical = Arc::new(self);
        let (mut remote_read, mut remote_write) = tokio::io::split(remote_side);

        let inbound_pump = logical.clone();
        tokio::spawn(async move {
            while let Some(chunk) = inbound_pump.read().await {
                if remote_write.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                match remote_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if logical.write(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            logical.close().await;
        });

        io_side
    }
}

struct Registry {
    streams: HashMap<u32, mpsc::Sender<Vec<u8>>>,
}

/// A live tunnel session to one upstream agent connection.
pub struct Session {
    outbound_tx: mpsc::Sender<Message>,
    accept_rx: Mutex<mpsc::Receiver<LogicalStream>>,
    next_stream_id: AtomicU32,
    registry: Arc<Mutex<Registry>>,
    closed: Arc<AtomicBool>,
}

impl Session {
    /// Spawns the reader/writer/heartbeat tasks for a freshly established
    /// WebSocket connection (either side) and returns a handle to it.
    /// Generic over the underlying transport so both the upstream
    /// listener's accepted connections (`UpstreamStream`) and a tunnel
    /// client's outbound connections share this implementation.
    pub fn spawn<S>(ws: WebSocketStream<S>, heartbeat_interval: Duration, heartbeat_timeout: Duration) -> Arc<Session>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(256);
        let (accept_tx, accept_rx) = mpsc::channel::<LogicalStream>(64);
        let registry = Arc::new(Mutex::new(Registry { streams: HashMap::new() }));
        let closed = Arc::new(AtomicBool::new(false));

        // Writer task: the only task that owns the sink half.
        let writer_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            writer_closed.store(true, Ordering::SeqCst);
        });

        // Reader + heartbeat task.
        let reader_registry = registry.clone();
        let reader_closed = closed.clone();
        let reader_outbound_tx = outbound_tx.clone();
        tokio::spawn(async move {
            let mut last_heartbeat = tokio::time::Instant::now();
            let mut heartbeat_timer = tokio::time::interval(heartbeat_interval);
            loop {
                tokio::select! {
                    _ = heartbeat_timer.tick() => {
                        if reader_outbound_tx.send(Message::Binary(Frame::Heartbeat.encode())).await.is_err() {
                            break;
                        }
                        if last_heartbeat.elapsed() > heartbeat_timeout {
                            tracing::warn!("tunnel session heartbeat timed out, closing");
                            break;
                        }
                    }
                    msg = stream.next() => {
                        let Some(Ok(msg)) = msg else { break };
                        match msg {
                            Message::Binary(bytes) => {
                                last_heartbeat = tokio::time::Instant::now();
                                let Ok(frame) = Frame::decode(&bytes) else { continue };
                                match frame {
                                    Frame::Open { stream_id, stream_type } => {
                                        let (tx, rx) = mpsc::channel(64);
                                        reader_registry.lock().await.streams.insert(stream_id, tx);
                                        let logical = LogicalStream {
                                            id: stream_id,
                                            stream_type,
                                            outbound_tx: reader_outbound_tx.clone(),
                                            inbound_rx: Mutex::new(rx),
                                        };
                                        if accept_tx.send(logical).await.is_err() {
                                            break;
                                        }
                                    }
                                    Frame::Data { stream_id, payload } => {
                                        let registry = reader_registry.lock().await;
                                        if let Some(tx) = registry.streams.get(&stream_id) {
                                            let _ = tx.send(payload).await;
                                        }
                                    }
                                    Frame::Close { stream_id } => {
                                        reader_registry.lock().await.streams.remove(&stream_id);
                                    }
                                    Frame::Heartbeat => {
                                        last_heartbeat = tokio::time::Instant::now();
                                    }
                                }
                            }
                            Message::Close(_) => break,
                            _ => {}
                        }
                    }
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            reader_registry.lock().await.streams.clear();
        });

        Arc::new(Session {
            outbound_tx,
            accept_rx: Mutex::new(accept_rx),
            next_stream_id: AtomicU32::new(1),
            registry,
            closed,
        })
    }

    /// Waits for the next inbound logical stream opened by the peer (used
    /// to receive the listener-registration stream, and any future
    /// peer-initiated streams).
    pub async fn accept(&self) -> Option<LogicalStream> {
        self.accept_rx.lock().await.recv().await
    }

    /// Opens a new outbound logical stream of `stream_type`.
    pub async fn open(&self, stream_type: StreamType) -> Result<LogicalStream> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(64);
        self.registry.lock().await.streams.insert(stream_id, tx);
        let frame = Frame::Open { stream_id, stream_type };
        self.outbound_tx
            .send(Message::Binary(frame.encode()))
            .await
            .map_err(|_| Error::Closed)?;
        Ok(LogicalStream {
            id: stream_id,
            stream_type,
            outbound_tx: self.outbound_tx.clone(),
            inbound_rx: Mutex::new(rx),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn close(&self) {
        let _ = self.outbound_tx.send(Message::Close(None)).await;
        self.closed.store(true, Ordering::SeqCst);
    }
}
