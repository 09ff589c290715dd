//! src/gossip/mod.rs
//!
//! The gossip engine: a Scuttlebutt-style anti-entropy actor maintaining a
//! per-node key/value map across the cluster over UDP (digest/delta) and
//! TCP (join/leave), with a phi-accrual failure detector layered on top of
//! gossip contact.
//!
//! Mirrors the teacher's actor shape (`tokio::select!` loop over timers and
//! inbound channels, `CancellationToken`-driven shutdown) but swaps QUIC for
//! raw UDP/TCP sockets, since the wire protocol here is specified precisely
//! enough (MsgPack, explicit digest/delta message types) that a generic
//! stream-multiplexed transport would only get in the way.

pub mod phi;
pub mod state;
pub mod wire;

use crate::config::GossipConfig;
use crate::domain::{is_gossip_internal_key, NodeId, KEY_COMPACT_PREFIX, KEY_GOSSIP_ADDR, KEY_LEFT};
use phi::PhiAccrualDetector;
use state::GossipState;
use wire::{build_digest, shuffle_and_fit, DeltaEntry, GossipMessage, JoinAck, JoinMessage, LeaveAck, LeaveMessage};

use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("gossip wire error: {0}")]
    Wire(#[from] wire::WireError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("dns resolution for {0} returned no addresses")]
    NoAddresses(String),
    #[error("none of the given addresses were reachable")]
    JoinFailed,
    #[error("none of the contacted peers acknowledged the departure")]
    LeaveFailed,
    #[error("a peer refused to gossip with a node sharing its own id")]
    SelfId,
    #[error("gossip engine has shut down")]
    EngineGone,
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Active,
    Unreachable,
    Left,
}

/// A read-only, point-in-time view of one node's gossip state, handed to
/// callers outside the engine (the cluster registry, admin surfaces).
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub entries: HashMap<String, String>,
    pub status: NodeStatus,
}

/// Emitted to subscribers whenever a non-internal key changes, or a node's
/// reachability/left status changes.
#[derive(Debug, Clone)]
pub enum GossipEvent {
    EntryChanged { node: NodeId, key: String, value: Option<String> },
    StatusChanged { node: NodeId, status: NodeStatus },
}

enum Command {
    UpsertLocal(String, String, oneshot::Sender<u64>),
    DeleteLocal(String, oneshot::Sender<u64>),
    Node(NodeId, oneshot::Sender<Option<NodeSnapshot>>),
    Nodes(oneshot::Sender<Vec<NodeSnapshot>>),
    LocalNode(oneshot::Sender<NodeSnapshot>),
    Join(Vec<String>, oneshot::Sender<Result<Vec<NodeId>>>),
    Leave(oneshot::Sender<Result<()>>),
}

/// A cheaply-clonable handle to a running `GossipEngine`.
#[derive(Clone)]
pub struct GossipHandle {
    self_id: NodeId,
    cmd_tx: mpsc::Sender<Command>,
    event_tx: broadcast::Sender<GossipEvent>,
}

impl GossipHandle {
    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GossipEvent> {
        self.event_tx.subscribe()
    }

    async fn call<T>(&self, f: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(f(tx)).await.map_err(|_| Error::EngineGone)?;
        rx.await.map_err(|_| Error::EngineGone)
    }

    pub async fn upsert_local(&self, key: impl Into<String>, value: impl Into<String>) -> Result<u64> {
        let (key, value) = (key.into(), value.into());
        self.call(|tx| Command::UpsertLocal(key, value, tx)).await
    }

    pub async fn delete_local(&self, key: impl Into<String>) -> Result<u64> {
        let key = key.into();
        self.call(|tx| Command::DeleteLocal(key, tx)).await
    }

    pub async fn node(&self, id: NodeId) -> Result<Option<NodeSnapshot>> {
        self.call(|tx| Command::Node(id, tx)).await
    }

    pub async fn nodes(&self) -> Result<Vec<NodeSnapshot>> {
        self.call(Command::Nodes).await
    }

    pub async fn local_node(&self) -> Result<NodeSnapshot> {
        self.call(Command::LocalNode).await
    }

    /// Resolves `addrs` (appending the default gossip port if one isn't
    /// present) and attempts to join each. Returns the node IDs of peers
    /// successfully joined, or an error if none were reachable.
    pub async fn join(&self, addrs: Vec<String>) -> Result<Vec<NodeId>> {
        self.call(|tx| Command::Join(addrs, tx)).await?
    }

    /// Marks this node as leaving and notifies live peers directly,
    /// iterating until 3 acknowledgements are collected. Returns an error
    /// iff none of the contacted peers acknowledged.
    pub async fn leave(&self) -> Result<()> {
        self.call(Command::Leave).await?
    }
}

pub struct GossipEngine {
    self_id: NodeId,
    self_gossip_addr: SocketAddr,
    default_gossip_port: u16,
    state: GossipState,
    detector: PhiAccrualDetector,
    udp: UdpSocket,
    tcp: TcpListener,
    config: GossipConfig,
    node_expiry: Duration,
    cmd_rx: mpsc::Receiver<Command>,
    #[allow(dead_code)]
    cmd_tx: mpsc::Sender<Command>,
    event_tx: broadcast::Sender<GossipEvent>,
    /// Last reachability emitted per peer, so maintenance only notifies
    /// watchers on an actual transition rather than every tick.
    last_unreachable: HashMap<NodeId, bool>,
}

impl GossipEngine {
    pub async fn bind(self_gossip_addr: SocketAddr, config: GossipConfig, node_expiry: Duration) -> Result<(Self, GossipHandle)> {
        let self_id = NodeId::generate();
        let udp = UdpSocket::bind(self_gossip_addr).await?;
        // A requested port of 0 picks an OS-assigned ephemeral port; bind
        // the TCP listener to that concrete port too so gossip keeps a
        // single port for both UDP and TCP as the protocol requires.
        let self_gossip_addr = udp.local_addr()?;
        let tcp = TcpListener::bind(self_gossip_addr).await?;
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (event_tx, _) = broadcast::channel(1024);

        let bootstrap_interval = config.bootstrap_interval();
        let interval = config.interval();
        let detector = PhiAccrualDetector::new(config.phi_sample_size, config.phi_suspicion_threshold, bootstrap_interval, interval);

        let mut state = GossipState::default();
        state.upsert_local(&self_id, KEY_GOSSIP_ADDR, self_gossip_addr.to_string());

        let handle = GossipHandle {
            self_id: self_id.clone(),
            cmd_tx: cmd_tx.clone(),
            event_tx: event_tx.clone(),
        };

        Ok((
            Self {
                self_id,
                self_gossip_addr,
                default_gossip_port: self_gossip_addr.port(),
                state,
                detector,
                udp,
                tcp,
                config,
                node_expiry,
                cmd_rx,
                cmd_tx,
                event_tx,
                last_unreachable: HashMap::new(),
            },
            handle,
        ))
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(node_id = %self.self_id, addr = %self.self_gossip_addr, "gossip engine started");
        let mut gossip_timer = time::interval(self.config.interval());
        let mut maintenance_timer = time::interval(self.config.maintenance_interval());
        let mut udp_buf = vec![0u8; 64 * 1024];

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("gossip engine received shutdown signal");
                    break;
                }
                _ = gossip_timer.tick() => {
                    self.do_gossip_round().await;
                }
                _ = maintenance_timer.tick() => {
                    self.do_maintenance();
                }
                Ok((len, peer_addr)) = self.udp.recv_from(&mut udp_buf) => {
                    self.handle_udp_packet(&udp_buf[..len], peer_addr).await;
                }
                Ok((stream, peer_addr)) = self.tcp.accept() => {
                    self.handle_tcp_connection(stream, peer_addr).await;
                }
                Some(cmd) = self.cmd_rx.recv() => {
                    self.handle_command(cmd).await;
                }
            }
        }
    }

    async fn do_gossip_round(&mut self) {
        let live: Vec<NodeId> = self
            .state
            .nodes
            .keys()
            .filter(|id| **id != self.self_id && !self.detector.is_unreachable(id) && !self.state.nodes[*id].is_left())
            .cloned()
            .collect();
        let unreachable: Vec<NodeId> = self
            .state
            .nodes
            .keys()
            .filter(|id| **id != self.self_id && self.detector.is_unreachable(id))
            .cloned()
            .collect();

        let mut targets = Vec::new();
        {
            let mut rng = rand::thread_rng();
            if let Some(peer) = live.choose(&mut rng) {
                targets.push(peer.clone());
            }
            if let Some(peer) = unreachable.choose(&mut rng) {
                targets.push(peer.clone());
            }
        }

        for peer in targets {
            if let Some(addr) = self.gossip_addr_of(&peer) {
                self.send_digest(addr).await;
            }
        }
    }

    fn gossip_addr_of(&self, id: &NodeId) -> Option<SocketAddr> {
        self.state
            .visible_entries_including_internal(id)
            .get(KEY_GOSSIP_ADDR)
            .and_then(|s| s.parse().ok())
    }

    async fn send_digest(&self, to: SocketAddr) {
        let summary = build_digest(&self.state.digest_summary());
        let msg = GossipMessage::Digest { from: self.self_id.clone(), summary };
        self.send_udp(&msg, to).await;
    }

    async fn send_udp(&self, msg: &GossipMessage, to: SocketAddr) {
        match msg.encode() {
            Ok(bytes) => {
                if let Err(e) = self.udp.send_to(&bytes, to).await {
                    tracing::warn!(peer = %to, error = %e, "failed to send gossip packet");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to encode gossip message"),
        }
    }

    async fn handle_udp_packet(&mut self, bytes: &[u8], peer_addr: SocketAddr) {
        let msg = match GossipMessage::decode(bytes) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(peer = %peer_addr, error = %e, "dropping malformed gossip packet");
                return;
            }
        };
        match msg {
            GossipMessage::Digest { from, summary } => {
                if from == self.self_id {
                    tracing::warn!(peer = %peer_addr, "refusing to gossip with a node sharing our own id");
                    return;
                }
                self.detector.record_arrival(&from);
                self.record_peer_gossip_addr(&from, peer_addr);

                // Reply with the deltas they're missing. The reverse
                // direction (what we're missing of theirs) is satisfied
                // when our own periodic round later targets them with a
                // fresh digest, rather than round-tripping here.
                let deltas = self.state.deltas_for(&summary);
                if !deltas.is_empty() {
                    let max_bytes = self.config.max_packet_size;
                    let fitted = shuffle_and_fit(deltas, max_bytes, |d| {
                        GossipMessage::Delta { from: self.self_id.clone(), deltas: d.to_vec() }
                            .encode()
                            .map(|b| b.len())
                            .unwrap_or(usize::MAX)
                    });
                    if !fitted.is_empty() {
                        let reply = GossipMessage::Delta { from: self.self_id.clone(), deltas: fitted };
                        self.send_udp(&reply, peer_addr).await;
                    }
                }
            }
            GossipMessage::Delta { from, deltas } => {
                if from == self.self_id {
                    return;
                }
                self.detector.record_arrival(&from);
                self.record_peer_gossip_addr(&from, peer_addr);
                self.apply_and_notify(deltas);
            }
            GossipMessage::Join(_) | GossipMessage::JoinAck(_) | GossipMessage::Leave(_) | GossipMessage::LeaveAck(_) => {
                tracing::debug!(peer = %peer_addr, "join/leave messages are TCP-only, ignoring over UDP");
            }
        }
    }

    fn record_peer_gossip_addr(&mut self, id: &NodeId, addr: SocketAddr) {
        if self.gossip_addr_of(id).is_none() {
            self.state.apply_entry(id, KEY_GOSSIP_ADDR, Some(addr.to_string()), 1);
        }
    }

    fn apply_and_notify(&mut self, deltas: Vec<DeltaEntry>) {
        let changed = self.state.apply_delta(&deltas);
        for (node, key, value) in changed {
            if is_gossip_internal_key(&key) {
                if key == KEY_LEFT {
                    let _ = self.event_tx.send(GossipEvent::StatusChanged { node, status: NodeStatus::Left });
                } else if let Some(version) = key.strip_prefix(&format!("{KEY_COMPACT_PREFIX}=")).and_then(|v| v.parse::<u64>().ok()) {
                    // A peer already dropped these tombstones; do the same
                    // so they don't linger here forever.
                    self.state.apply_compaction_marker(&node, version);
                }
                continue;
            }
            let _ = self.event_tx.send(GossipEvent::EntryChanged { node, key, value });
        }
    }

    async fn handle_tcp_connection(&mut self, mut stream: TcpStream, peer_addr: SocketAddr) {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > 1024 * 1024 {
            tracing::warn!(peer = %peer_addr, len, "rejecting oversized gossip TCP frame");
            return;
        }
        let mut body = vec![0u8; len];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }
        let msg = match GossipMessage::decode(&body) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(peer = %peer_addr, error = %e, "dropping malformed gossip TCP frame");
                return;
            }
        };

        match msg {
            GossipMessage::Join(join) => {
                if join.node_id == self.self_id {
                    tracing::warn!(peer = %peer_addr, "refusing join from a node sharing our own id");
                    return;
                }
                if let Ok(addr) = join.gossip_addr.parse::<SocketAddr>() {
                    self.record_peer_gossip_addr(&join.node_id, addr);
                }
                self.detector.record_arrival(&join.node_id);
                let reply_deltas = self.state.deltas_for(&join.digest);
                self.apply_and_notify(join.deltas);
                let reply = GossipMessage::JoinAck(JoinAck {
                    node_id: self.self_id.clone(),
                    gossip_addr: self.self_gossip_addr.to_string(),
                    deltas: reply_deltas,
                });
                let _ = write_framed(&mut stream, &reply).await;
            }
            GossipMessage::Leave(leave) => {
                // `leave.deltas` already carries the leaver's own freshly
                // versioned `_left` entry; applying it emits the
                // StatusChanged{Left} event via apply_and_notify.
                self.apply_and_notify(leave.deltas);
                let reply = GossipMessage::LeaveAck(LeaveAck { node_id: self.self_id.clone() });
                let _ = write_framed(&mut stream, &reply).await;
            }
            GossipMessage::JoinAck(_) | GossipMessage::LeaveAck(_) => {
                tracing::debug!(peer = %peer_addr, "unexpected ack received on the accept side, ignoring");
            }
            GossipMessage::Digest { .. } | GossipMessage::Delta { .. } => {
                tracing::debug!(peer = %peer_addr, "digest/delta messages are UDP-only, ignoring over TCP");
            }
        }
    }

    fn do_maintenance(&mut self) {
        let expired = self.state.expire_left_nodes(self.node_expiry);
        for id in expired {
            self.detector.forget(&id);
            self.last_unreachable.remove(&id);
        }
        self.state.compact(self.config.compaction_tombstone_threshold);

        for id in self.detector.known_peers().cloned().collect::<Vec<_>>() {
            let now_unreachable = self.detector.is_unreachable(&id);
            let was_unreachable = self.last_unreachable.get(&id).copied().unwrap_or(false);
            if now_unreachable != was_unreachable {
                let status = if now_unreachable { NodeStatus::Unreachable } else { NodeStatus::Active };
                let _ = self.event_tx.send(GossipEvent::StatusChanged { node: id.clone(), status });
                self.last_unreachable.insert(id, now_unreachable);
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::UpsertLocal(key, value, resp) => {
                let v = self.state.upsert_local(&self.self_id.clone(), &key, value.clone());
                if !is_gossip_internal_key(&key) {
                    let _ = self.event_tx.send(GossipEvent::EntryChanged { node: self.self_id.clone(), key, value: Some(value) });
                }
                let _ = resp.send(v);
            }
            Command::DeleteLocal(key, resp) => {
                let v = self.state.delete_local(&self.self_id.clone(), &key);
                if !is_gossip_internal_key(&key) {
                    let _ = self.event_tx.send(GossipEvent::EntryChanged { node: self.self_id.clone(), key, value: None });
                }
                let _ = resp.send(v);
            }
            Command::Node(id, resp) => {
                let snapshot = self.state.nodes.get(&id).map(|_| self.snapshot_of(&id));
                let _ = resp.send(snapshot);
            }
            Command::Nodes(resp) => {
                let ids: Vec<NodeId> = self.state.nodes.keys().cloned().collect();
                let snapshots = ids.iter().map(|id| self.snapshot_of(id)).collect();
                let _ = resp.send(snapshots);
            }
            Command::LocalNode(resp) => {
                let snapshot = self.snapshot_of(&self.self_id.clone());
                let _ = resp.send(snapshot);
            }
            Command::Join(addrs, resp) => {
                let result = self.do_join(addrs).await;
                let _ = resp.send(result);
            }
            Command::Leave(resp) => {
                let result = self.do_leave().await;
                let _ = resp.send(result);
            }
        }
    }

    fn snapshot_of(&self, id: &NodeId) -> NodeSnapshot {
        let status = if self.state.nodes.get(id).map(|s| s.is_left()).unwrap_or(false) {
            NodeStatus::Left
        } else if self.detector.is_unreachable(id) {
            NodeStatus::Unreachable
        } else {
            NodeStatus::Active
        };
        NodeSnapshot {
            id: id.clone(),
            entries: self.state.visible_entries(id),
            status,
        }
    }

    async fn do_join(&mut self, addrs: Vec<String>) -> Result<Vec<NodeId>> {
        let mut resolved = Vec::new();
        for addr in addrs {
            let with_port = if addr.contains(':') { addr.clone() } else { format!("{addr}:{}", self.default_gossip_port) };
            match resolve(&with_port).await {
                Ok(mut socks) => resolved.append(&mut socks),
                Err(e) => tracing::warn!(addr = %with_port, error = %e, "failed to resolve join address"),
            }
        }
        if resolved.is_empty() {
            return Err(Error::JoinFailed);
        }

        let mut joined = Vec::new();
        for addr in resolved {
            match self.join_one(addr).await {
                Ok(id) => joined.push(id),
                Err(e) => tracing::warn!(peer = %addr, error = %e, "failed to join peer"),
            }
        }
        if joined.is_empty() {
            return Err(Error::JoinFailed);
        }
        Ok(joined)
    }

    async fn join_one(&mut self, addr: SocketAddr) -> Result<NodeId> {
        let mut stream = TcpStream::connect(addr).await?;
        let msg = GossipMessage::Join(JoinMessage {
            node_id: self.self_id.clone(),
            gossip_addr: self.self_gossip_addr.to_string(),
            digest: build_digest(&self.state.digest_summary()),
            deltas: self.state.deltas_for(&[]),
        });
        write_framed(&mut stream, &msg).await?;
        let reply = read_framed(&mut stream).await?;
        match reply {
            GossipMessage::JoinAck(ack) => {
                if ack.node_id == self.self_id {
                    return Err(Error::SelfId);
                }
                self.record_peer_gossip_addr(&ack.node_id, addr);
                self.detector.record_arrival(&ack.node_id);
                self.apply_and_notify(ack.deltas);
                Ok(ack.node_id)
            }
            _ => Err(Error::JoinFailed),
        }
    }

    /// Marks this node as left, then notifies up to 3 live peers directly
    /// (bypassing periodic gossip so the departure is seen promptly and
    /// acknowledged), iterating through the shuffled peer list until 3
    /// acks are collected or the list is exhausted.
    async fn do_leave(&mut self) -> Result<()> {
        let self_id = self.self_id.clone();
        self.state.mark_left(&self_id);
        let deltas = self.state.deltas_for(&[]);

        let mut live: Vec<NodeId> = self
            .state
            .nodes
            .keys()
            .filter(|id| **id != self.self_id && !self.detector.is_unreachable(id))
            .cloned()
            .collect();
        {
            let mut rng = rand::thread_rng();
            live.shuffle(&mut rng);
        }

        let mut acked = 0;
        for id in live {
            if acked >= 3 {
                break;
            }
            let Some(addr) = self.gossip_addr_of(&id) else { continue };
            let Ok(mut stream) = TcpStream::connect(addr).await else { continue };
            let msg = GossipMessage::Leave(LeaveMessage { node_id: self.self_id.clone(), deltas: deltas.clone() });
            if write_framed(&mut stream, &msg).await.is_err() {
                continue;
            }
            if let Ok(GossipMessage::LeaveAck(_)) = read_framed(&mut stream).await {
                acked += 1;
            }
        }
        if acked == 0 {
            return Err(Error::LeaveFailed);
        }
        Ok(())
    }
}

async fn resolve(addr: &str) -> std::result::Result<Vec<SocketAddr>, std::io::Error> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(addr).await?.collect();
    if addrs.is_empty() {
        return Err(std::io::Error::new(std::io::ErrorKind::NotFound, format!("no addresses for {addr}")));
    }
    Ok(addrs)
}

async fn write_framed(stream: &mut TcpStream, msg: &GossipMessage) -> Result<()> {
    let bytes = msg.encode()?;
    stream.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    stream.write_all(&bytes).await?;
    Ok(())
}

async fn read_framed(stream: &mut TcpStream) -> Result<GossipMessage> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(GossipMessage::decode(&body)?)
}

/// Helper used only by `gossip_addr_of`/`record_peer_gossip_addr`: exposes
/// internal keys too, since `_gossip_addr` must be readable internally even
/// though it's filtered out of `visible_entries` for external consumers.
impl GossipState {
    pub fn visible_entries_including_internal(&self, id: &NodeId) -> HashMap<String, String> {
        self.nodes
            .get(id)
            .map(|s| {
                s.entries
                    .iter()
                    .filter(|(_, e)| e.value.is_some())
                    .map(|(k, e)| (k.clone(), e.value.clone().unwrap()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A thin alias so `App` can depend on an `Arc<GossipHandle>`-equivalent
/// without every caller needing to clone the broadcast sender by hand.
pub type SharedGossip = Arc<GossipHandle>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GossipConfig;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::time::timeout;

    fn test_gossip_config() -> GossipConfig {
        GossipConfig {
            interval_ms: 20,
            max_packet_size: 1400,
            phi_sample_size: 50,
            phi_suspicion_threshold: 8.0,
            compaction_tombstone_threshold: 100,
        }
    }

    async fn spawn_engine() -> (GossipHandle, CancellationToken) {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let (engine, handle) = GossipEngine::bind(addr, test_gossip_config(), Duration::from_secs(3600))
            .await
            .unwrap();
        let token = CancellationToken::new();
        tokio::spawn(engine.run(token.clone()));
        (handle, token)
    }

    #[tokio::test]
    async fn two_nodes_converge_after_join() {
        let addr_a = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let (engine_a, handle_a) = GossipEngine::bind(addr_a, test_gossip_config(), Duration::from_secs(3600)).await.unwrap();
        let a_addr = engine_a.self_gossip_addr;
        let token_a = CancellationToken::new();
        tokio::spawn(engine_a.run(token_a.clone()));

        let (handle_b, token_b) = spawn_engine().await;

        handle_b.join(vec![a_addr.to_string()]).await.unwrap();
        handle_a.upsert_local("greeting", "hello").await.unwrap();

        let converged = timeout(Duration::from_secs(5), async {
            loop {
                let nodes = handle_b.nodes().await.unwrap();
                if nodes.iter().any(|n| n.entries.get("greeting").map(|v| v.as_str()) == Some("hello")) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(converged.is_ok(), "gossip state did not converge in time");

        token_a.cancel();
        token_b.cancel();
    }

    #[tokio::test]
    async fn leave_marks_node_as_left_on_peer() {
        let addr_a = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let (engine_a, handle_a) = GossipEngine::bind(addr_a, test_gossip_config(), Duration::from_secs(3600)).await.unwrap();
        let a_addr = engine_a.self_gossip_addr;
        let token_a = CancellationToken::new();
        tokio::spawn(engine_a.run(token_a.clone()));

        let (handle_b, token_b) = spawn_engine().await;
        handle_b.join(vec![a_addr.to_string()]).await.unwrap();
        handle_b.leave().await.unwrap();

        let left = timeout(Duration::from_secs(5), async {
            loop {
                let nodes = handle_a.nodes().await.unwrap();
                if nodes.iter().any(|n| n.id == *handle_b.self_id() && n.status == NodeStatus::Left) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(left.is_ok(), "peer never observed the leaving node as left");

        token_a.cancel();
        token_b.cancel();
    }
}
