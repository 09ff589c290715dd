//! src/registry/mod.rs
//!
//! The cluster registry translates gossip key-space events into structured
//! `NodeRecord`s. A node is "pending" (invisible to routing) until both of
//! its immutable address keys and a status entry have been observed.

use crate::domain::{endpoint_id_from_key, endpoint_key, NodeId, KEY_ADMIN_ADDR, KEY_PROXY_ADDR, KEY_STATUS};
use crate::gossip::{GossipEvent, GossipHandle, NodeStatus as GossipNodeStatus};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub id: NodeId,
    pub proxy_addr: Option<SocketAddr>,
    pub admin_addr: Option<SocketAddr>,
    pub status: Option<String>,
    pub endpoints: HashMap<String, i64>,
    pub left: bool,
    /// Whether the phi-accrual failure detector currently considers this
    /// node unreachable. Distinct from `left`: a node can recover from
    /// `unreachable` back to active, but never from `left`.
    pub unreachable: bool,
}

impl NodeRecord {
    fn new(id: NodeId) -> Self {
        Self {
            id,
            proxy_addr: None,
            admin_addr: None,
            status: None,
            endpoints: HashMap::new(),
            left: false,
            unreachable: false,
        }
    }

    /// A node is only visible to routing once both address keys and a
    /// status entry have been observed, it hasn't announced leaving, and
    /// the failure detector doesn't currently consider it unreachable.
    pub fn is_active(&self) -> bool {
        !self.left
            && !self.unreachable
            && self.proxy_addr.is_some()
            && self.admin_addr.is_some()
            && self.status.is_some()
    }

    fn apply(&mut self, key: &str, value: Option<&str>) {
        match key {
            KEY_PROXY_ADDR => self.proxy_addr = value.and_then(|v| v.parse().ok()),
            KEY_ADMIN_ADDR => self.admin_addr = value.and_then(|v| v.parse().ok()),
            KEY_STATUS => self.status = value.map(|v| v.to_string()),
            _ => {
                if let Some(endpoint_id) = endpoint_id_from_key(key) {
                    match value.and_then(|v| v.parse::<i64>().ok()) {
                        Some(count) if count > 0 => {
                            self.endpoints.insert(endpoint_id.to_string(), count);
                        }
                        _ => {
                            self.endpoints.remove(endpoint_id);
                        }
                    }
                }
            }
        }
    }
}

struct Inner {
    nodes: HashMap<NodeId, NodeRecord>,
}

/// A cheaply-clonable handle onto the live cluster registry.
#[derive(Clone)]
pub struct ClusterRegistry {
    self_id: NodeId,
    gossip: GossipHandle,
    inner: Arc<RwLock<Inner>>,
}

impl ClusterRegistry {
    /// Spawns the background task that keeps the registry's projection of
    /// gossip state up to date, and returns a handle to query it.
    pub fn spawn(gossip: GossipHandle, shutdown: CancellationToken) -> Self {
        let registry = Self {
            self_id: gossip.self_id().clone(),
            gossip: gossip.clone(),
            inner: Arc::new(RwLock::new(Inner { nodes: HashMap::new() })),
        };
        let task_registry = registry.clone();
        tokio::spawn(task_registry.run(shutdown));
        registry
    }

    async fn run(self, shutdown: CancellationToken) {
        // Seed from whatever gossip already knows, then react to live events.
        if let Ok(nodes) = self.gossip.nodes().await {
            let mut inner = self.inner.write().await;
            for snapshot in nodes {
                let record = inner.nodes.entry(snapshot.id.clone()).or_insert_with(|| NodeRecord::new(snapshot.id.clone()));
                for (k, v) in &snapshot.entries {
                    record.apply(k, Some(v));
                }
                record.left = snapshot.status == GossipNodeStatus::Left;
                record.unreachable = snapshot.status == GossipNodeStatus::Unreachable;
            }
        }

        let mut events = self.gossip.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => {
                    match event {
                        Ok(GossipEvent::EntryChanged { node, key, value }) => {
                            let mut inner = self.inner.write().await;
                            let record = inner.nodes.entry(node.clone()).or_insert_with(|| NodeRecord::new(node));
                            record.apply(&key, value.as_deref());
                        }
                        Ok(GossipEvent::StatusChanged { node, status }) => {
                            let mut inner = self.inner.write().await;
                            let record = inner.nodes.entry(node.clone()).or_insert_with(|| NodeRecord::new(node));
                            match status {
                                GossipNodeStatus::Left => {
                                    record.left = true;
                                    record.unreachable = false;
                                }
                                GossipNodeStatus::Unreachable => record.unreachable = true,
                                GossipNodeStatus::Active => record.unreachable = false,
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "cluster registry lagged behind gossip events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }

    /// Active nodes (per `NodeRecord::is_active`) serving `endpoint_id`
    /// with a nonzero listener count.
    pub async fn lookup_endpoint(&self, endpoint_id: &str) -> Vec<NodeRecord> {
        let inner = self.inner.read().await;
        inner
            .nodes
            .values()
            .filter(|n| n.is_active() && n.endpoints.get(endpoint_id).copied().unwrap_or(0) > 0)
            .cloned()
            .collect()
    }

    pub async fn local_node(&self) -> Option<NodeRecord> {
        self.inner.read().await.nodes.get(&self.self_id).cloned()
    }

    /// Publishes this node's own `proxy_addr`/`admin_addr`/`status` so it
    /// becomes visible to routing once all three are observed.
    pub async fn announce_local(&self, proxy_addr: SocketAddr, admin_addr: SocketAddr, status: &str) -> crate::gossip::Result<()> {
        self.gossip.upsert_local(KEY_PROXY_ADDR, proxy_addr.to_string()).await?;
        self.gossip.upsert_local(KEY_ADMIN_ADDR, admin_addr.to_string()).await?;
        self.gossip.upsert_local(KEY_STATUS, status).await?;
        Ok(())
    }

    /// Updates this node's published listener count for `endpoint_id` by
    /// `delta`, deleting the key entirely once the count reaches zero.
    pub async fn update_local_endpoint_count(&self, endpoint_id: &str, delta: i64) -> crate::gossip::Result<()> {
        let key = endpoint_key(endpoint_id);
        let current = self
            .local_node()
            .await
            .and_then(|r| r.endpoints.get(endpoint_id).copied())
            .unwrap_or(0);
        let next = current + delta;
        if next > 0 {
            self.gossip.upsert_local(key, next.to_string()).await?;
        } else {
            self.gossip.delete_local(key).await?;
        }
        Ok(())
    }

    /// A full snapshot of every node record, for any future admin surface
    /// to build on — the seam spec.md asks to keep downward-only.
    pub async fn snapshot(&self) -> Vec<NodeRecord> {
        self.inner.read().await.nodes.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_is_inactive_until_all_three_keys_observed() {
        let mut record = NodeRecord::new(NodeId::from("a".to_string()));
        assert!(!record.is_active());
        record.apply(KEY_PROXY_ADDR, Some("127.0.0.1:1"));
        assert!(!record.is_active());
        record.apply(KEY_ADMIN_ADDR, Some("127.0.0.1:2"));
        assert!(!record.is_active());
        record.apply(KEY_STATUS, Some("active"));
        assert!(record.is_active());
    }

    #[test]
    fn endpoint_counts_are_tracked_and_removed_at_zero() {
        let mut record = NodeRecord::new(NodeId::from("a".to_string()));
        record.apply(&endpoint_key("svc"), Some("3"));
        assert_eq!(record.endpoints.get("svc"), Some(&3));
        record.apply(&endpoint_key("svc"), Some("0"));
        assert!(!record.endpoints.contains_key("svc"));
    }

    #[test]
    fn deleting_an_address_key_reverts_activity() {
        let mut record = NodeRecord::new(NodeId::from("a".to_string()));
        record.apply(KEY_PROXY_ADDR, Some("127.0.0.1:1"));
        record.apply(KEY_ADMIN_ADDR, Some("127.0.0.1:2"));
        record.apply(KEY_STATUS, Some("active"));
        assert!(record.is_active());
        record.apply(KEY_PROXY_ADDR, None);
        assert!(!record.is_active());
    }
}
