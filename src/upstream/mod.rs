//! src/upstream/mod.rs
//!
//! Per-endpoint pools of locally-terminated tunnels, with round-robin
//! selection and periodic rebalancing against the cluster-wide mean
//! connection count.

pub mod rebalance;

use crate::config::RebalanceConfig;
use crate::registry::ClusterRegistry;
use crate::tunnel::Session;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// A single endpoint's pool of locally-accepted tunnel sessions.
pub struct EndpointPool {
    sessions: Vec<Arc<Session>>,
    cursor: AtomicUsize,
}

impl EndpointPool {
    fn new() -> Self {
        Self { sessions: Vec::new(), cursor: AtomicUsize::new(0) }
    }

    /// Picks the next session in round-robin order. `None` if the pool is
    /// empty.
    pub fn next(&self) -> Option<Arc<Session>> {
        if self.sessions.is_empty() {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.sessions.len();
        Some(self.sessions[i].clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

struct Inner {
    pools: HashMap<String, EndpointPool>,
}

/// A cheaply-clonable handle onto the upstream manager's pools.
#[derive(Clone)]
pub struct UpstreamManager {
    registry: ClusterRegistry,
    rebalance_config: RebalanceConfig,
    inner: Arc<Mutex<Inner>>,
}

impl UpstreamManager {
    pub fn new(registry: ClusterRegistry, rebalance_config: RebalanceConfig) -> Self {
        Self {
            registry,
            rebalance_config,
            inner: Arc::new(Mutex::new(Inner { pools: HashMap::new() })),
        }
    }

    /// Spawns the periodic rebalancing task.
    pub fn spawn_rebalancer(&self, shutdown: CancellationToken) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.rebalance_config.interval());
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => manager.rebalance_once().await,
                }
            }
        });
    }

    /// Registers a newly accepted tunnel session for `endpoint_id`,
    /// bumping this node's published listener count.
    pub async fn accept(&self, endpoint_id: &str, session: Arc<Session>) {
        {
            let mut inner = self.inner.lock().await;
            inner.pools.entry(endpoint_id.to_string()).or_insert_with(EndpointPool::new).sessions.push(session);
        }
        if let Err(e) = self.registry.update_local_endpoint_count(endpoint_id, 1).await {
            tracing::warn!(endpoint_id, error = %e, "failed to publish endpoint count increment");
        }
    }

    /// Removes a closed session from its pool, dropping the pool entirely
    /// if it becomes empty.
    pub async fn remove(&self, endpoint_id: &str, session: &Arc<Session>) {
        let became_empty = {
            let mut inner = self.inner.lock().await;
            if let Some(pool) = inner.pools.get_mut(endpoint_id) {
                pool.sessions.retain(|s| !Arc::ptr_eq(s, session));
                let empty = pool.sessions.is_empty();
                if empty {
                    inner.pools.remove(endpoint_id);
                }
                empty
            } else {
                true
            }
        };
        let _ = became_empty;
        if let Err(e) = self.registry.update_local_endpoint_count(endpoint_id, -1).await {
            tracing::warn!(endpoint_id, error = %e, "failed to publish endpoint count decrement");
        }
    }

    /// Returns the next session to serve a request for `endpoint_id` from
    /// this node's local pool, if any.
    pub async fn pick_local(&self, endpoint_id: &str) -> Option<Arc<Session>> {
        let inner = self.inner.lock().await;
        inner.pools.get(endpoint_id).and_then(|p| p.next())
    }

    pub async fn local_pool_size(&self, endpoint_id: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.pools.get(endpoint_id).map(|p| p.len()).unwrap_or(0)
    }

    pub async fn total_local_connections(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.pools.values().map(|p| p.len()).sum()
    }

    async fn rebalance_once(&self) {
        let local_total = self.total_local_connections().await as f64;
        let cluster = self.registry.snapshot().await;
        let cluster_total: i64 = cluster.iter().flat_map(|n| n.endpoints.values()).sum();
        if (cluster_total as u64) < self.rebalance_config.floor {
            return;
        }
        let active_node_count = cluster.iter().filter(|n| n.is_active()).count().max(1);
        let mean = cluster_total as f64 / active_node_count as f64;

        if local_total <= mean * (1.0 + self.rebalance_config.threshold) {
            return;
        }

        let excess = local_total - mean;
        let shed_count = rebalance::sessions_to_shed(local_total, mean, excess, self.rebalance_config.shed_rate);
        if shed_count == 0 {
            return;
        }

        let victims = {
            let mut inner = self.inner.lock().await;
            rebalance::pick_victims(&mut inner.pools, shed_count)
        };

        tracing::info!(count = victims.len(), local_total, mean, "rebalancing: shedding excess tunnels");
        for (endpoint_id, session) in victims {
            session.close().await;
            self.remove(&endpoint_id, &session).await;
        }
    }
}
