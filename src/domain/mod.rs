//! src/domain/mod.rs
//!
//! Shared identifiers and constants used across the gossip engine, cluster
//! registry, upstream manager and router. Kept deliberately small: each
//! subsystem owns its own richer state types (`gossip::state::GossipState`,
//! `registry::NodeRecord`, `upstream::EndpointPool`) and only the identifiers
//! that cross module boundaries live here.

use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length range for randomly generated node IDs, per the gossip protocol's
/// node identity convention: 7-10 alphanumeric characters.
const NODE_ID_MIN_LEN: usize = 7;
const NODE_ID_MAX_LEN: usize = 10;

/// A node's identity within the cluster. Generated randomly at startup,
/// not derived from any key material: the gossip layer does not
/// authenticate membership traffic, only the tunnel listener layer (see
/// `tunnel::auth`) authenticates upstream agents.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Generates a new random node ID of 7-10 alphanumeric characters.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let len = rng.gen_range(NODE_ID_MIN_LEN..=NODE_ID_MAX_LEN);
        let id: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Gossip key under which a node publishes that it is leaving the cluster.
pub const KEY_LEFT: &str = "_left";
/// Gossip key prefix for synthetic compaction markers.
pub const KEY_COMPACT_PREFIX: &str = "_compact";
/// Gossip key a node publishes its own gossip listener address under, so
/// peers learning about it only via digest/delta (never a direct join) can
/// still address it directly. Internal bookkeeping, not registry data.
pub const KEY_GOSSIP_ADDR: &str = "_gossip_addr";

/// Reserved cluster-registry keys, interpreted by `registry::ClusterRegistry`
/// rather than exposed raw to gossip watchers outside it.
pub const KEY_PROXY_ADDR: &str = "proxy_addr";
pub const KEY_ADMIN_ADDR: &str = "admin_addr";
pub const KEY_STATUS: &str = "status";
pub const KEY_ENDPOINT_PREFIX: &str = "endpoint:";

/// The status value a node publishes once it has finished startup and is
/// ready to accept routed traffic.
pub const STATUS_ACTIVE: &str = "active";

/// True if `key` is one of gossip's own internal bookkeeping keys and must
/// never be surfaced to registry/application watchers.
pub fn is_gossip_internal_key(key: &str) -> bool {
    key == KEY_LEFT || key == KEY_GOSSIP_ADDR || key.starts_with(KEY_COMPACT_PREFIX)
}

pub fn endpoint_key(endpoint_id: &str) -> String {
    format!("{KEY_ENDPOINT_PREFIX}{endpoint_id}")
}

pub fn endpoint_id_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(KEY_ENDPOINT_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_in_length_range() {
        for _ in 0..100 {
            let id = NodeId::generate();
            let len = id.as_str().len();
            assert!((NODE_ID_MIN_LEN..=NODE_ID_MAX_LEN).contains(&len));
            assert!(id.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn endpoint_key_round_trips() {
        let key = endpoint_key("my-endpoint");
        assert_eq!(endpoint_id_from_key(&key), Some("my-endpoint"));
        assert_eq!(endpoint_id_from_key("proxy_addr"), None);
    }

    #[test]
    fn internal_keys_are_recognized() {
        assert!(is_gossip_internal_key(KEY_LEFT));
        assert!(is_gossip_internal_key("_compact=42"));
        assert!(!is_gossip_internal_key(KEY_PROXY_ADDR));
    }
}
