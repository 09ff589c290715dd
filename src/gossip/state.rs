//! src/gossip/state.rs
//!
//! The per-node key/value map gossip reconciles, plus tombstone compaction
//! and `left`-node expiry. `GossipEngine` owns one `GossipState` behind a
//! lock; this type itself has no knowledge of sockets or timers.

use crate::domain::{is_gossip_internal_key, NodeId, KEY_COMPACT_PREFIX, KEY_LEFT};
use crate::gossip::wire::{DeltaEntry, DigestEntry, WireEntry};
use std::collections::HashMap;
use std::time::Instant;

/// A single key's value and the monotonic version it was written at.
/// `value: None` is a tombstone, produced by `delete_local` and retained
/// until compaction forgets it.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub value: Option<String>,
    pub version: u64,
}

/// All gossip-visible state for one node.
#[derive(Debug, Clone, Default)]
pub struct NodeState {
    pub entries: HashMap<String, Entry>,
    pub max_version: u64,
    /// Wall-clock instant this node's state last changed, used for
    /// `left`-node expiry bookkeeping. `None` for nodes we've never
    /// observed a direct update for (only learned of via digest).
    pub last_changed: Option<Instant>,
}

impl NodeState {
    fn bump(&mut self, version: u64) {
        if version > self.max_version {
            self.max_version = version;
        }
        self.last_changed = Some(Instant::now());
    }

    pub fn is_left(&self) -> bool {
        self.entries
            .get(KEY_LEFT)
            .map(|e| e.value.is_some())
            .unwrap_or(false)
    }

    fn tombstone_count(&self) -> usize {
        self.entries.values().filter(|e| e.value.is_none()).count()
    }
}

/// The full cluster-wide gossip state as seen from this node.
#[derive(Debug, Default)]
pub struct GossipState {
    pub nodes: HashMap<NodeId, NodeState>,
}

/// The outcome of applying a single entry, used by the engine to decide
/// whether to emit a `GossipEvent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    Stale,
}

impl GossipState {
    pub fn node_mut(&mut self, id: &NodeId) -> &mut NodeState {
        self.nodes.entry(id.clone()).or_default()
    }

    /// Applies a single versioned write for `node`. Versions are monotonic
    /// per (node, key is not required - we track a per-node max_version and
    /// only accept an entry if its version is newer than what's already
    /// stored for that exact key. A node known to have left accepts no
    /// further mutation except the `_left` entry itself.
    pub fn apply_entry(&mut self, node: &NodeId, key: &str, value: Option<String>, version: u64) -> ApplyOutcome {
        let state = self.node_mut(node);
        if key != KEY_LEFT && state.is_left() {
            return ApplyOutcome::Stale;
        }
        let is_newer = match state.entries.get(key) {
            Some(existing) => version > existing.version,
            None => true,
        };
        if !is_newer {
            return ApplyOutcome::Stale;
        }
        state.entries.insert(key.to_string(), Entry { value, version });
        state.bump(version);
        ApplyOutcome::Applied
    }

    /// Purges tombstones for `node` with a version older than
    /// `upto_version`, mirroring a compaction the node performed locally.
    /// Invoked on receipt of a `_compact=<version>` marker.
    pub fn apply_compaction_marker(&mut self, node: &NodeId, upto_version: u64) {
        if let Some(state) = self.nodes.get_mut(node) {
            state.entries.retain(|_, e| e.value.is_some() || e.version >= upto_version);
        }
    }

    /// Local write path: always takes the next version for this node.
    pub fn upsert_local(&mut self, node: &NodeId, key: &str, value: String) -> u64 {
        let next_version = self.node_mut(node).max_version + 1;
        self.apply_entry(node, key, Some(value), next_version);
        next_version
    }

    pub fn delete_local(&mut self, node: &NodeId, key: &str) -> u64 {
        let next_version = self.node_mut(node).max_version + 1;
        self.apply_entry(node, key, None, next_version);
        next_version
    }

    /// Marks `node` as having left the cluster, taking the next version
    /// for that node's `_left` key.
    pub fn mark_left(&mut self, node: &NodeId) -> u64 {
        let next_version = self.node_mut(node).max_version + 1;
        self.apply_entry(node, KEY_LEFT, Some("true".to_string()), next_version);
        next_version
    }

    pub fn digest_summary(&self) -> HashMap<NodeId, u64> {
        self.nodes
            .iter()
            .map(|(id, s)| (id.clone(), s.max_version))
            .collect()
    }

    /// Builds the set of deltas the peer described by `their_digest` is
    /// missing, including entries for nodes they didn't mention at all.
    pub fn deltas_for(&self, their_digest: &[DigestEntry]) -> Vec<DeltaEntry> {
        let their_versions: HashMap<&NodeId, u64> = their_digest
            .iter()
            .map(|d| (&d.node_id, d.max_version))
            .collect();

        let mut out = Vec::new();
        for (node_id, state) in &self.nodes {
            let their_version = their_versions.get(node_id).copied().unwrap_or(0);
            let missing: Vec<WireEntry> = state
                .entries
                .iter()
                .filter(|(_, e)| e.version > their_version)
                .map(|(k, e)| WireEntry {
                    key: k.clone(),
                    value: e.value.clone(),
                    version: e.version,
                })
                .collect();
            if !missing.is_empty() {
                out.push(DeltaEntry {
                    node_id: node_id.clone(),
                    entries: missing,
                });
            }
        }
        out
    }

    /// Applies an inbound delta, returning the (node, key, value) triples
    /// that actually changed something, for event emission.
    pub fn apply_delta(&mut self, deltas: &[DeltaEntry]) -> Vec<(NodeId, String, Option<String>)> {
        let mut changed = Vec::new();
        for delta in deltas {
            for entry in &delta.entries {
                if self.apply_entry(&delta.node_id, &entry.key, entry.value.clone(), entry.version)
                    == ApplyOutcome::Applied
                {
                    changed.push((delta.node_id.clone(), entry.key.clone(), entry.value.clone()));
                }
            }
        }
        changed
    }

    /// Visible (non-internal) entries for a node, for external consumers
    /// like the cluster registry.
    pub fn visible_entries(&self, id: &NodeId) -> HashMap<String, String> {
        self.nodes
            .get(id)
            .map(|s| {
                s.entries
                    .iter()
                    .filter(|(k, e)| !is_gossip_internal_key(k) && e.value.is_some())
                    .map(|(k, e)| (k.clone(), e.value.clone().unwrap()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Compacts tombstones for nodes whose tombstone count exceeds
    /// `threshold`, recording a synthetic `_compact=<version>` marker so
    /// peers who still hold the tombstones know to drop them too.
    pub fn compact(&mut self, threshold: usize) -> Vec<NodeId> {
        let mut compacted = Vec::new();
        for (id, state) in self.nodes.iter_mut() {
            if state.tombstone_count() > threshold {
                state.entries.retain(|_, e| e.value.is_some());
                let version = state.max_version + 1;
                state.entries.insert(
                    format!("{KEY_COMPACT_PREFIX}={version}"),
                    Entry { value: Some(version.to_string()), version },
                );
                state.bump(version);
                compacted.push(id.clone());
            }
        }
        compacted
    }

    /// Forgets nodes that announced `left` more than `expiry` ago.
    pub fn expire_left_nodes(&mut self, expiry: std::time::Duration) -> Vec<NodeId> {
        let now = Instant::now();
        let expired: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, s)| {
                s.is_left()
                    && s.last_changed
                        .map(|t| now.duration_since(t) > expiry)
                        .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.nodes.remove(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::from(s.to_string())
    }

    #[test]
    fn local_writes_are_monotonically_versioned() {
        let mut state = GossipState::default();
        let v1 = state.upsert_local(&id("a"), "status", "active".into());
        let v2 = state.upsert_local(&id("a"), "status", "draining".into());
        assert!(v2 > v1);
        assert_eq!(
            state.nodes[&id("a")].entries["status"].value,
            Some("draining".into())
        );
    }

    #[test]
    fn stale_entries_are_rejected() {
        let mut state = GossipState::default();
        state.apply_entry(&id("a"), "k", Some("new".into()), 5);
        let outcome = state.apply_entry(&id("a"), "k", Some("old".into()), 3);
        assert_eq!(outcome, ApplyOutcome::Stale);
        assert_eq!(state.nodes[&id("a")].entries["k"].value, Some("new".into()));
    }

    #[test]
    fn deltas_for_includes_unknown_nodes_entirely() {
        let mut state = GossipState::default();
        state.upsert_local(&id("a"), "k", "v".into());
        let deltas = state.deltas_for(&[]);
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].node_id, id("a"));
    }

    #[test]
    fn deltas_for_excludes_up_to_date_nodes() {
        let mut state = GossipState::default();
        let v = state.upsert_local(&id("a"), "k", "v".into());
        let digest = vec![DigestEntry { node_id: id("a"), max_version: v }];
        assert!(state.deltas_for(&digest).is_empty());
    }

    #[test]
    fn apply_delta_is_idempotent() {
        let mut state = GossipState::default();
        let deltas = vec![DeltaEntry {
            node_id: id("a"),
            entries: vec![WireEntry { key: "k".into(), value: Some("v".into()), version: 1 }],
        }];
        let first = state.apply_delta(&deltas);
        let second = state.apply_delta(&deltas);
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[test]
    fn compaction_drops_tombstones_past_threshold() {
        let mut state = GossipState::default();
        for i in 0..5 {
            state.upsert_local(&id("a"), &format!("k{i}"), "v".into());
        }
        for i in 0..5 {
            state.delete_local(&id("a"), &format!("k{i}"));
        }
        let compacted = state.compact(2);
        assert_eq!(compacted, vec![id("a")]);
        assert_eq!(state.nodes[&id("a")].tombstone_count(), 0);
    }

    #[test]
    fn left_node_rejects_further_mutation() {
        let mut state = GossipState::default();
        state.mark_left(&id("a"));
        let outcome = state.apply_entry(&id("a"), "status", Some("active".into()), 99);
        assert_eq!(outcome, ApplyOutcome::Stale);
        assert!(!state.nodes[&id("a")].entries.contains_key("status"));
    }

    #[test]
    fn compaction_marker_purges_older_tombstones() {
        let mut state = GossipState::default();
        state.upsert_local(&id("a"), "k", "v".into());
        let del_version = state.delete_local(&id("a"), "k");
        assert!(state.nodes[&id("a")].entries["k"].value.is_none());
        state.apply_compaction_marker(&id("a"), del_version + 1);
        assert!(!state.nodes[&id("a")].entries.contains_key("k"));
    }

    #[test]
    fn expiry_forgets_old_left_nodes() {
        let mut state = GossipState::default();
        state.upsert_local(&id("a"), KEY_LEFT, "true".into());
        state.nodes.get_mut(&id("a")).unwrap().last_changed =
            Some(Instant::now() - std::time::Duration::from_secs(100));
        let expired = state.expire_left_nodes(std::time::Duration::from_secs(10));
        assert_eq!(expired, vec![id("a")]);
        assert!(!state.nodes.contains_key(&id("a")));
    }
}
