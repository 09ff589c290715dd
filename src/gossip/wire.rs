//! src/gossip/wire.rs
//!
//! The MsgPack wire format for gossip traffic: a 2-byte `[type, version]`
//! header followed by a MsgPack-encoded body. The version byte is always
//! `0`; any other value must be rejected by the receiver.

use crate::domain::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The only wire format version this node speaks.
pub const WIRE_VERSION: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Digest = 0,
    Delta = 1,
    Join = 2,
    Leave = 3,
    JoinAck = 4,
    LeaveAck = 5,
}

impl MessageType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Digest),
            1 => Some(Self::Delta),
            2 => Some(Self::Join),
            3 => Some(Self::Leave),
            4 => Some(Self::JoinAck),
            5 => Some(Self::LeaveAck),
            _ => None,
        }
    }
}

/// A single versioned key/value entry as seen on the wire. `value: None`
/// represents a tombstone (a deleted key, retained until compaction).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEntry {
    pub key: String,
    pub value: Option<String>,
    pub version: u64,
}

/// One node's contribution to a digest: the highest version this sender
/// has observed for that node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestEntry {
    pub node_id: NodeId,
    pub max_version: u64,
}

/// One node's contribution to a delta: the full set of entries the sender
/// believes the recipient is missing or behind on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaEntry {
    pub node_id: NodeId,
    pub entries: Vec<WireEntry>,
}

/// A join request: the joiner's own digest (so the receiver can send only
/// what's missing) plus its full local delta (every entry it already
/// knows), so a joiner re-joining with prior state seeds the receiver too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinMessage {
    pub node_id: NodeId,
    pub gossip_addr: String,
    pub digest: Vec<DigestEntry>,
    pub deltas: Vec<DeltaEntry>,
}

/// The join reply: the receiver's own address plus a delta computed
/// against the joiner's digest, bootstrapping the joiner's state in one
/// round trip instead of waiting for periodic gossip to converge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinAck {
    pub node_id: NodeId,
    pub gossip_addr: String,
    pub deltas: Vec<DeltaEntry>,
}

/// A leave notification: the leaver's full local delta (including its own
/// freshly written `_left` entry), so the receiver doesn't need a
/// follow-up gossip round to learn about the departure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveMessage {
    pub node_id: NodeId,
    pub deltas: Vec<DeltaEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveAck {
    pub node_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GossipMessage {
    Digest { from: NodeId, summary: Vec<DigestEntry> },
    Delta { from: NodeId, deltas: Vec<DeltaEntry> },
    Join(JoinMessage),
    JoinAck(JoinAck),
    Leave(LeaveMessage),
    LeaveAck(LeaveAck),
}

impl GossipMessage {
    fn message_type(&self) -> MessageType {
        match self {
            GossipMessage::Digest { .. } => MessageType::Digest,
            GossipMessage::Delta { .. } => MessageType::Delta,
            GossipMessage::Join(_) => MessageType::Join,
            GossipMessage::JoinAck(_) => MessageType::JoinAck,
            GossipMessage::Leave(_) => MessageType::Leave,
            GossipMessage::LeaveAck(_) => MessageType::LeaveAck,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let body = rmp_serde::to_vec_named(self)?;
        let mut out = Vec::with_capacity(body.len() + 2);
        out.push(self.message_type() as u8);
        out.push(WIRE_VERSION);
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < 2 {
            return Err(WireError::Truncated);
        }
        let (header, body) = bytes.split_at(2);
        let _type = MessageType::from_byte(header[0]).ok_or(WireError::UnknownType(header[0]))?;
        let version = header[1];
        if version != WIRE_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        Ok(rmp_serde::from_slice(body)?)
    }
}

/// Packs entries into UDP-sized packets: entries are shuffled so repeated
/// truncation at the same packet boundary doesn't starve the same nodes
/// every round, then greedily filled until `max_packet_size` would be
/// exceeded.
pub fn shuffle_and_fit<T, F>(mut items: Vec<T>, max_packet_size: usize, encode_len: F) -> Vec<T>
where
    F: Fn(&[T]) -> usize,
{
    use rand::seq::SliceRandom;
    items.shuffle(&mut rand::thread_rng());

    let mut out = Vec::new();
    for item in items {
        let mut candidate = out;
        candidate.push(item);
        if encode_len(&candidate) > max_packet_size && !candidate.is_empty() {
            candidate.pop();
            out = candidate;
            break;
        }
        out = candidate;
    }
    out
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("gossip packet too short to contain a header")]
    Truncated,
    #[error("unknown gossip message type byte {0}")]
    UnknownType(u8),
    #[error("unsupported gossip wire version {0}, this node only speaks version {WIRE_VERSION}")]
    UnsupportedVersion(u8),
    #[error("failed to encode gossip message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode gossip message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Builds a digest summarizing the highest version known per node.
pub fn build_digest(states: &HashMap<NodeId, u64>) -> Vec<DigestEntry> {
    states
        .iter()
        .map(|(id, &v)| DigestEntry {
            node_id: id.clone(),
            max_version: v,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let msg = GossipMessage::Digest {
            from: NodeId::generate(),
            summary: vec![DigestEntry {
                node_id: NodeId::generate(),
                max_version: 42,
            }],
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes[1], WIRE_VERSION);
        let decoded = GossipMessage::decode(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn rejects_unsupported_version() {
        let msg = GossipMessage::Leave(LeaveMessage {
            node_id: NodeId::generate(),
            deltas: Vec::new(),
        });
        let mut bytes = msg.encode().unwrap();
        bytes[1] = 7;
        let err = GossipMessage::decode(&bytes).unwrap_err();
        assert!(matches!(err, WireError::UnsupportedVersion(7)));
    }

    #[test]
    fn rejects_truncated_packet() {
        let err = GossipMessage::decode(&[0u8]).unwrap_err();
        assert!(matches!(err, WireError::Truncated));
    }

    #[test]
    fn shuffle_and_fit_respects_byte_budget() {
        let items: Vec<u8> = (0..200).collect();
        let fitted = shuffle_and_fit(items, 50, |xs| xs.len());
        assert!(fitted.len() <= 50);
    }
}
