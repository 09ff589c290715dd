//! src/gossip/phi.rs
//!
//! A phi-accrual-style failure detector per peer: tracks recent heartbeat
//! inter-arrival times and derives a suspicion value `phi(now) = (now -
//! lastArrival) / meanInterval`. A peer is considered unreachable once phi
//! crosses `suspicionThreshold`. New peers are given a bootstrap grace
//! period before they're evaluated at all, since there's no inter-arrival
//! history yet to judge them against.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::domain::NodeId;

#[derive(Debug, Clone)]
struct PeerSamples {
    last_arrival: Instant,
    intervals: VecDeque<Duration>,
    first_seen: Instant,
}

impl PeerSamples {
    fn mean_interval(&self, default: Duration) -> Duration {
        if self.intervals.is_empty() {
            return default;
        }
        let total: Duration = self.intervals.iter().sum();
        total / self.intervals.len() as u32
    }
}

pub struct PhiAccrualDetector {
    sample_size: usize,
    suspicion_threshold: f64,
    bootstrap_interval: Duration,
    default_interval: Duration,
    peers: HashMap<NodeId, PeerSamples>,
}

impl PhiAccrualDetector {
    pub fn new(sample_size: usize, suspicion_threshold: f64, bootstrap_interval: Duration, default_interval: Duration) -> Self {
        Self {
            sample_size,
            suspicion_threshold,
            bootstrap_interval,
            default_interval,
            peers: HashMap::new(),
        }
    }

    /// Records a heartbeat (any gossip contact, not just a dedicated
    /// heartbeat message) from `peer`.
    pub fn record_arrival(&mut self, peer: &NodeId) {
        let now = Instant::now();
        let entry = self.peers.entry(peer.clone()).or_insert_with(|| PeerSamples {
            last_arrival: now,
            intervals: VecDeque::new(),
            first_seen: now,
        });
        let gap = now.duration_since(entry.last_arrival);
        if entry.intervals.len() >= self.sample_size {
            entry.intervals.pop_front();
        }
        // Skip the degenerate first sample (gap from first_seen to itself).
        if entry.last_arrival != entry.first_seen || !entry.intervals.is_empty() {
            entry.intervals.push_back(gap);
        }
        entry.last_arrival = now;
    }

    /// Returns the current phi value for `peer`, or `None` if the peer is
    /// still within its bootstrap grace period or has never been observed.
    pub fn phi(&self, peer: &NodeId) -> Option<f64> {
        let entry = self.peers.get(peer)?;
        let now = Instant::now();
        if now.duration_since(entry.first_seen) < self.bootstrap_interval {
            return None;
        }
        let mean = entry.mean_interval(self.default_interval).as_secs_f64().max(0.001);
        let elapsed = now.duration_since(entry.last_arrival).as_secs_f64();
        Some(elapsed / mean)
    }

    pub fn is_unreachable(&self, peer: &NodeId) -> bool {
        self.phi(peer).map(|p| p >= self.suspicion_threshold).unwrap_or(false)
    }

    pub fn forget(&mut self, peer: &NodeId) {
        self.peers.remove(peer);
    }

    pub fn known_peers(&self) -> impl Iterator<Item = &NodeId> {
        self.peers.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::from(s.to_string())
    }

    #[test]
    fn fresh_peer_is_not_judged_during_bootstrap() {
        let detector = PhiAccrualDetector::new(50, 20.0, Duration::from_secs(60), Duration::from_millis(100));
        assert_eq!(detector.phi(&id("a")), None);
    }

    #[test]
    fn peer_becomes_unreachable_after_silence() {
        let mut detector = PhiAccrualDetector::new(50, 1.0, Duration::from_millis(0), Duration::from_millis(10));
        detector.record_arrival(&id("a"));
        detector.record_arrival(&id("a"));
        std::thread::sleep(Duration::from_millis(50));
        assert!(detector.is_unreachable(&id("a")));
    }

    #[test]
    fn forgetting_a_peer_removes_its_history() {
        let mut detector = PhiAccrualDetector::new(50, 20.0, Duration::from_secs(0), Duration::from_millis(100));
        detector.record_arrival(&id("a"));
        detector.forget(&id("a"));
        assert_eq!(detector.phi(&id("a")), None);
    }
}
