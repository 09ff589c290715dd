//! src/upstream/rebalance.rs
//!
//! Pure helper functions for the upstream manager's rebalancing heuristic,
//! kept separate from the actor so the arithmetic can be tested without
//! spinning up real tunnel sessions.

use super::EndpointPool;
use crate::tunnel::Session;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;

/// Number of sessions this node should close given its local connection
/// total, the cluster mean, and the computed excess above that mean.
/// Never sheds below the mean.
pub fn sessions_to_shed(local_total: f64, mean: f64, excess: f64, shed_rate: f64) -> usize {
    if excess <= 0.0 {
        return 0;
    }
    let raw = (excess * shed_rate).floor() as usize;
    let max_without_going_under_mean = (local_total - mean).floor().max(0.0) as usize;
    raw.min(max_without_going_under_mean)
}

/// Picks `count` random sessions across all local pools to close, paired
/// with the endpoint ID each belongs to.
pub fn pick_victims(pools: &mut HashMap<String, EndpointPool>, count: usize) -> Vec<(String, Arc<Session>)> {
    let mut all: Vec<(String, Arc<Session>)> = pools
        .iter()
        .flat_map(|(endpoint_id, pool)| pool.sessions.iter().map(move |s| (endpoint_id.clone(), s.clone())))
        .collect();
    all.shuffle(&mut rand::thread_rng());
    all.truncate(count);
    all
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_shedding_when_not_over_threshold() {
        assert_eq!(sessions_to_shed(100.0, 100.0, -0.0, 0.005), 0);
    }

    #[test]
    fn shedding_is_proportional_to_excess() {
        // mean 100, local 200 => excess 100, shed_rate 0.5 => 50, but
        // capped so we never drop below the mean (100).
        let shed = sessions_to_shed(200.0, 100.0, 100.0, 0.5);
        assert_eq!(shed, 50);
    }

    #[test]
    fn never_sheds_below_the_mean() {
        let shed = sessions_to_shed(110.0, 100.0, 10.0, 1.0);
        assert!(shed <= 10);
    }
}
