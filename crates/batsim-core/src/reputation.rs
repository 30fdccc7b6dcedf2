//! Periodic reputation update
//!
//! Every `update_interval` all routing nodes reconsider whether to relay:
//!
//! - a node whose drop score has passed `drop_limit` turns cooperative;
//! - otherwise a node with fewer than `quorum` cooperative direct neighbors
//!   turns selfish;
//! - anything else keeps its current flag.
//!
//! All decisions read the flags as they were before the update started.
//! Turning cooperative does not reset the drop score; it decays as the node
//! relays.

use crate::packet::Ip;
use crate::routing::RoutingLayer;
use std::collections::BTreeMap;
use tracing::debug;

/// Thresholds of the update rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReputationPolicy {
    pub drop_limit: u32,
    pub quorum: usize,
}

impl ReputationPolicy {
    pub fn new(drop_limit: u32, quorum: usize) -> Self {
        Self { drop_limit, quorum }
    }

    /// New selfish flag of a node
    pub fn decide(&self, selfish: bool, drop_score: u32, cooperative_neighbors: usize) -> bool {
        if drop_score > self.drop_limit {
            false
        } else if cooperative_neighbors < self.quorum {
            true
        } else {
            selfish
        }
    }
}

/// Flag changes made by one update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReputationChanges {
    pub became_selfish: usize,
    pub became_cooperative: usize,
}

/// Apply `policy` to every node against a snapshot of the current flags
pub fn update_selfishness<'a, I>(nodes: I, policy: &ReputationPolicy) -> ReputationChanges
where
    I: IntoIterator<Item = &'a mut RoutingLayer>,
{
    let mut nodes: Vec<&mut RoutingLayer> = nodes.into_iter().collect();
    let snapshot: BTreeMap<Ip, bool> = nodes.iter().map(|n| (n.ip(), n.selfish)).collect();
    let mut changes = ReputationChanges::default();

    for node in nodes.iter_mut() {
        let cooperative = node
            .neighbors()
            .ips()
            .filter(|ip| snapshot.get(ip) == Some(&false))
            .count();
        let selfish = policy.decide(node.selfish, node.drop_score(), cooperative);
        if selfish != node.selfish {
            debug!(node = node.ip(), selfish, drop_score = node.drop_score(), cooperative, "reputation flip");
            if selfish {
                changes.became_selfish += 1;
            } else {
                changes.became_cooperative += 1;
            }
            node.selfish = selfish;
        }
    }
    changes
}
