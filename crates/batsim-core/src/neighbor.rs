//! Neighbor table
//!
//! Each routing node keeps one entry per directly linked peer: the static link
//! parameters it was connected with, traffic counters in both directions, and
//! how often the peer was picked as next hop toward each destination.

use crate::packet::Ip;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Link metrics for a neighbor
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LinkQuality {
    /// Per-attempt delivery probability
    pub p_succ: f64,
    /// Round-trip time of one attempt (s)
    pub rtt: f64,
    /// Number of packets sent to this neighbor
    pub packets_sent: u64,
    pub bytes_sent: u64,
    /// Number of packets received from this neighbor
    pub packets_received: u64,
    pub bytes_received: u64,
}

impl LinkQuality {
    pub fn new(p_succ: f64, rtt: f64) -> Self {
        Self { p_succ, rtt, ..Self::default() }
    }

    /// Expected airtime per delivered packet
    pub fn expected_delay(&self) -> f64 {
        if self.p_succ > 0.0 {
            self.rtt / self.p_succ
        } else {
            f64::INFINITY
        }
    }
}

/// A directly reachable node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub ip: Ip,
    pub link_quality: LinkQuality,
    /// Next-hop selections through this neighbor, by final destination
    pub via: BTreeMap<Ip, u64>,
}

impl Neighbor {
    pub fn new(ip: Ip, p_succ: f64, rtt: f64) -> Self {
        Self { ip, link_quality: LinkQuality::new(p_succ, rtt), via: BTreeMap::new() }
    }
}

/// Neighbor table of one routing node
#[derive(Debug, Clone, Default)]
pub struct NeighborTable {
    neighbors: BTreeMap<Ip, Neighbor>,
}

impl NeighborTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a neighbor, or refresh its link parameters
    pub fn insert(&mut self, ip: Ip, p_succ: f64, rtt: f64) {
        self.neighbors
            .entry(ip)
            .and_modify(|n| {
                n.link_quality.p_succ = p_succ;
                n.link_quality.rtt = rtt;
            })
            .or_insert_with(|| Neighbor::new(ip, p_succ, rtt));
    }

    pub fn get(&self, ip: Ip) -> Option<&Neighbor> {
        self.neighbors.get(&ip)
    }

    pub fn contains(&self, ip: Ip) -> bool {
        self.neighbors.contains_key(&ip)
    }

    /// Count a packet handed to `next_hop` on its way to `destination`
    pub fn record_sent(&mut self, next_hop: Ip, destination: Ip, bytes: u32) {
        if let Some(neighbor) = self.neighbors.get_mut(&next_hop) {
            neighbor.link_quality.packets_sent += 1;
            neighbor.link_quality.bytes_sent += bytes as u64;
            *neighbor.via.entry(destination).or_default() += 1;
        }
    }

    /// Count a packet that arrived over the link from `prev_hop`
    pub fn record_received(&mut self, prev_hop: Ip, bytes: u32) {
        if let Some(neighbor) = self.neighbors.get_mut(&prev_hop) {
            neighbor.link_quality.packets_received += 1;
            neighbor.link_quality.bytes_received += bytes as u64;
        }
    }

    /// Neighbor addresses, ascending
    pub fn ips(&self) -> impl Iterator<Item = Ip> + '_ {
        self.neighbors.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }
}
