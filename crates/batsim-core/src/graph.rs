//! Run-wide routing graph
//!
//! Every routing node publishes its address, links and current drop score
//! here; next-hop selection runs Dijkstra over it. Edge cost is
//!
//! ```text
//! cost(u, v) = base(u, v) + (w(u) + w(v)) / 2        w = drop score
//! ```
//!
//! so nodes that have been refusing to relay are routed around. Among paths of
//! equal cost the one whose node sequence is lexicographically smallest wins,
//! which makes route choice independent of insertion order.

use crate::config::{RouteStrategy, RoutingConfig};
use crate::error::{SimError, SimResult};
use crate::packet::Ip;
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Cost(f64);

impl Eq for Cost {}

impl PartialOrd for Cost {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cost {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Graph of routing nodes, weighted by reputation
#[derive(Debug, Clone, Default)]
pub struct RoutingGraph {
    weights: BTreeMap<Ip, u32>,
    edges: BTreeMap<Ip, BTreeMap<Ip, f64>>,
}

impl RoutingGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, ip: Ip) {
        self.weights.entry(ip).or_insert(0);
        self.edges.entry(ip).or_default();
    }

    pub fn contains(&self, ip: Ip) -> bool {
        self.weights.contains_key(&ip)
    }

    /// Add the undirected edge `a - b` with link success probability `p_succ`
    pub fn add_edge(&mut self, a: Ip, b: Ip, p_succ: f64) -> SimResult<()> {
        for ip in [a, b] {
            if !self.contains(ip) {
                return Err(SimError::UnknownAddress(ip));
            }
        }
        self.edges.entry(a).or_default().insert(b, p_succ);
        self.edges.entry(b).or_default().insert(a, p_succ);
        Ok(())
    }

    /// Publish the drop score of `ip`
    pub fn set_weight(&mut self, ip: Ip, drop_score: u32) {
        self.weights.insert(ip, drop_score);
    }

    pub fn weight(&self, ip: Ip) -> u32 {
        self.weights.get(&ip).copied().unwrap_or(0)
    }

    /// Direct neighbors of `ip`, ascending
    pub fn neighbors(&self, ip: Ip) -> impl Iterator<Item = Ip> + '_ {
        self.edges.get(&ip).into_iter().flat_map(|peers| peers.keys().copied())
    }

    pub fn node_count(&self) -> usize {
        self.weights.len()
    }

    /// Whether `ip` is past the untrusted threshold
    pub fn is_untrusted(&self, ip: Ip, config: &RoutingConfig) -> bool {
        config.untrusted_score.is_some_and(|limit| self.weight(ip) > limit)
    }

    fn edge_cost(&self, u: Ip, v: Ip, p_succ: f64, config: &RoutingConfig) -> Option<f64> {
        let base = match config.strategy {
            RouteStrategy::ShortestPath => config.base_link_cost,
            RouteStrategy::ExpectedTransmissions => {
                if p_succ <= 0.0 {
                    return None;
                }
                config.base_link_cost / p_succ
            }
        };
        Some(base + (self.weight(u) as f64 + self.weight(v) as f64) / 2.0)
    }

    /// Cheapest path `from .. to`, both ends included
    pub fn shortest_path(&self, from: Ip, to: Ip, config: &RoutingConfig) -> SimResult<Vec<Ip>> {
        if !self.contains(from) {
            return Err(SimError::UnknownAddress(from));
        }
        if !self.contains(to) {
            return Err(SimError::UnknownAddress(to));
        }
        if from == to {
            return Ok(vec![from]);
        }

        let mut best: BTreeMap<Ip, (f64, Vec<Ip>)> = BTreeMap::new();
        let mut heap = BinaryHeap::new();
        best.insert(from, (0.0, vec![from]));
        heap.push(Reverse((Cost(0.0), from)));

        while let Some(Reverse((Cost(cost), u))) = heap.pop() {
            let Some((settled, path)) = best.get(&u) else { continue };
            if cost > *settled {
                continue;
            }
            if u == to {
                return Ok(path.clone());
            }
            // Only the source and trusted nodes may relay.
            if u != from && self.is_untrusted(u, config) {
                continue;
            }
            let path = path.clone();

            for (&v, &p_succ) in self.edges.get(&u).into_iter().flatten() {
                let Some(step) = self.edge_cost(u, v, p_succ, config) else { continue };
                let candidate = cost + step;
                let improves = match best.get(&v) {
                    None => true,
                    Some((known, known_path)) => {
                        candidate < *known || (candidate == *known && path_lt(&path, v, known_path))
                    }
                };
                if improves {
                    let mut next_path = path.clone();
                    next_path.push(v);
                    best.insert(v, (candidate, next_path));
                    heap.push(Reverse((Cost(candidate), v)));
                }
            }
        }

        Err(SimError::NoPath { from, to })
    }

    /// First hop on the cheapest path from `from` to `to`
    pub fn next_hop(&self, from: Ip, to: Ip, config: &RoutingConfig) -> SimResult<Ip> {
        let path = self.shortest_path(from, to, config)?;
        path.get(1).copied().ok_or(SimError::NoPath { from, to })
    }
}

/// `prefix + [last] < other`, lexicographically
fn path_lt(prefix: &[Ip], last: Ip, other: &[Ip]) -> bool {
    prefix.iter().copied().chain(std::iter::once(last)).lt(other.iter().copied())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(nodes: &[Ip], edges: &[(Ip, Ip)]) -> RoutingGraph {
        let mut graph = RoutingGraph::new();
        for &ip in nodes {
            graph.add_node(ip);
        }
        for &(a, b) in edges {
            graph.add_edge(a, b, 1.0).unwrap();
        }
        graph
    }

    #[test]
    fn test_direct_and_multi_hop() {
        let g = graph(&[1, 2, 3], &[(1, 2), (2, 3)]);
        let config = RoutingConfig::default();
        assert_eq!(g.shortest_path(1, 3, &config).unwrap(), vec![1, 2, 3]);
        assert_eq!(g.next_hop(1, 2, &config).unwrap(), 2);
        assert_eq!(g.next_hop(3, 1, &config).unwrap(), 2);
    }

    #[test]
    fn test_no_path() {
        let g = graph(&[1, 2, 3], &[(1, 2)]);
        let config = RoutingConfig::default();
        assert_eq!(g.next_hop(1, 3, &config), Err(SimError::NoPath { from: 1, to: 3 }));
        assert_eq!(g.next_hop(1, 9, &config), Err(SimError::UnknownAddress(9)));
    }

    #[test]
    fn test_tie_breaks_on_smallest_relay() {
        // Diamond 1-{2,3}-4, equal cost both ways.
        let g = graph(&[1, 2, 3, 4], &[(1, 3), (3, 4), (1, 2), (2, 4)]);
        let config = RoutingConfig::default();
        assert_eq!(g.next_hop(1, 4, &config).unwrap(), 2);
    }

    #[test]
    fn test_drop_score_steers_traffic() {
        let mut g = graph(&[1, 2, 3, 4], &[(1, 2), (2, 4), (1, 3), (3, 4)]);
        let config = RoutingConfig::default();
        g.set_weight(2, 3);
        assert_eq!(g.next_hop(1, 4, &config).unwrap(), 3);

        // A longer clean detour beats a short dirty relay.
        let mut g = graph(&[1, 2, 3, 4, 5], &[(1, 2), (2, 5), (1, 3), (3, 4), (4, 5)]);
        g.set_weight(2, 10);
        assert_eq!(g.shortest_path(1, 5, &config).unwrap(), vec![1, 3, 4, 5]);
    }

    #[test]
    fn test_untrusted_nodes_never_relay() {
        let mut g = graph(&[1, 2, 3], &[(1, 2), (2, 3)]);
        let config = RoutingConfig::default().with_untrusted_score(Some(4));
        g.set_weight(2, 5);
        assert!(g.is_untrusted(2, &config));
        assert_eq!(g.next_hop(1, 3, &config), Err(SimError::NoPath { from: 1, to: 3 }));
        // Still reachable as a destination and able to originate.
        assert_eq!(g.next_hop(1, 2, &config).unwrap(), 2);
        assert_eq!(g.next_hop(2, 3, &config).unwrap(), 3);

        let open = config.with_untrusted_score(None);
        assert_eq!(g.next_hop(1, 3, &open).unwrap(), 2);
    }

    #[test]
    fn test_expected_transmissions_prefers_good_links() {
        let mut g = graph(&[1, 2, 3, 4], &[]);
        g.add_edge(1, 2, 0.2).unwrap();
        g.add_edge(2, 4, 0.2).unwrap();
        g.add_edge(1, 3, 0.9).unwrap();
        g.add_edge(3, 4, 0.9).unwrap();
        let etx = RoutingConfig::default().with_strategy(RouteStrategy::ExpectedTransmissions);
        assert_eq!(g.next_hop(1, 4, &etx).unwrap(), 3);
        assert_eq!(g.next_hop(1, 4, &RoutingConfig::default()).unwrap(), 2);
    }
}
