//! Random topology construction
//!
//! Nodes are dropped uniformly into a `dim × dim` square, linked to their
//! closest peers within `dist_lim`, and paired into bidirectional flows.

use crate::error::{SimError, SimResult};
use crate::packet::{Ip, Port};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// First application port handed out on each node
pub const FIRST_PORT: Port = 1000;

/// Node position in 2D space (meters)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NodePosition {
    pub x: f64,
    pub y: f64,
}

impl NodePosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Distance to another node in meters
    pub fn distance_to(&self, other: &NodePosition) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Uniform position in `[0, dim)²`
    pub fn random<R: Rng + ?Sized>(dim: f64, rng: &mut R) -> Self {
        let x = rng.gen::<f64>() * dim;
        let y = rng.gen::<f64>() * dim;
        Self { x, y }
    }
}

/// Place `count` nodes with ips `1..=count`
pub fn place_nodes<R: Rng + ?Sized>(count: usize, dim: f64, rng: &mut R) -> Vec<(Ip, NodePosition)> {
    (1..=count as Ip).map(|ip| (ip, NodePosition::random(dim, rng))).collect()
}

/// Whether node `ip` starts selfish: the first `selfish_rate` fraction of ips
pub fn initially_selfish(ip: Ip, node_num: usize, selfish_rate: f64) -> bool {
    ((ip - 1) as f64 / node_num as f64) < selfish_rate
}

/// Per-attempt success probability of a link of length `distance`
pub fn link_probability(distance: f64, dist_lim: f64) -> f64 {
    if distance <= 0.0 {
        1.0
    } else {
        (-distance / dist_lim).exp()
    }
}

/// A symmetric link to create
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkPlan {
    pub a: Ip,
    pub b: Ip,
    pub distance: f64,
    pub p_succ: f64,
}

/// Link every node to at most `max_neighbors` of its closest peers within
/// `dist_lim`. A pair picked from either side is linked once.
pub fn plan_links(nodes: &[(Ip, NodePosition)], dist_lim: f64, max_neighbors: usize) -> Vec<LinkPlan> {
    let mut pairs: Vec<(Ip, Ip, f64)> = Vec::new();

    for (ip, position) in nodes {
        let mut candidates: Vec<(f64, Ip)> = nodes
            .iter()
            .filter(|(other, _)| other != ip)
            .map(|(other, pos)| (position.distance_to(pos), *other))
            .filter(|(d, _)| *d <= dist_lim)
            .collect();
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        for (distance, other) in candidates.into_iter().take(max_neighbors) {
            let key = ((*ip).min(other), (*ip).max(other));
            if !pairs.iter().any(|(a, b, _)| (*a, *b) == key) {
                pairs.push((key.0, key.1, distance));
            }
        }
    }

    pairs.sort_by(|x, y| (x.0, x.1).cmp(&(y.0, y.1)));
    pairs
        .into_iter()
        .map(|(a, b, distance)| LinkPlan { a, b, distance, p_succ: link_probability(distance, dist_lim) })
        .collect()
}

/// A bidirectional flow between two endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowPlan {
    pub src_ip: Ip,
    pub src_port: Port,
    pub dst_ip: Ip,
    pub dst_port: Port,
}

/// Hands out application ports per node, counting up from [`FIRST_PORT`].
/// Only `(ip, port)` has to be unique, so each node has its own counter.
#[derive(Debug, Clone, Default)]
pub struct PortAllocator {
    next: BTreeMap<Ip, u32>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next free port on node `ip`
    pub fn next_port(&mut self, ip: Ip) -> SimResult<Port> {
        let next = self.next.entry(ip).or_insert(FIRST_PORT as u32);
        let port = Port::try_from(*next)
            .map_err(|_| SimError::InvalidConfig(format!("application ports exhausted on node {}", ip)))?;
        *next += 1;
        Ok(port)
    }

    /// Ports for a flow between `src` and `dst`
    pub fn next_pair(&mut self, src: Ip, dst: Ip) -> SimResult<(Port, Port)> {
        Ok((self.next_port(src)?, self.next_port(dst)?))
    }
}

/// Draw a flow for each ordered pair of distinct nodes with probability `app_rate`
pub fn plan_flows<R: Rng + ?Sized>(
    ips: &[Ip],
    app_rate: f64,
    ports: &mut PortAllocator,
    rng: &mut R,
) -> SimResult<Vec<FlowPlan>> {
    let mut flows = Vec::new();
    for &src_ip in ips {
        for &dst_ip in ips {
            if src_ip == dst_ip {
                continue;
            }
            if rng.gen::<f64>() < app_rate {
                let (src_port, dst_port) = ports.next_pair(src_ip, dst_ip)?;
                flows.push(FlowPlan { src_ip, src_port, dst_ip, dst_port });
            }
        }
    }
    Ok(flows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_distance() {
        let p1 = NodePosition::new(0.0, 0.0);
        let p2 = NodePosition::new(3.0, 4.0);
        assert!((p1.distance_to(&p2) - 5.0).abs() < 0.001);
    }

    #[test]
    fn test_placement_within_area() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let nodes = place_nodes(50, 100.0, &mut rng);
        assert_eq!(nodes.len(), 50);
        assert_eq!(nodes[0].0, 1);
        assert_eq!(nodes[49].0, 50);
        for (_, pos) in &nodes {
            assert!((0.0..100.0).contains(&pos.x));
            assert!((0.0..100.0).contains(&pos.y));
        }
    }

    #[test]
    fn test_selfish_fraction() {
        let selfish: Vec<Ip> = (1..=10).filter(|ip| initially_selfish(*ip, 10, 0.3)).collect();
        assert_eq!(selfish, vec![1, 2, 3]);
        assert!(!(1..=10).any(|ip| initially_selfish(ip, 10, 0.0)));
        assert!((1..=10).all(|ip| initially_selfish(ip, 10, 1.0)));
    }

    #[test]
    fn test_link_probability() {
        assert_eq!(link_probability(0.0, 50.0), 1.0);
        assert!((link_probability(50.0, 50.0) - (-1.0f64).exp()).abs() < 1e-12);
    }

    #[test]
    fn test_links_respect_range_and_degree() {
        let nodes = vec![
            (1, NodePosition::new(0.0, 0.0)),
            (2, NodePosition::new(10.0, 0.0)),
            (3, NodePosition::new(20.0, 0.0)),
            (4, NodePosition::new(500.0, 0.0)),
        ];
        let links = plan_links(&nodes, 15.0, 10);
        let pairs: Vec<(Ip, Ip)> = links.iter().map(|l| (l.a, l.b)).collect();
        assert_eq!(pairs, vec![(1, 2), (2, 3)]);

        // Node 2 keeps only its closest peer, but node 3 still links to 2.
        let nodes = vec![
            (1, NodePosition::new(0.0, 0.0)),
            (2, NodePosition::new(1.0, 0.0)),
            (3, NodePosition::new(3.0, 0.0)),
        ];
        let links = plan_links(&nodes, 100.0, 1);
        let pairs: Vec<(Ip, Ip)> = links.iter().map(|l| (l.a, l.b)).collect();
        assert_eq!(pairs, vec![(1, 2), (2, 3)]);
    }

    #[test]
    fn test_flow_ports() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut ports = PortAllocator::new();
        let flows = plan_flows(&[1, 2, 3], 1.0, &mut ports, &mut rng).unwrap();
        assert_eq!(flows.len(), 6);
        // 1 -> 2, then 1 -> 3: node 1 moves on, node 3 starts fresh.
        assert_eq!((flows[0].src_port, flows[0].dst_port), (1000, 1000));
        assert_eq!((flows[1].src_port, flows[1].dst_port), (1001, 1000));

        let mut endpoints: Vec<(Ip, Port)> = flows
            .iter()
            .flat_map(|f| [(f.src_ip, f.src_port), (f.dst_ip, f.dst_port)])
            .collect();
        endpoints.sort();
        endpoints.dedup();
        assert_eq!(endpoints.len(), 12);

        let none = plan_flows(&[1, 2, 3], 0.0, &mut ports, &mut rng).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_ports_exhausted_per_node() {
        let mut ports = PortAllocator::new();
        for _ in FIRST_PORT..=Port::MAX - 1 {
            ports.next_port(1).unwrap();
        }
        assert_eq!(ports.next_port(1).unwrap(), Port::MAX);
        assert!(ports.next_port(1).is_err());
        // Other nodes are unaffected.
        assert_eq!(ports.next_port(2).unwrap(), FIRST_PORT);
    }
}
