//! Mesh routing layer
//!
//! One `RoutingLayer` per node. It originates packets from its applications,
//! relays packets for others (or refuses to, when selfish), and delivers
//! packets addressed to itself to the application bound to the destination
//! port.
//!
//! ## Relay decision
//!
//! ```text
//! dst == self          → app_table[dst_port]
//! hops >= node count   → drop (hop limit)
//! selfish              → drop_score += 1, drop
//! cooperative          → forward; drop_score -= 1 (floor 0) once sent
//! ```
//!
//! The drop score is republished into the run's [`RoutingGraph`] on every
//! change so route computation reacts immediately.

use crate::config::RoutingConfig;
use crate::error::{DropReason, SimError, SimResult};
use crate::layer::{LayerContext, LayerId, ProtocolLayer};
use crate::neighbor::NeighborTable;
use crate::packet::{Ip, Packet, Port};
use crate::topology::NodePosition;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Counters of one routing node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingStats {
    /// Packets from local applications sent toward the mesh
    pub originated: u64,
    /// Packets handed to local applications
    pub delivered: u64,
    /// Transit packets relayed onward
    pub forwarded: u64,
    pub forwarded_bytes: u64,
    pub drops: BTreeMap<DropReason, u64>,
}

impl RoutingStats {
    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.drops.get(&reason).copied().unwrap_or(0)
    }
}

/// Routing layer of one mesh node
#[derive(Debug, Clone)]
pub struct RoutingLayer {
    ip: Ip,
    position: NodePosition,
    /// Whether the node currently refuses to relay
    pub selfish: bool,
    drop_score: u32,
    neighbors: NeighborTable,
    app_table: BTreeMap<Port, LayerId>,
    config: RoutingConfig,
    stats: RoutingStats,
}

impl RoutingLayer {
    pub fn new(ip: Ip, position: NodePosition, selfish: bool, config: RoutingConfig) -> Self {
        Self {
            ip,
            position,
            selfish,
            drop_score: 0,
            neighbors: NeighborTable::new(),
            app_table: BTreeMap::new(),
            config,
            stats: RoutingStats::default(),
        }
    }

    pub fn ip(&self) -> Ip {
        self.ip
    }

    pub fn position(&self) -> NodePosition {
        self.position
    }

    pub fn drop_score(&self) -> u32 {
        self.drop_score
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    pub fn stats(&self) -> &RoutingStats {
        &self.stats
    }

    /// Applications bound on this node, by port
    pub fn app_table(&self) -> &BTreeMap<Port, LayerId> {
        &self.app_table
    }

    /// Bind application layer `app` to `port`
    pub fn register_app(&mut self, port: Port, app: LayerId) -> SimResult<()> {
        if self.app_table.contains_key(&port) {
            return Err(SimError::InvalidConfig(format!("node {} port {} bound twice", self.ip, port)));
        }
        self.app_table.insert(port, app);
        Ok(())
    }

    /// Record a direct link to `ip`
    pub fn add_neighbor(&mut self, ip: Ip, p_succ: f64, rtt: f64) {
        self.neighbors.insert(ip, p_succ, rtt);
    }

    fn drop_packet(&mut self, packet: &Packet, reason: DropReason) {
        debug!(node = self.ip, packet = packet.id(), %reason, "drop");
        *self.stats.drops.entry(reason).or_default() += 1;
    }

    fn set_drop_score(&mut self, ctx: &mut LayerContext<'_>, score: u32) {
        self.drop_score = score;
        ctx.graph.set_weight(self.ip, score);
    }

    /// Pick the next hop toward the destination, stamp the header and pass
    /// the packet to the channel. Returns whether the packet was sent.
    fn route(&mut self, ctx: &mut LayerContext<'_>, mut packet: Packet) -> SimResult<bool> {
        let dst = packet.header.dst_ip;
        if ctx.graph.is_untrusted(dst, &self.config) {
            self.drop_packet(&packet, DropReason::Untrusted);
            return Ok(false);
        }

        match ctx.graph.next_hop(self.ip, dst, &self.config) {
            Ok(next_hop) => {
                packet.header.stamp_hop(self.ip, next_hop);
                self.neighbors.record_sent(next_hop, dst, packet.size());
                trace!(node = self.ip, packet = packet.id(), next_hop, "route");
                ctx.send_down(packet, None)?;
                Ok(true)
            }
            Err(err) => match err.drop_reason() {
                Some(reason) => {
                    self.drop_packet(&packet, reason);
                    Ok(false)
                }
                None => Err(err),
            },
        }
    }

    fn deliver_local(&mut self, ctx: &mut LayerContext<'_>, packet: Packet) -> SimResult<()> {
        let port = packet.header.dst_port;
        let app = *self
            .app_table
            .get(&port)
            .ok_or(SimError::UnknownPort { ip: self.ip, port })?;
        self.stats.delivered += 1;
        ctx.send_up(packet, Some(app))
    }

    fn relay(&mut self, ctx: &mut LayerContext<'_>, packet: Packet) -> SimResult<()> {
        // A loop-free path visits each node at most once.
        if packet.header.hops() >= ctx.graph.node_count() {
            self.drop_packet(&packet, DropReason::HopLimit);
            return Ok(());
        }

        if self.selfish {
            let score = self.drop_score.saturating_add(1);
            self.set_drop_score(ctx, score);
            self.drop_packet(&packet, DropReason::Selfish);
            return Ok(());
        }

        let size = packet.size() as u64;
        if self.route(ctx, packet)? {
            self.stats.forwarded += 1;
            self.stats.forwarded_bytes += size;
            let score = self.drop_score.saturating_sub(1);
            self.set_drop_score(ctx, score);
        }
        Ok(())
    }
}

impl ProtocolLayer for RoutingLayer {
    /// Origination: a local application hands over a packet
    fn recv_from_up(&mut self, ctx: &mut LayerContext<'_>, packet: Packet, _from: LayerId) -> SimResult<()> {
        if packet.header.dst_ip == self.ip {
            return self.deliver_local(ctx, packet);
        }
        self.stats.originated += 1;
        self.route(ctx, packet)?;
        Ok(())
    }

    /// A packet arrived over a link
    fn recv_from_down(&mut self, ctx: &mut LayerContext<'_>, packet: Packet, _from: LayerId) -> SimResult<()> {
        let prev_hop = packet.require_prev_hop()?;
        self.neighbors.record_received(prev_hop, packet.size());

        if packet.header.dst_ip == self.ip {
            self.deliver_local(ctx, packet)
        } else {
            self.relay(ctx, packet)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventQueue, SimEvent};
    use crate::graph::RoutingGraph;
    use crate::layer::{Adjacency, Direction, Transfer};
    use crate::metrics::DeliveryRecord;
    use crate::packet::{PacketFactory, PacketHeader};

    /// Node 2 in the chain 1 - 2 - 3, channel at L0, one app at L2
    struct Harness {
        adjacency: Adjacency,
        events: EventQueue<SimEvent>,
        graph: RoutingGraph,
        packets: PacketFactory,
        deliveries: Option<Vec<DeliveryRecord>>,
    }

    impl Harness {
        fn chain() -> Self {
            let mut graph = RoutingGraph::new();
            for ip in 1..=3 {
                graph.add_node(ip);
            }
            graph.add_edge(1, 2, 1.0).unwrap();
            graph.add_edge(2, 3, 1.0).unwrap();
            let mut adjacency = Adjacency::default();
            adjacency.add(Direction::Down, LayerId(0));
            adjacency.add(Direction::Up, LayerId(2));
            Self {
                adjacency,
                events: EventQueue::new(),
                graph,
                packets: PacketFactory::new(),
                deliveries: None,
            }
        }

        fn run(&mut self, layer: &mut RoutingLayer, direction: Direction, packet: Packet) -> SimResult<Vec<Transfer>> {
            let mut ctx = LayerContext::new(
                LayerId(1),
                &self.adjacency,
                &mut self.events,
                &mut self.graph,
                &mut self.packets,
                &mut self.deliveries,
            );
            match direction {
                Direction::Up => layer.recv_from_down(&mut ctx, packet, LayerId(0))?,
                Direction::Down => layer.recv_from_up(&mut ctx, packet, LayerId(2))?,
            }
            Ok(ctx.into_outbox())
        }

        fn transit(&mut self) -> Packet {
            let mut packet = self.packets.build(100, PacketHeader::new(1, 1000, 3, 1001)).unwrap();
            packet.header.stamp_hop(1, 2);
            packet
        }
    }

    fn node(ip: Ip, selfish: bool) -> RoutingLayer {
        let mut layer = RoutingLayer::new(ip, NodePosition::default(), selfish, RoutingConfig::default());
        layer.add_neighbor(1, 1.0, 0.01);
        layer.add_neighbor(3, 1.0, 0.01);
        layer
    }

    #[test]
    fn test_cooperative_relay_forwards() {
        let mut h = Harness::chain();
        let mut relay = node(2, false);
        relay.drop_score = 2;
        let packet = h.transit();

        let out = h.run(&mut relay, Direction::Up, packet).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].direction, Direction::Down);
        assert_eq!(out[0].packet.header.next_hop(), Some(3));
        assert_eq!(out[0].packet.header.path(), &[1, 2]);
        assert_eq!(relay.drop_score(), 1);
        assert_eq!(h.graph.weight(2), 1);
        assert_eq!(relay.stats().forwarded, 1);
        assert_eq!(relay.neighbors().get(1).unwrap().link_quality.packets_received, 1);
        assert_eq!(relay.neighbors().get(3).unwrap().via.get(&3), Some(&1));
    }

    #[test]
    fn test_selfish_relay_drops() {
        let mut h = Harness::chain();
        let mut relay = node(2, true);
        for expected in 1..=3 {
            let packet = h.transit();
            let out = h.run(&mut relay, Direction::Up, packet).unwrap();
            assert!(out.is_empty());
            assert_eq!(relay.drop_score(), expected);
        }
        assert_eq!(relay.stats().dropped(DropReason::Selfish), 3);
        assert_eq!(relay.stats().forwarded, 0);
        assert_eq!(h.graph.weight(2), 3);
    }

    #[test]
    fn test_drop_score_floors_at_zero() {
        let mut h = Harness::chain();
        let mut relay = node(2, false);
        let packet = h.transit();
        h.run(&mut relay, Direction::Up, packet).unwrap();
        assert_eq!(relay.drop_score(), 0);
    }

    #[test]
    fn test_local_delivery_and_unknown_port() {
        let mut h = Harness::chain();
        let mut dest = node(2, false);
        dest.register_app(1001, LayerId(2)).unwrap();
        assert!(dest.register_app(1001, LayerId(2)).is_err());

        let mut packet = h.packets.build(100, PacketHeader::new(1, 1000, 2, 1001)).unwrap();
        packet.header.stamp_hop(1, 2);
        let out = h.run(&mut dest, Direction::Up, packet).unwrap();
        assert_eq!(out[0].to, LayerId(2));
        assert_eq!(out[0].direction, Direction::Up);

        let mut stray = h.packets.build(100, PacketHeader::new(1, 1000, 2, 4444)).unwrap();
        stray.header.stamp_hop(1, 2);
        assert_eq!(
            h.run(&mut dest, Direction::Up, stray).unwrap_err(),
            SimError::UnknownPort { ip: 2, port: 4444 }
        );
    }

    #[test]
    fn test_missing_prev_hop_is_fatal() {
        let mut h = Harness::chain();
        let mut relay = node(2, false);
        let packet = h.packets.build(100, PacketHeader::new(1, 1000, 3, 1001)).unwrap();
        assert!(matches!(
            h.run(&mut relay, Direction::Up, packet),
            Err(SimError::MalformedHeader { field: "prev_hop", .. })
        ));
    }

    #[test]
    fn test_hop_limit() {
        let mut h = Harness::chain();
        let mut relay = node(2, false);
        let mut packet = h.transit();
        packet.header.stamp_hop(3, 1);
        packet.header.stamp_hop(1, 2);
        let out = h.run(&mut relay, Direction::Up, packet).unwrap();
        assert!(out.is_empty());
        assert_eq!(relay.stats().dropped(DropReason::HopLimit), 1);
        assert_eq!(relay.drop_score(), 0);
    }

    #[test]
    fn test_failed_relay_keeps_drop_score() {
        let mut h = Harness::chain();
        h.graph.add_node(4);
        let mut relay = node(2, false);
        relay.drop_score = 2;
        let mut packet = h.packets.build(100, PacketHeader::new(1, 1000, 4, 1001)).unwrap();
        packet.header.stamp_hop(1, 2);

        let out = h.run(&mut relay, Direction::Up, packet).unwrap();
        assert!(out.is_empty());
        assert_eq!(relay.stats().dropped(DropReason::NoPath), 1);
        assert_eq!(relay.stats().forwarded, 0);
        assert_eq!(relay.drop_score(), 2);
    }

    #[test]
    fn test_origination_without_path_is_counted() {
        let mut h = Harness::chain();
        h.graph.add_node(4);
        let mut origin = node(2, false);
        let packet = h.packets.build(100, PacketHeader::new(2, 1000, 4, 1001)).unwrap();
        let out = h.run(&mut origin, Direction::Down, packet).unwrap();
        assert!(out.is_empty());
        assert_eq!(origin.stats().originated, 1);
        assert_eq!(origin.stats().dropped(DropReason::NoPath), 1);
    }

    #[test]
    fn test_untrusted_destination() {
        let mut h = Harness::chain();
        h.graph.set_weight(3, 100);
        let mut origin = node(2, false);
        let packet = h.packets.build(100, PacketHeader::new(2, 1000, 3, 1001)).unwrap();
        let out = h.run(&mut origin, Direction::Down, packet).unwrap();
        assert!(out.is_empty());
        assert_eq!(origin.stats().dropped(DropReason::Untrusted), 1);
    }
}
