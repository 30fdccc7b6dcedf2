//! Protocol stack plumbing
//!
//! Every protocol entity in a run (application endpoint, routing node, the
//! shared channel) is a [`Layer`] in a run-owned [`LayerRegistry`]. Layers know
//! their neighbors only by [`LayerId`]; a handler never holds a reference to
//! another layer.
//!
//! ```text
//!   App(1000)   App(1001)          upper
//!        \        /                  ▲
//!       Routing(ip=1)    Routing(ip=2)
//!              \            /        │
//!               \          /         ▼
//!                 Channel           lower
//! ```
//!
//! Handlers receive a [`LayerContext`] that exposes the run's shared state and
//! an outbox. `send_up`/`send_down` push onto the outbox; the run dispatches the
//! outbox depth-first as soon as the handler returns, which gives the same
//! observable order as a direct synchronous call.

use crate::app::ApplicationLayer;
use crate::channel::Channel;
use crate::error::{SimError, SimResult};
use crate::event::{EventQueue, SimEvent};
use crate::graph::RoutingGraph;
use crate::metrics::DeliveryRecord;
use crate::packet::{Packet, PacketFactory};
use crate::routing::RoutingLayer;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Run-scoped layer identifier (index into the registry)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LayerId(pub usize);

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Side of a layer a message travels to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "upper"),
            Direction::Down => write!(f, "lower"),
        }
    }
}

/// Upper and lower neighbors of a layer. The first entry on each side is the
/// default target.
#[derive(Debug, Clone, Default)]
pub struct Adjacency {
    upper: Vec<LayerId>,
    lower: Vec<LayerId>,
}

impl Adjacency {
    pub fn neighbors(&self, direction: Direction) -> &[LayerId] {
        match direction {
            Direction::Up => &self.upper,
            Direction::Down => &self.lower,
        }
    }

    pub fn default_neighbor(&self, direction: Direction) -> Option<LayerId> {
        self.neighbors(direction).first().copied()
    }

    pub(crate) fn add(&mut self, direction: Direction, id: LayerId) {
        let side = match direction {
            Direction::Up => &mut self.upper,
            Direction::Down => &mut self.lower,
        };
        if !side.contains(&id) {
            side.push(id);
        }
    }
}

/// A packet in transit between two adjacent layers
#[derive(Debug, Clone)]
pub struct Transfer {
    pub from: LayerId,
    pub to: LayerId,
    pub direction: Direction,
    pub packet: Packet,
}

/// Handler view of the run: shared state plus an outbox of pending transfers.
pub struct LayerContext<'a> {
    id: LayerId,
    adjacency: &'a Adjacency,
    /// Event queue of the run (for deferred work)
    pub events: &'a mut EventQueue<SimEvent>,
    /// Run-wide routing graph
    pub graph: &'a mut RoutingGraph,
    /// Run-scoped packet id allocator
    pub packets: &'a mut PacketFactory,
    /// Delivered-packet trace, when the run records one
    pub deliveries: &'a mut Option<Vec<DeliveryRecord>>,
    outbox: Vec<Transfer>,
}

impl<'a> LayerContext<'a> {
    pub fn new(
        id: LayerId,
        adjacency: &'a Adjacency,
        events: &'a mut EventQueue<SimEvent>,
        graph: &'a mut RoutingGraph,
        packets: &'a mut PacketFactory,
        deliveries: &'a mut Option<Vec<DeliveryRecord>>,
    ) -> Self {
        Self {
            id,
            adjacency,
            events,
            graph,
            packets,
            deliveries,
            outbox: Vec::new(),
        }
    }

    /// Id of the layer currently handling
    pub fn id(&self) -> LayerId {
        self.id
    }

    /// Current virtual time
    pub fn now(&self) -> f64 {
        self.events.now()
    }

    /// Schedule deferred work at absolute time `when`
    pub fn schedule(&mut self, event: SimEvent, when: f64) -> SimResult<()> {
        self.events.schedule(event, when)
    }

    /// Pass `packet` to an upper neighbor (`None` = default)
    pub fn send_up(&mut self, packet: Packet, target: Option<LayerId>) -> SimResult<()> {
        self.send(Direction::Up, packet, target)
    }

    /// Pass `packet` to a lower neighbor (`None` = default)
    pub fn send_down(&mut self, packet: Packet, target: Option<LayerId>) -> SimResult<()> {
        self.send(Direction::Down, packet, target)
    }

    fn send(&mut self, direction: Direction, packet: Packet, target: Option<LayerId>) -> SimResult<()> {
        let to = match target {
            Some(id) => self.adjacency.neighbors(direction).contains(&id).then_some(id),
            None => self.adjacency.default_neighbor(direction),
        }
        .ok_or(SimError::NoNeighbor { layer: self.id, direction })?;
        self.outbox.push(Transfer { from: self.id, to, direction, packet });
        Ok(())
    }

    /// Transfers queued by the handler, in send order
    pub fn into_outbox(self) -> Vec<Transfer> {
        self.outbox
    }
}

/// Behaviour shared by every layer kind
pub trait ProtocolLayer {
    /// A packet arrives from an upper neighbor
    fn recv_from_up(&mut self, ctx: &mut LayerContext<'_>, packet: Packet, from: LayerId) -> SimResult<()>;

    /// A packet arrives from a lower neighbor
    fn recv_from_down(&mut self, ctx: &mut LayerContext<'_>, packet: Packet, from: LayerId) -> SimResult<()>;
}

/// The closed set of layer kinds a run is built from
#[derive(Debug)]
pub enum LayerKind {
    Application(ApplicationLayer),
    Routing(RoutingLayer),
    Channel(Channel),
}

impl LayerKind {
    fn protocol(&mut self) -> &mut dyn ProtocolLayer {
        match self {
            LayerKind::Application(app) => app,
            LayerKind::Routing(node) => node,
            LayerKind::Channel(channel) => channel,
        }
    }

    /// Hand a transfer to this layer's receive handler
    pub fn receive(&mut self, ctx: &mut LayerContext<'_>, transfer: Transfer) -> SimResult<()> {
        let Transfer { from, direction, packet, .. } = transfer;
        match direction {
            // Travelling up means it came from below.
            Direction::Up => self.protocol().recv_from_down(ctx, packet, from),
            Direction::Down => self.protocol().recv_from_up(ctx, packet, from),
        }
    }
}

/// A registered layer: identity, adjacency and behaviour
#[derive(Debug)]
pub struct Layer {
    pub id: LayerId,
    pub adjacency: Adjacency,
    pub kind: LayerKind,
}

/// Run-owned arena of layers, indexed by [`LayerId`]
#[derive(Debug, Default)]
pub struct LayerRegistry {
    layers: Vec<Layer>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a layer and return its id
    pub fn add(&mut self, kind: LayerKind) -> LayerId {
        let id = LayerId(self.layers.len());
        self.layers.push(Layer { id, adjacency: Adjacency::default(), kind });
        id
    }

    pub fn get(&self, id: LayerId) -> SimResult<&Layer> {
        self.layers.get(id.0).ok_or(SimError::UnknownLayer(id))
    }

    pub fn get_mut(&mut self, id: LayerId) -> SimResult<&mut Layer> {
        self.layers.get_mut(id.0).ok_or(SimError::UnknownLayer(id))
    }

    /// Make `upper` an upper neighbor of `lower` (and `lower` a lower neighbor of `upper`)
    pub fn connect_upper_layer(&mut self, lower: LayerId, upper: LayerId) -> SimResult<()> {
        self.get(upper)?;
        self.get_mut(lower)?.adjacency.add(Direction::Up, upper);
        self.get_mut(upper)?.adjacency.add(Direction::Down, lower);
        Ok(())
    }

    /// Make `lower` a lower neighbor of `upper`; same effect as [`Self::connect_upper_layer`]
    pub fn connect_lower_layer(&mut self, upper: LayerId, lower: LayerId) -> SimResult<()> {
        self.connect_upper_layer(lower, upper)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Layer> {
        self.layers.iter()
    }

    pub fn routing_layers(&self) -> impl Iterator<Item = &RoutingLayer> {
        self.layers.iter().filter_map(|layer| match &layer.kind {
            LayerKind::Routing(node) => Some(node),
            _ => None,
        })
    }

    pub fn routing_layers_mut(&mut self) -> impl Iterator<Item = &mut RoutingLayer> {
        self.layers.iter_mut().filter_map(|layer| match &mut layer.kind {
            LayerKind::Routing(node) => Some(node),
            _ => None,
        })
    }

    pub fn application(&self, id: LayerId) -> SimResult<&ApplicationLayer> {
        match &self.get(id)?.kind {
            LayerKind::Application(app) => Ok(app),
            _ => Err(SimError::UnknownLayer(id)),
        }
    }

    pub fn application_mut(&mut self, id: LayerId) -> SimResult<&mut ApplicationLayer> {
        match &mut self.get_mut(id)?.kind {
            LayerKind::Application(app) => Ok(app),
            _ => Err(SimError::UnknownLayer(id)),
        }
    }

    pub fn routing(&self, id: LayerId) -> SimResult<&RoutingLayer> {
        match &self.get(id)?.kind {
            LayerKind::Routing(node) => Ok(node),
            _ => Err(SimError::UnknownLayer(id)),
        }
    }

    pub fn routing_mut(&mut self, id: LayerId) -> SimResult<&mut RoutingLayer> {
        match &mut self.get_mut(id)?.kind {
            LayerKind::Routing(node) => Ok(node),
            _ => Err(SimError::UnknownLayer(id)),
        }
    }

    pub fn channel(&self, id: LayerId) -> SimResult<&Channel> {
        match &self.get(id)?.kind {
            LayerKind::Channel(channel) => Ok(channel),
            _ => Err(SimError::UnknownLayer(id)),
        }
    }

    pub fn channel_mut(&mut self, id: LayerId) -> SimResult<&mut Channel> {
        match &mut self.get_mut(id)?.kind {
            LayerKind::Channel(channel) => Ok(channel),
            _ => Err(SimError::UnknownLayer(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::packet::PacketHeader;

    fn channel_kind() -> LayerKind {
        LayerKind::Channel(Channel::new(ChannelConfig::default(), 7))
    }

    #[test]
    fn test_connect_registers_both_sides() {
        let mut registry = LayerRegistry::new();
        let lower = registry.add(channel_kind());
        let upper = registry.add(channel_kind());
        registry.connect_upper_layer(lower, upper).unwrap();
        // Connecting twice is a no-op.
        registry.connect_lower_layer(upper, lower).unwrap();

        let lower_adj = &registry.get(lower).unwrap().adjacency;
        let upper_adj = &registry.get(upper).unwrap().adjacency;
        assert_eq!(lower_adj.neighbors(Direction::Up), &[upper]);
        assert_eq!(upper_adj.neighbors(Direction::Down), &[lower]);
        assert!(upper_adj.neighbors(Direction::Up).is_empty());
    }

    #[test]
    fn test_unknown_layer() {
        let mut registry = LayerRegistry::new();
        let only = registry.add(channel_kind());
        assert_eq!(
            registry.connect_upper_layer(only, LayerId(5)).unwrap_err(),
            SimError::UnknownLayer(LayerId(5))
        );
        assert!(registry.routing(only).is_err());
        assert!(registry.channel(only).is_ok());
    }

    #[test]
    fn test_send_without_neighbor_fails() {
        let adjacency = Adjacency::default();
        let mut events = EventQueue::new();
        let mut graph = RoutingGraph::new();
        let mut packets = PacketFactory::new();
        let mut deliveries = None;
        let mut ctx = LayerContext::new(
            LayerId(0),
            &adjacency,
            &mut events,
            &mut graph,
            &mut packets,
            &mut deliveries,
        );

        let packet = ctx.packets.build(10, PacketHeader::new(1, 1, 2, 2)).unwrap();
        assert_eq!(
            ctx.send_up(packet, None),
            Err(SimError::NoNeighbor { layer: LayerId(0), direction: Direction::Up })
        );
        assert!(ctx.into_outbox().is_empty());
    }

    #[test]
    fn test_send_targets_default_or_named_neighbor() {
        let mut adjacency = Adjacency::default();
        adjacency.add(Direction::Up, LayerId(4));
        adjacency.add(Direction::Up, LayerId(9));

        let mut events = EventQueue::new();
        let mut graph = RoutingGraph::new();
        let mut packets = PacketFactory::new();
        let mut deliveries = None;
        let mut ctx = LayerContext::new(
            LayerId(1),
            &adjacency,
            &mut events,
            &mut graph,
            &mut packets,
            &mut deliveries,
        );

        let a = ctx.packets.build(10, PacketHeader::new(1, 1, 2, 2)).unwrap();
        let b = ctx.packets.build(10, PacketHeader::new(1, 1, 2, 2)).unwrap();
        let c = ctx.packets.build(10, PacketHeader::new(1, 1, 2, 2)).unwrap();
        ctx.send_up(a, None).unwrap();
        ctx.send_up(b, Some(LayerId(9))).unwrap();
        assert!(ctx.send_up(c, Some(LayerId(2))).is_err());

        let targets: Vec<_> = ctx.into_outbox().iter().map(|t| t.to).collect();
        assert_eq!(targets, vec![LayerId(4), LayerId(9)]);
    }
}
