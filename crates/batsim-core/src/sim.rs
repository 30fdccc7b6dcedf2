//! Simulation run
//!
//! A [`SimulationRun`] owns everything of one configuration: event queue,
//! layer registry, routing graph, packet ids and random streams. Nothing is
//! shared between runs, so independent runs may execute on separate threads.
//!
//! ## Example
//!
//! ```ignore
//! use batsim_core::prelude::*;
//!
//! let config = RunConfig::default().with_seed(7).with_node_num(30);
//! let result = SimulationRun::build(config)?.run()?;
//! println!("selfish rx: {} B", result.selfish.rx_bytes);
//! ```

use crate::app::{ApplicationLayer, TrafficSource};
use crate::channel::Channel;
use crate::config::RunConfig;
use crate::error::{DropReason, SimError, SimResult};
use crate::event::{EventQueue, SimEvent};
use crate::graph::RoutingGraph;
use crate::layer::{LayerContext, LayerId, LayerKind, LayerRegistry, Transfer};
use crate::metrics::{
    class_totals, DeliveryRecord, EarlyStopDetector, NodeResult, RunResult, RunStats, Snapshot,
};
use crate::packet::{Ip, PacketFactory, Port};
use crate::reputation::{self, ReputationChanges, ReputationPolicy};
use crate::routing::RoutingLayer;
use crate::topology::{self, NodePosition, PortAllocator};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use tracing::{debug, info, trace};

/// Traffic streams start here; endpoint `i` uses stream `APP_STREAM_BASE + i`
pub const APP_STREAM_BASE: u64 = 2;

/// Which ends of a flow generate traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDirection {
    /// Only the source sends; the destination just counts
    OneWay,
    /// Both ends send to each other
    Bidirectional,
}

/// One configured simulation
#[derive(Debug)]
pub struct SimulationRun {
    config: RunConfig,
    events: EventQueue<SimEvent>,
    layers: LayerRegistry,
    graph: RoutingGraph,
    packets: PacketFactory,
    rng: ChaCha8Rng,
    ports: PortAllocator,
    channel: LayerId,
    nodes: BTreeMap<Ip, LayerId>,
    apps: Vec<LayerId>,
    snapshots: Vec<Snapshot>,
    early_stop: Option<EarlyStopDetector>,
    early_stopped: bool,
    events_processed: u64,
    deliveries: Option<Vec<DeliveryRecord>>,
    started: bool,
}

impl SimulationRun {
    /// Empty run: a channel and no nodes. Use [`Self::add_node`],
    /// [`Self::connect`] and [`Self::add_flow`] to lay out a topology by hand.
    pub fn new(config: RunConfig) -> SimResult<Self> {
        config.validate()?;
        let mut layers = LayerRegistry::new();
        let channel = layers.add(LayerKind::Channel(Channel::new(config.channel.clone(), config.seed)));
        let early_stop = config.early_stop.map(|e| EarlyStopDetector::new(e.window, e.max_variance));

        Ok(Self {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            events: EventQueue::new(),
            layers,
            graph: RoutingGraph::new(),
            packets: PacketFactory::new(),
            ports: PortAllocator::new(),
            channel,
            nodes: BTreeMap::new(),
            apps: Vec::new(),
            snapshots: Vec::new(),
            early_stop,
            early_stopped: false,
            events_processed: 0,
            deliveries: None,
            started: false,
        })
    }

    /// Random run: `node_num` nodes in a `dim × dim` square, linked within
    /// `dist_lim`, with a bidirectional flow per ordered pair drawn at `app_rate`
    pub fn build(config: RunConfig) -> SimResult<Self> {
        let mut run = Self::new(config)?;
        let cfg = run.config.clone();

        let placed = topology::place_nodes(cfg.node_num, cfg.dim, &mut run.rng);
        for &(ip, position) in &placed {
            let selfish = topology::initially_selfish(ip, cfg.node_num, cfg.selfish_rate);
            run.add_node(ip, position, selfish)?;
        }

        let links = topology::plan_links(&placed, cfg.dist_lim, cfg.max_neighbors);
        for link in &links {
            let rtt = cfg.channel.rtt(link.distance);
            run.connect_link(link.a, link.b, link.p_succ, rtt, link.distance)?;
        }

        let ips: Vec<Ip> = placed.iter().map(|(ip, _)| *ip).collect();
        let flows = topology::plan_flows(&ips, cfg.app_rate, &mut run.ports, &mut run.rng)?;
        for flow in &flows {
            run.add_flow_on_ports(
                (flow.src_ip, flow.src_port),
                (flow.dst_ip, flow.dst_port),
                FlowDirection::Bidirectional,
            )?;
        }

        info!(
            seed = cfg.seed,
            nodes = placed.len(),
            links = links.len(),
            flows = flows.len(),
            "built random topology"
        );
        Ok(run)
    }

    /// Record every packet accepted by an application
    pub fn with_delivery_log(mut self) -> Self {
        self.deliveries = Some(Vec::new());
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Current virtual time
    pub fn now(&self) -> f64 {
        self.events.now()
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    pub fn layers(&self) -> &LayerRegistry {
        &self.layers
    }

    pub fn graph(&self) -> &RoutingGraph {
        &self.graph
    }

    pub fn channel(&self) -> SimResult<&Channel> {
        self.layers.channel(self.channel)
    }

    pub fn node(&self, ip: Ip) -> SimResult<&RoutingLayer> {
        let id = *self.nodes.get(&ip).ok_or(SimError::UnknownAddress(ip))?;
        self.layers.routing(id)
    }

    /// Addresses of all routing nodes, ascending
    pub fn node_ips(&self) -> impl Iterator<Item = Ip> + '_ {
        self.nodes.keys().copied()
    }

    pub fn endpoint(&self, id: LayerId) -> SimResult<&ApplicationLayer> {
        self.layers.application(id)
    }

    pub fn endpoints(&self) -> &[LayerId] {
        &self.apps
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// Delivered packets, when enabled with [`Self::with_delivery_log`]
    pub fn deliveries(&self) -> Option<&[DeliveryRecord]> {
        self.deliveries.as_deref()
    }

    /// Add routing node `ip` at `position`
    pub fn add_node(&mut self, ip: Ip, position: NodePosition, selfish: bool) -> SimResult<LayerId> {
        if ip == 0 {
            return Err(SimError::InvalidConfig("node address 0 is reserved".to_string()));
        }
        if self.nodes.contains_key(&ip) {
            return Err(SimError::InvalidConfig(format!("node {} added twice", ip)));
        }

        let node = RoutingLayer::new(ip, position, selfish, self.config.routing);
        let id = self.layers.add(LayerKind::Routing(node));
        self.layers.connect_upper_layer(self.channel, id)?;
        self.layers.channel_mut(self.channel)?.attach(ip, id);
        self.graph.add_node(ip);
        self.nodes.insert(ip, id);
        trace!(ip, layer = %id, selfish, "node added");
        Ok(id)
    }

    /// Link `a` and `b` with explicit link parameters. The channel distance
    /// comes from the node positions.
    pub fn connect(&mut self, a: Ip, b: Ip, p_succ: f64, rtt: f64) -> SimResult<()> {
        let distance = self.node(a)?.position().distance_to(&self.node(b)?.position());
        self.connect_link(a, b, p_succ, rtt, distance)
    }

    fn connect_link(&mut self, a: Ip, b: Ip, p_succ: f64, rtt: f64, distance: f64) -> SimResult<()> {
        let id_a = *self.nodes.get(&a).ok_or(SimError::UnknownAddress(a))?;
        let id_b = *self.nodes.get(&b).ok_or(SimError::UnknownAddress(b))?;
        self.layers.channel_mut(self.channel)?.connect(a, b, p_succ, rtt, distance)?;
        self.layers.routing_mut(id_a)?.add_neighbor(b, p_succ, rtt);
        self.layers.routing_mut(id_b)?.add_neighbor(a, p_succ, rtt);
        self.graph.add_edge(a, b, p_succ)
    }

    /// Add a flow between `src` and `dst` on the next free port pair.
    /// Returns the (source, destination) endpoint ids.
    pub fn add_flow(&mut self, src: Ip, dst: Ip, direction: FlowDirection) -> SimResult<(LayerId, LayerId)> {
        let (src_port, dst_port) = self.ports.next_pair(src, dst)?;
        self.add_flow_on_ports((src, src_port), (dst, dst_port), direction)
    }

    fn add_flow_on_ports(
        &mut self,
        src: (Ip, Port),
        dst: (Ip, Port),
        direction: FlowDirection,
    ) -> SimResult<(LayerId, LayerId)> {
        if src.0 == dst.0 {
            return Err(SimError::InvalidConfig(format!("flow from node {} to itself", src.0)));
        }
        let a = self.add_endpoint(src, dst, true)?;
        let b = self.add_endpoint(dst, src, direction == FlowDirection::Bidirectional)?;
        Ok((a, b))
    }

    fn add_endpoint(&mut self, local: (Ip, Port), remote: (Ip, Port), generates: bool) -> SimResult<LayerId> {
        let node = *self.nodes.get(&local.0).ok_or(SimError::UnknownAddress(local.0))?;
        if !self.nodes.contains_key(&remote.0) {
            return Err(SimError::UnknownAddress(remote.0));
        }

        let stream = APP_STREAM_BASE + self.apps.len() as u64;
        let source = TrafficSource::new(self.config.traffic, self.config.seed, stream);
        let app = ApplicationLayer::new(local, remote, self.config.stop_time, generates, source);
        let id = self.layers.add(LayerKind::Application(app));
        self.layers.connect_upper_layer(node, id)?;
        self.layers.routing_mut(node)?.register_app(local.1, id)?;
        self.apps.push(id);
        Ok(id)
    }

    /// Seed the queue with generator, reputation and snapshot events.
    /// Called by the first [`Self::step`] if not done explicitly.
    pub fn start(&mut self) -> SimResult<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;

        let now = self.events.now();
        for &app in &self.apps {
            if self.layers.application(app)?.generates() {
                self.events.schedule(SimEvent::Generate { app }, now)?;
            }
        }
        let update = now + self.config.update_interval;
        if update <= self.config.stop_time {
            self.events.schedule(SimEvent::ReputationUpdate, update)?;
        }
        if let Some(interval) = self.config.snapshot_interval {
            if now + interval <= self.config.stop_time {
                self.events.schedule(SimEvent::Snapshot, now + interval)?;
            }
        }

        info!(
            nodes = self.nodes.len(),
            endpoints = self.apps.len(),
            stop_time = self.config.stop_time,
            "run started"
        );
        Ok(())
    }

    /// Process one event. Returns its time, or `None` once the queue is empty.
    pub fn step(&mut self) -> SimResult<Option<f64>> {
        self.start()?;
        let Some(event) = self.events.pop_next() else {
            return Ok(None);
        };
        self.events_processed += 1;
        let now = self.events.now();

        match event.payload {
            SimEvent::Generate { app } => {
                let next = self.dispatch(app, |kind, ctx| match kind {
                    LayerKind::Application(endpoint) => endpoint.generate(ctx),
                    _ => Err(SimError::UnknownLayer(app)),
                })?;
                if let Some(when) = next {
                    self.events.schedule(SimEvent::Generate { app }, when)?;
                }
            }
            SimEvent::LinkTxDone { channel, from, to } => {
                self.dispatch(channel, |kind, ctx| match kind {
                    LayerKind::Channel(ch) => ch.complete_transmission(ctx, from, to),
                    _ => Err(SimError::UnknownLayer(channel)),
                })?;
            }
            SimEvent::ReputationUpdate => {
                self.update_selfishness();
                let next = now + self.config.update_interval;
                if next <= self.config.stop_time && !self.early_stopped {
                    self.events.schedule(SimEvent::ReputationUpdate, next)?;
                }
            }
            SimEvent::Snapshot => {
                self.take_snapshot()?;
                if let Some(interval) = self.config.snapshot_interval {
                    let next = now + interval;
                    if next <= self.config.stop_time && !self.early_stopped {
                        self.events.schedule(SimEvent::Snapshot, next)?;
                    }
                }
            }
        }
        Ok(Some(now))
    }

    /// Process every event scheduled at or before `time`
    pub fn run_until(&mut self, time: f64) -> SimResult<()> {
        self.start()?;
        while self.events.peek_time().is_some_and(|t| t <= time) {
            self.step()?;
        }
        Ok(())
    }

    /// Drain the queue and return the result record
    pub fn run(&mut self) -> SimResult<RunResult> {
        while self.step()?.is_some() {}
        let result = self.result()?;
        info!(
            events = result.stats.events_processed,
            end_time = result.stats.end_time,
            delivered = result.stats.packets_delivered,
            dropped = result.stats.total_dropped(),
            early_stopped = result.stats.early_stopped,
            "run finished"
        );
        Ok(result)
    }

    /// Apply the reputation rule to every routing node
    pub fn update_selfishness(&mut self) -> ReputationChanges {
        let policy = ReputationPolicy::new(self.config.drop_limit, self.config.routing.cooperation_quorum);
        let changes = reputation::update_selfishness(self.layers.routing_layers_mut(), &policy);
        debug!(
            now = self.events.now(),
            became_selfish = changes.became_selfish,
            became_cooperative = changes.became_cooperative,
            "reputation update"
        );
        changes
    }

    fn take_snapshot(&mut self) -> SimResult<()> {
        let nodes = self.node_results()?;
        let snapshot = Snapshot::from_nodes(self.events.now(), &nodes);
        self.snapshots.push(snapshot);

        if let Some(detector) = self.early_stop.as_mut() {
            if detector.observe(snapshot.selfish.nodes) {
                self.early_stopped = true;
                let discarded = self.events.discard_pending();
                info!(now = snapshot.time, discarded, "selfish count settled, stopping early");
            }
        }
        Ok(())
    }

    /// Run `handler` on layer `id` and deliver whatever it sent, depth-first
    fn dispatch<T>(
        &mut self,
        id: LayerId,
        handler: impl FnOnce(&mut LayerKind, &mut LayerContext<'_>) -> SimResult<T>,
    ) -> SimResult<T> {
        let layer = self.layers.get_mut(id)?;
        let mut ctx = LayerContext::new(
            id,
            &layer.adjacency,
            &mut self.events,
            &mut self.graph,
            &mut self.packets,
            &mut self.deliveries,
        );
        let value = handler(&mut layer.kind, &mut ctx)?;
        for transfer in ctx.into_outbox() {
            self.deliver(transfer)?;
        }
        Ok(value)
    }

    fn deliver(&mut self, transfer: Transfer) -> SimResult<()> {
        self.dispatch(transfer.to, |kind, ctx| kind.receive(ctx, transfer))
    }

    /// Per-node state and application traffic, ascending by ip
    pub fn node_results(&self) -> SimResult<Vec<NodeResult>> {
        let mut results = Vec::with_capacity(self.nodes.len());
        for &id in self.nodes.values() {
            let node = self.layers.routing(id)?;
            let mut tx_bytes = 0;
            let mut rx_bytes = 0;
            for &app in node.app_table().values() {
                let counters = self.layers.application(app)?.counters();
                tx_bytes += counters.tx_bytes;
                rx_bytes += counters.rx_bytes;
            }
            results.push(NodeResult {
                ip: node.ip(),
                selfish: node.selfish,
                drop_score: node.drop_score(),
                tx_bytes,
                rx_bytes,
                forwarded: node.stats().forwarded,
                dropped_selfish: node.stats().dropped(DropReason::Selfish),
            });
        }
        Ok(results)
    }

    /// Result record of the run so far
    pub fn result(&self) -> SimResult<RunResult> {
        let nodes = self.node_results()?;
        let (selfish, cooperative) = class_totals(&nodes);

        let mut stats = RunStats {
            events_processed: self.events_processed,
            end_time: self.events.now(),
            packets_created: self.packets.created(),
            early_stopped: self.early_stopped,
            ..RunStats::default()
        };
        stats.add_drops(&self.channel()?.stats().drops);
        for node in self.layers.routing_layers() {
            stats.add_drops(&node.stats().drops);
        }

        let mut latency_sum = 0.0;
        for &app in &self.apps {
            let counters = self.layers.application(app)?.counters();
            stats.packets_delivered += counters.rx_count;
            latency_sum += counters.latency_sum;
        }
        stats.mean_latency = (stats.packets_delivered > 0).then(|| latency_sum / stats.packets_delivered as f64);

        Ok(RunResult {
            config: self.config.clone(),
            nodes,
            selfish,
            cooperative,
            snapshots: self.snapshots.clone(),
            stats,
        })
    }
}

/// Build and run one random simulation
pub fn run_simulation(config: RunConfig) -> SimResult<RunResult> {
    SimulationRun::build(config)?.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, ErrorModel, TrafficPattern};

    fn manual_config() -> RunConfig {
        RunConfig::default()
            .with_stop_time(10.5)
            .with_channel(ChannelConfig::default().with_error_model(ErrorModel::LinkProbability))
            .with_traffic(TrafficPattern::Periodic { interval: 1.0, size: 100 })
            .with_reputation(100.0, 5)
    }

    #[test]
    fn test_run_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<SimulationRun>();
    }

    #[test]
    fn test_add_node_rejects_duplicates() {
        let mut run = SimulationRun::new(manual_config()).unwrap();
        run.add_node(1, NodePosition::default(), false).unwrap();
        assert!(run.add_node(1, NodePosition::default(), false).is_err());
        assert!(run.add_node(0, NodePosition::default(), false).is_err());
        assert_eq!(run.connect(1, 2, 1.0, 0.01), Err(SimError::UnknownAddress(2)));
        assert!(run.add_flow(1, 1, FlowDirection::OneWay).is_err());
    }

    #[test]
    fn test_step_advances_time() {
        let mut run = SimulationRun::new(manual_config()).unwrap();
        run.add_node(1, NodePosition::new(0.0, 0.0), false).unwrap();
        run.add_node(2, NodePosition::new(10.0, 0.0), false).unwrap();
        run.connect(1, 2, 1.0, 0.01).unwrap();
        let (src, _) = run.add_flow(1, 2, FlowDirection::OneWay).unwrap();

        assert_eq!(run.step().unwrap(), Some(0.0));
        assert_eq!(run.endpoint(src).unwrap().counters().tx_count, 1);
        assert!(run.channel().unwrap().link(1, 2).unwrap().is_busy());

        assert_eq!(run.step().unwrap(), Some(0.01));
        assert!(!run.channel().unwrap().link(1, 2).unwrap().is_busy());
    }

    #[test]
    fn test_reputation_ticks_stop_at_stop_time() {
        let config = manual_config().with_reputation(2.0, 5).with_stop_time(7.0);
        let mut run = SimulationRun::new(config).unwrap();
        run.add_node(1, NodePosition::default(), false).unwrap();

        let mut ticks = Vec::new();
        while let Some(t) = run.step().unwrap() {
            ticks.push(t);
        }
        assert_eq!(ticks, vec![2.0, 4.0, 6.0]);
        // A lone node has no cooperative neighbors.
        assert!(run.node(1).unwrap().selfish);
    }
}
