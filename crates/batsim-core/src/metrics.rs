//! Run metrics: snapshots, per-node results and the final record

use crate::config::RunConfig;
use crate::error::DropReason;
use crate::packet::Ip;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Traffic totals over the nodes of one class (selfish or cooperative)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassTotals {
    pub nodes: usize,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

impl ClassTotals {
    pub fn add(&mut self, tx_bytes: u64, rx_bytes: u64) {
        self.nodes += 1;
        self.tx_bytes += tx_bytes;
        self.rx_bytes += rx_bytes;
    }

    /// Bytes received per byte sent, if anything was sent
    pub fn delivery_ratio(&self) -> Option<f64> {
        (self.tx_bytes > 0).then(|| self.rx_bytes as f64 / self.tx_bytes as f64)
    }
}

/// Class totals at one point in virtual time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub time: f64,
    pub selfish: ClassTotals,
    pub cooperative: ClassTotals,
}

impl Snapshot {
    /// Split `nodes` by their current flag
    pub fn from_nodes(time: f64, nodes: &[NodeResult]) -> Self {
        let (selfish, cooperative) = class_totals(nodes);
        Self { time, selfish, cooperative }
    }
}

/// Totals of the selfish and the cooperative nodes
pub fn class_totals(nodes: &[NodeResult]) -> (ClassTotals, ClassTotals) {
    let mut selfish = ClassTotals::default();
    let mut cooperative = ClassTotals::default();
    for node in nodes {
        let class = if node.selfish { &mut selfish } else { &mut cooperative };
        class.add(node.tx_bytes, node.rx_bytes);
    }
    (selfish, cooperative)
}

/// Final state and traffic of one routing node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub ip: Ip,
    pub selfish: bool,
    pub drop_score: u32,
    /// Bytes sent by the node's applications
    pub tx_bytes: u64,
    /// Bytes received by the node's applications
    pub rx_bytes: u64,
    /// Transit packets relayed
    pub forwarded: u64,
    /// Transit packets refused while selfish
    pub dropped_selfish: u64,
}

/// One packet accepted by its destination application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub packet: u64,
    pub src_ip: Ip,
    pub dst_ip: Ip,
    pub size: u32,
    /// Routing nodes that transmitted it, originator first
    pub path: Vec<Ip>,
    pub latency: Option<f64>,
    /// Delivery time
    pub time: f64,
}

/// Run-level counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub events_processed: u64,
    /// Virtual time of the last event
    pub end_time: f64,
    pub packets_created: u64,
    pub packets_delivered: u64,
    pub drops: BTreeMap<DropReason, u64>,
    pub mean_latency: Option<f64>,
    pub early_stopped: bool,
}

impl RunStats {
    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.drops.get(&reason).copied().unwrap_or(0)
    }

    pub fn total_dropped(&self) -> u64 {
        self.drops.values().sum()
    }

    /// Merge a layer's drop counters
    pub fn add_drops(&mut self, drops: &BTreeMap<DropReason, u64>) {
        for (reason, count) in drops {
            *self.drops.entry(*reason).or_default() += count;
        }
    }
}

/// Serializable outcome of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub config: RunConfig,
    pub nodes: Vec<NodeResult>,
    pub selfish: ClassTotals,
    pub cooperative: ClassTotals,
    pub snapshots: Vec<Snapshot>,
    pub stats: RunStats,
}

impl RunResult {
    pub fn node(&self, ip: Ip) -> Option<&NodeResult> {
        self.nodes.iter().find(|n| n.ip == ip)
    }

    pub fn total_tx_bytes(&self) -> u64 {
        self.nodes.iter().map(|n| n.tx_bytes).sum()
    }

    pub fn total_rx_bytes(&self) -> u64 {
        self.nodes.iter().map(|n| n.rx_bytes).sum()
    }
}

/// Detects when the selfish-node count has settled over a sliding window
#[derive(Debug, Clone)]
pub struct EarlyStopDetector {
    window: usize,
    max_variance: f64,
    history: VecDeque<f64>,
}

impl EarlyStopDetector {
    pub fn new(window: usize, max_variance: f64) -> Self {
        Self { window, max_variance, history: VecDeque::with_capacity(window) }
    }

    /// Record the selfish count of a snapshot; `true` once the last `window`
    /// counts have variance ≤ `max_variance`
    pub fn observe(&mut self, selfish_nodes: usize) -> bool {
        if self.history.len() == self.window {
            self.history.pop_front();
        }
        self.history.push_back(selfish_nodes as f64);
        self.history.len() == self.window && variance(&self.history) <= self.max_variance
    }
}

fn variance(values: &VecDeque<f64>) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n
}
