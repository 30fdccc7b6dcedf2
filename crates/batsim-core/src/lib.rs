//! # batsim Core Library
//!
//! Discrete-event simulator for selfish nodes in BATMAN-style wireless mesh
//! networks.
//!
//! ## Overview
//!
//! Nodes run a distance-vector style routing layer over a lossy shared radio
//! channel. Some nodes are selfish and refuse to relay other nodes' traffic.
//! Refusals raise a node's drop score, routes avoid high scores, and a
//! periodic reputation update moves nodes between the selfish and
//! cooperative classes. The library measures how traffic of both classes
//! fares over virtual time.
//!
//! - **Event queue**: virtual-time scheduler with FIFO tie-breaking
//! - **Layer stack**: application, routing and channel layers in a run-owned registry
//! - **Channel**: Friis + BPSK error model, per-link FIFOs, retransmission
//! - **Routing**: reputation-weighted Dijkstra, selfish drop accounting
//! - **Metrics**: snapshots, per-node and per-class totals, early stopping
//!
//! ## Stack
//!
//! ```text
//!  App ─ App      App         Application   (traffic source / sink)
//!     \ /          |
//!   Routing ─── Routing       RoutingLayer  (next hop, relay or refuse)
//!        \        /
//!         Channel             Channel       (delay, loss, link FIFOs)
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use batsim_core::prelude::*;
//!
//! let config = RunConfig::default().with_seed(3).with_node_num(25);
//! let result = run_simulation(config).expect("run failed");
//! println!(
//!     "selfish {} nodes, {} B received; cooperative {} nodes, {} B received",
//!     result.selfish.nodes, result.selfish.rx_bytes,
//!     result.cooperative.nodes, result.cooperative.rx_bytes,
//! );
//! ```

pub mod app;
pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod layer;
pub mod metrics;
pub mod neighbor;
pub mod packet;
pub mod reputation;
pub mod routing;
pub mod sim;
pub mod topology;

// Re-export main types
pub use app::{ApplicationLayer, FlowCounters, TrafficSource};
pub use channel::{Channel, ChannelStats, Link};
pub use config::{
    ChannelConfig, ChannelMode, EarlyStop, ErrorModel, OverflowPolicy, RadioParams, RouteStrategy,
    RoutingConfig, RunConfig, TrafficPattern,
};
pub use error::{DropReason, SimError, SimResult};
pub use event::{EventQueue, SimEvent};
pub use graph::RoutingGraph;
pub use layer::{Direction, LayerId, LayerKind, LayerRegistry, ProtocolLayer};
pub use metrics::{ClassTotals, DeliveryRecord, NodeResult, RunResult, RunStats, Snapshot};
pub use packet::{Ip, Packet, PacketHeader, Port};
pub use routing::RoutingLayer;
pub use sim::{run_simulation, FlowDirection, SimulationRun};
pub use topology::NodePosition;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{ChannelConfig, ChannelMode, ErrorModel, RoutingConfig, RunConfig, TrafficPattern};
    pub use crate::error::{DropReason, SimError, SimResult};
    pub use crate::metrics::{ClassTotals, RunResult};
    pub use crate::sim::{run_simulation, FlowDirection, SimulationRun};
    pub use crate::topology::NodePosition;
}
