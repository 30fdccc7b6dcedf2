//! Error types for the simulation core.
//!
//! Fatal variants abort the run and are returned to the caller of
//! [`SimulationRun::run`](crate::sim::SimulationRun::run). Recoverable variants
//! are produced inside the routing and channel layers and are turned into
//! [`DropReason`] counters there; they never escape a run.

use crate::layer::{Direction, LayerId};
use crate::packet::{Ip, Port};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Simulation error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimError {
    /// Event scheduled with a NaN or infinite timestamp
    #[error("invalid event time: {0}")]
    InvalidTime(f64),

    /// `send_up`/`send_down` on a layer with no neighbor on that side
    #[error("layer {layer} has no {direction} neighbor")]
    NoNeighbor { layer: LayerId, direction: Direction },

    /// Application delivery to a port nobody listens on
    #[error("node {ip} has no application on port {port}")]
    UnknownPort { ip: Ip, port: Port },

    /// A header field required on this path is missing
    #[error("packet {packet} is missing header field `{field}`")]
    MalformedHeader { packet: u64, field: &'static str },

    /// Lookup of a layer id that was never registered
    #[error("unknown layer {0}")]
    UnknownLayer(LayerId),

    /// Address with no routing node or channel link behind it
    #[error("unknown address {0}")]
    UnknownAddress(Ip),

    /// Rejected run configuration
    #[error("configuration error: {0}")]
    InvalidConfig(String),

    /// No path from `from` to `to` in the routing graph
    #[error("no path from {from} to {to}")]
    NoPath { from: Ip, to: Ip },

    /// Link transmission queue is full
    #[error("link {from} -> {to} saturated ({queued} packets queued)")]
    LinkSaturated { from: Ip, to: Ip, queued: usize },
}

impl SimError {
    /// Whether the error is handled inside the run (packet dropped, run continues).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SimError::NoPath { .. } | SimError::LinkSaturated { .. })
    }

    /// Drop counter a recoverable error is accounted under.
    pub fn drop_reason(&self) -> Option<DropReason> {
        match self {
            SimError::NoPath { .. } => Some(DropReason::NoPath),
            SimError::LinkSaturated { .. } => Some(DropReason::LinkSaturation),
            _ => None,
        }
    }
}

/// Result type alias for simulation operations
pub type SimResult<T> = std::result::Result<T, SimError>;

/// Why a packet left the simulation without reaching its application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Selfish relay refused to forward
    Selfish,
    /// Routing graph had no path to the destination
    NoPath,
    /// Destination's reputation is past the untrusted threshold
    Untrusted,
    /// Packet travelled more hops than there are nodes
    HopLimit,
    /// Single-shot channel attempt failed
    ChannelLoss,
    /// Retransmission budget exhausted
    RetryLimit,
    /// Link queue bound exceeded
    LinkSaturation,
}

impl DropReason {
    pub const ALL: [DropReason; 7] = [
        DropReason::Selfish,
        DropReason::NoPath,
        DropReason::Untrusted,
        DropReason::HopLimit,
        DropReason::ChannelLoss,
        DropReason::RetryLimit,
        DropReason::LinkSaturation,
    ];
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DropReason::Selfish => "selfish",
            DropReason::NoPath => "no path",
            DropReason::Untrusted => "untrusted",
            DropReason::HopLimit => "hop limit",
            DropReason::ChannelLoss => "channel loss",
            DropReason::RetryLimit => "retry limit",
            DropReason::LinkSaturation => "link saturation",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_split() {
        let no_path = SimError::NoPath { from: 1, to: 4 };
        assert!(no_path.is_recoverable());
        assert_eq!(no_path.drop_reason(), Some(DropReason::NoPath));

        let port = SimError::UnknownPort { ip: 2, port: 1000 };
        assert!(!port.is_recoverable());
        assert_eq!(port.drop_reason(), None);
    }

    #[test]
    fn test_error_display() {
        let err = SimError::MalformedHeader { packet: 7, field: "next_hop" };
        assert!(err.to_string().contains("next_hop"));

        let err = SimError::NoNeighbor { layer: LayerId(3), direction: Direction::Up };
        assert_eq!(err.to_string(), "layer L3 has no upper neighbor");
    }
}
