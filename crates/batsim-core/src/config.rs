//! Run configuration
//!
//! [`RunConfig`] carries the nine core parameters of a run plus optional
//! tuning groups for the channel, routing and traffic models. Every field has
//! a default, so a JSON file only needs the values it changes:
//!
//! ```json
//! { "seed": 7, "node_num": 30, "selfish_rate": 0.2, "stop_time": 200.0 }
//! ```

use crate::error::{SimError, SimResult};
use serde::{Deserialize, Serialize};

/// Speed of light (m/s), used for propagation delay
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Radio parameters of the Friis + BPSK error model
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioParams {
    /// Antenna gain, applied at both ends (linear)
    pub transmit_gain: f64,
    /// Transmit power (W)
    pub input_power: f64,
    /// Carrier wavelength (m)
    pub wavelength: f64,
    /// Symbol duration (s)
    pub symbol_period: f64,
    /// Noise power spectral density (W/Hz)
    pub noise_power: f64,
}

impl Default for RadioParams {
    fn default() -> Self {
        Self {
            transmit_gain: 1.0,
            input_power: 1e-3,  // 1 mW
            wavelength: 0.125,  // 2.4 GHz
            symbol_period: 1e-6, // 1 Mbaud
            noise_power: 1e-18,
        }
    }
}

/// How the channel decides whether one transmission attempt succeeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorModel {
    /// Free-space path loss plus BPSK bit errors over the packet length
    #[default]
    Friis,
    /// The per-link success probability given at connect time
    LinkProbability,
}

/// How failed attempts are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMode {
    /// Retry until success, up to `max_attempts`
    Retransmit { max_attempts: u32 },
    /// One attempt; a failure loses the packet
    SingleShot,
}

impl Default for ChannelMode {
    fn default() -> Self {
        ChannelMode::Retransmit { max_attempts: 32 }
    }
}

/// What to discard when a link queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    DropNewest,
    DropOldest,
}

/// Channel model configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub error_model: ErrorModel,
    pub mode: ChannelMode,
    pub radio: RadioParams,
    /// Per-attempt processing overhead added to the propagation delay (s)
    pub processing_time: f64,
    /// Maximum packets waiting per link direction (`None` = unbounded)
    pub queue_limit: Option<usize>,
    pub overflow: OverflowPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            error_model: ErrorModel::default(),
            mode: ChannelMode::default(),
            radio: RadioParams::default(),
            processing_time: 0.001,
            queue_limit: None,
            overflow: OverflowPolicy::default(),
        }
    }
}

impl ChannelConfig {
    pub fn with_error_model(mut self, model: ErrorModel) -> Self {
        self.error_model = model;
        self
    }

    pub fn with_mode(mut self, mode: ChannelMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_queue_limit(mut self, limit: usize, overflow: OverflowPolicy) -> Self {
        self.queue_limit = Some(limit);
        self.overflow = overflow;
        self
    }

    /// Round-trip time of one attempt over `distance` meters
    pub fn rtt(&self, distance: f64) -> f64 {
        self.processing_time + distance / SPEED_OF_LIGHT
    }

    pub fn validate(&self) -> SimResult<()> {
        if let ChannelMode::Retransmit { max_attempts: 0 } = self.mode {
            return Err(invalid("channel.mode.max_attempts must be at least 1"));
        }
        if !(self.processing_time.is_finite() && self.processing_time > 0.0) {
            return Err(invalid("channel.processing_time must be positive"));
        }
        if self.queue_limit == Some(0) {
            return Err(invalid("channel.queue_limit must be at least 1"));
        }
        let radio = &self.radio;
        let positive = [
            ("transmit_gain", radio.transmit_gain),
            ("input_power", radio.input_power),
            ("wavelength", radio.wavelength),
            ("symbol_period", radio.symbol_period),
            ("noise_power", radio.noise_power),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(invalid(&format!("channel.radio.{} must be positive", name)));
            }
        }
        Ok(())
    }
}

/// Edge-cost function used by Dijkstra
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStrategy {
    /// `base + (w(u) + w(v)) / 2`
    #[default]
    ShortestPath,
    /// `base / p_succ + (w(u) + w(v)) / 2`
    ExpectedTransmissions,
}

/// Routing layer configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Cost of one hop before reputation weighting
    pub base_link_cost: f64,
    /// Drop score past which a node is never used as a relay (`None` = off)
    pub untrusted_score: Option<u32>,
    /// Cooperative neighbors a node needs to stay cooperative
    pub cooperation_quorum: usize,
    pub strategy: RouteStrategy,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            base_link_cost: 1.0,
            untrusted_score: Some(50),
            cooperation_quorum: 2,
            strategy: RouteStrategy::default(),
        }
    }
}

impl RoutingConfig {
    pub fn with_strategy(mut self, strategy: RouteStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_untrusted_score(mut self, score: Option<u32>) -> Self {
        self.untrusted_score = score;
        self
    }

    pub fn with_cooperation_quorum(mut self, quorum: usize) -> Self {
        self.cooperation_quorum = quorum;
        self
    }

    pub fn validate(&self) -> SimResult<()> {
        if !(self.base_link_cost.is_finite() && self.base_link_cost > 0.0) {
            return Err(invalid("routing.base_link_cost must be positive"));
        }
        Ok(())
    }
}

/// Arrival process of an application endpoint
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrafficPattern {
    /// Inter-arrival uniform in `[0, max_interarrival)`, size uniform in
    /// `[min_size, max_size]`
    Uniform { max_interarrival: f64, min_size: u32, max_size: u32 },
    /// Fixed interval and size
    Periodic { interval: f64, size: u32 },
}

impl Default for TrafficPattern {
    fn default() -> Self {
        TrafficPattern::Uniform { max_interarrival: 10.0, min_size: 100, max_size: 200 }
    }
}

impl TrafficPattern {
    pub fn validate(&self) -> SimResult<()> {
        match *self {
            TrafficPattern::Uniform { max_interarrival, min_size, max_size } => {
                if !(max_interarrival.is_finite() && max_interarrival > 0.0) {
                    return Err(invalid("traffic.max_interarrival must be positive"));
                }
                if min_size == 0 || min_size > max_size {
                    return Err(invalid("traffic sizes must satisfy 0 < min_size <= max_size"));
                }
            }
            TrafficPattern::Periodic { interval, size } => {
                if !(interval.is_finite() && interval > 0.0) {
                    return Err(invalid("traffic.interval must be positive"));
                }
                if size == 0 {
                    return Err(invalid("traffic.size must be positive"));
                }
            }
        }
        Ok(())
    }
}

/// Stop once the selfish-node count has settled
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EarlyStop {
    /// Number of most recent snapshots considered
    pub window: usize,
    /// Largest variance of the selfish count that counts as settled
    pub max_variance: f64,
}

/// Full configuration of one simulation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Seed of every random stream in the run
    pub seed: u64,
    /// Number of routing nodes
    pub node_num: usize,
    /// Side of the square area nodes are placed in (m)
    pub dim: f64,
    /// Maximum link distance (m)
    pub dist_lim: f64,
    /// Probability that an ordered node pair gets a flow
    pub app_rate: f64,
    /// Fraction of nodes that start selfish
    pub selfish_rate: f64,
    /// Virtual time after which no new traffic is generated (s)
    pub stop_time: f64,
    /// Period of the reputation update (s)
    pub update_interval: f64,
    /// Drop score past which a selfish node turns cooperative
    pub drop_limit: u32,
    /// Period of metric snapshots (`None` = no snapshots)
    pub snapshot_interval: Option<f64>,
    pub early_stop: Option<EarlyStop>,
    /// Links per node, closest first
    pub max_neighbors: usize,
    pub channel: ChannelConfig,
    pub routing: RoutingConfig,
    pub traffic: TrafficPattern,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            node_num: 20,
            dim: 100.0,
            dist_lim: 100.0,
            app_rate: 0.05,
            selfish_rate: 0.3,
            stop_time: 100.0,
            update_interval: 1.0,
            drop_limit: 5,
            snapshot_interval: None,
            early_stop: None,
            max_neighbors: 10,
            channel: ChannelConfig::default(),
            routing: RoutingConfig::default(),
            traffic: TrafficPattern::default(),
        }
    }
}

impl RunConfig {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_node_num(mut self, node_num: usize) -> Self {
        self.node_num = node_num;
        self
    }

    pub fn with_area(mut self, dim: f64, dist_lim: f64) -> Self {
        self.dim = dim;
        self.dist_lim = dist_lim;
        self
    }

    pub fn with_rates(mut self, app_rate: f64, selfish_rate: f64) -> Self {
        self.app_rate = app_rate;
        self.selfish_rate = selfish_rate;
        self
    }

    pub fn with_stop_time(mut self, stop_time: f64) -> Self {
        self.stop_time = stop_time;
        self
    }

    pub fn with_reputation(mut self, update_interval: f64, drop_limit: u32) -> Self {
        self.update_interval = update_interval;
        self.drop_limit = drop_limit;
        self
    }

    pub fn with_snapshots(mut self, interval: f64) -> Self {
        self.snapshot_interval = Some(interval);
        self
    }

    pub fn with_early_stop(mut self, window: usize, max_variance: f64) -> Self {
        self.early_stop = Some(EarlyStop { window, max_variance });
        self
    }

    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_routing(mut self, routing: RoutingConfig) -> Self {
        self.routing = routing;
        self
    }

    pub fn with_traffic(mut self, traffic: TrafficPattern) -> Self {
        self.traffic = traffic;
        self
    }

    /// Reject configurations a run cannot execute
    pub fn validate(&self) -> SimResult<()> {
        if self.node_num == 0 {
            return Err(invalid("node_num must be at least 1"));
        }
        if u32::try_from(self.node_num).is_err() {
            return Err(invalid("node_num does not fit the address space"));
        }
        if !(self.dim.is_finite() && self.dim > 0.0) {
            return Err(invalid("dim must be positive"));
        }
        if !(self.dist_lim.is_finite() && self.dist_lim > 0.0) {
            return Err(invalid("dist_lim must be positive"));
        }
        if !(0.0..=1.0).contains(&self.app_rate) {
            return Err(invalid("app_rate must lie in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.selfish_rate) {
            return Err(invalid("selfish_rate must lie in [0, 1]"));
        }
        if !(self.stop_time.is_finite() && self.stop_time > 0.0) {
            return Err(invalid("stop_time must be positive"));
        }
        if !(self.update_interval.is_finite() && self.update_interval > 0.0) {
            return Err(invalid("update_interval must be positive"));
        }
        if let Some(interval) = self.snapshot_interval {
            if !(interval.is_finite() && interval > 0.0) {
                return Err(invalid("snapshot_interval must be positive"));
            }
        }
        if let Some(early) = self.early_stop {
            if self.snapshot_interval.is_none() {
                return Err(invalid("early_stop requires snapshot_interval"));
            }
            if early.window < 2 {
                return Err(invalid("early_stop.window must be at least 2"));
            }
            if !(early.max_variance.is_finite() && early.max_variance >= 0.0) {
                return Err(invalid("early_stop.max_variance must be non-negative"));
            }
        }
        self.channel.validate()?;
        self.routing.validate()?;
        self.traffic.validate()
    }
}

fn invalid(message: &str) -> SimError {
    SimError::InvalidConfig(message.to_string())
}
