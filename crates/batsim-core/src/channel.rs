//! Shared radio channel
//!
//! One `Channel` layer sits below every routing node. It owns a FIFO per link
//! direction and turns link geometry into delivery delay and loss.
//!
//! ## Error model
//!
//! ```text
//! Prx = G² · Pin · (λ / 4πd)²            free-space (Friis) received power
//! Pb  = ½ · erfc(√(Prx · Ts / No))       BPSK bit error
//! Pe  = 1 − (1 − Pb)^(8 · size)          packet error
//! ```
//!
//! With [`ErrorModel::LinkProbability`] the per-attempt success is the
//! link's `p_succ` instead.
//!
//! ## Delivery
//!
//! The head packet of a link occupies it for `attempts × rtt`. A
//! [`SimEvent::LinkTxDone`] at the end of that airtime hands the packet to the
//! receiving routing layer (or counts the drop) and starts the next one.

use crate::config::{ChannelConfig, ChannelMode, ErrorModel, OverflowPolicy, RadioParams};
use crate::error::{DropReason, SimError, SimResult};
use crate::event::SimEvent;
use crate::layer::{Direction, LayerContext, LayerId, ProtocolLayer};
use crate::packet::{Ip, Packet};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Geometric};
use std::collections::{BTreeMap, VecDeque};
use std::f64::consts::PI;
use tracing::{debug, trace, warn};

/// Random stream of the channel, apart from the run's topology stream
pub const CHANNEL_STREAM: u64 = 1;

/// Received power (W) after `distance` meters of free space.
/// Co-located nodes see no attenuation.
pub fn received_power(radio: &RadioParams, distance: f64) -> f64 {
    let gain = radio.transmit_gain * radio.transmit_gain * radio.input_power;
    if distance <= 0.0 {
        return gain;
    }
    let ratio = radio.wavelength / (4.0 * PI * distance);
    gain * ratio * ratio
}

/// BPSK bit-error probability at `distance`
pub fn bit_error_probability(radio: &RadioParams, distance: f64) -> f64 {
    if distance <= 0.0 {
        return 0.0;
    }
    let eb_no = received_power(radio, distance) * radio.symbol_period / radio.noise_power;
    0.5 * libm::erfc(eb_no.sqrt())
}

/// Probability that at least one of `bits` bits is corrupted
pub fn packet_error_probability(radio: &RadioParams, distance: f64, bits: u64) -> f64 {
    let pb = bit_error_probability(radio, distance);
    // 1 - (1 - pb)^bits without losing precision for tiny pb
    -((bits as f64) * (-pb).ln_1p()).exp_m1()
}

/// Result of drawing the attempts for one packet
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TxOutcome {
    /// Airtime the packet occupies the link for
    pub delay: f64,
    /// Attempts spent
    pub attempts: u32,
    /// `None` when delivered
    pub dropped: Option<DropReason>,
}

/// Draw the outcome of sending one packet with per-attempt success `p`
pub fn draw_outcome<R: Rng + ?Sized>(mode: ChannelMode, p: f64, rtt: f64, rng: &mut R) -> TxOutcome {
    match mode {
        ChannelMode::SingleShot => {
            let delivered = p >= 1.0 || (p > 0.0 && rng.gen::<f64>() < p);
            TxOutcome {
                delay: rtt,
                attempts: 1,
                dropped: (!delivered).then_some(DropReason::ChannelLoss),
            }
        }
        ChannelMode::Retransmit { max_attempts } => {
            let failures = if p >= 1.0 {
                0
            } else if p <= 0.0 {
                u64::MAX
            } else {
                match Geometric::new(p) {
                    Ok(geometric) => geometric.sample(rng),
                    Err(_) => u64::MAX,
                }
            };
            if failures >= max_attempts as u64 {
                TxOutcome {
                    delay: max_attempts as f64 * rtt,
                    attempts: max_attempts,
                    dropped: Some(DropReason::RetryLimit),
                }
            } else {
                let attempts = failures as u32 + 1;
                TxOutcome { delay: attempts as f64 * rtt, attempts, dropped: None }
            }
        }
    }
}

/// Per-link counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinkStats {
    /// Packets accepted onto the link
    pub queued: u64,
    pub delivered: u64,
    pub delivered_bytes: u64,
    pub dropped: u64,
    /// Transmission attempts, including retries
    pub attempts: u64,
}

#[derive(Debug, Clone)]
struct InFlight {
    packet: Packet,
    dropped: Option<DropReason>,
}

/// One direction of a radio link
#[derive(Debug, Clone)]
pub struct Link {
    pub src_ip: Ip,
    pub dst_ip: Ip,
    pub p_succ: f64,
    pub rtt: f64,
    pub distance: f64,
    queue: VecDeque<Packet>,
    in_flight: Option<InFlight>,
    pub stats: LinkStats,
}

impl Link {
    fn new(src_ip: Ip, dst_ip: Ip, p_succ: f64, rtt: f64, distance: f64) -> Self {
        Self {
            src_ip,
            dst_ip,
            p_succ,
            rtt,
            distance,
            queue: VecDeque::new(),
            in_flight: None,
            stats: LinkStats::default(),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Packets waiting behind the one on air
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

/// Channel-wide counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelStats {
    pub delivered: u64,
    pub delivered_bytes: u64,
    pub attempts: u64,
    pub drops: BTreeMap<DropReason, u64>,
}

/// The shared channel layer
#[derive(Debug)]
pub struct Channel {
    config: ChannelConfig,
    links: BTreeMap<(Ip, Ip), Link>,
    attached: BTreeMap<Ip, LayerId>,
    rng: ChaCha8Rng,
    stats: ChannelStats,
}

impl Channel {
    pub fn new(config: ChannelConfig, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        rng.set_stream(CHANNEL_STREAM);
        Self {
            config,
            links: BTreeMap::new(),
            attached: BTreeMap::new(),
            rng,
            stats: ChannelStats::default(),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Register the routing layer that owns address `ip`
    pub fn attach(&mut self, ip: Ip, layer: LayerId) {
        self.attached.insert(ip, layer);
    }

    /// Create the link pair `a -> b` and `b -> a`
    pub fn connect(&mut self, a: Ip, b: Ip, p_succ: f64, rtt: f64, distance: f64) -> SimResult<()> {
        if !(0.0..=1.0).contains(&p_succ) {
            return Err(SimError::InvalidConfig(format!("link {}-{}: p_succ {} outside [0, 1]", a, b, p_succ)));
        }
        if !(rtt.is_finite() && rtt > 0.0) {
            return Err(SimError::InvalidConfig(format!("link {}-{}: rtt must be positive", a, b)));
        }
        if a == b {
            return Err(SimError::InvalidConfig(format!("link {}-{} is a self loop", a, b)));
        }
        for ip in [a, b] {
            if !self.attached.contains_key(&ip) {
                return Err(SimError::UnknownAddress(ip));
            }
        }
        self.links.insert((a, b), Link::new(a, b, p_succ, rtt, distance));
        self.links.insert((b, a), Link::new(b, a, p_succ, rtt, distance));
        Ok(())
    }

    pub fn link(&self, from: Ip, to: Ip) -> Option<&Link> {
        self.links.get(&(from, to))
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Per-attempt success probability for `packet` on `link`
    pub fn attempt_success(&self, link: &Link, packet: &Packet) -> f64 {
        match self.config.error_model {
            ErrorModel::Friis => {
                1.0 - packet_error_probability(&self.config.radio, link.distance, packet.size_bits())
            }
            ErrorModel::LinkProbability => link.p_succ,
        }
    }

    fn record_drop(&mut self, reason: DropReason) {
        *self.stats.drops.entry(reason).or_default() += 1;
    }

    /// Put `packet` on air on the idle link `from -> to`
    fn start_transmission(&mut self, ctx: &mut LayerContext<'_>, from: Ip, to: Ip, packet: Packet) -> SimResult<()> {
        let link = self.links.get(&(from, to)).ok_or(SimError::UnknownAddress(to))?;
        let p = self.attempt_success(link, &packet);
        let rtt = link.rtt;
        let outcome = draw_outcome(self.config.mode, p, rtt, &mut self.rng);

        trace!(packet = packet.id(), from, to, p, attempts = outcome.attempts, "on air");
        self.stats.attempts += outcome.attempts as u64;
        let link = self.links.get_mut(&(from, to)).ok_or(SimError::UnknownAddress(to))?;
        link.stats.attempts += outcome.attempts as u64;
        link.in_flight = Some(InFlight { packet, dropped: outcome.dropped });

        let channel = ctx.id();
        ctx.schedule(SimEvent::LinkTxDone { channel, from, to }, ctx.now() + outcome.delay)
    }

    /// End of airtime on `from -> to`: deliver or drop the head packet and
    /// start the next queued one.
    pub fn complete_transmission(&mut self, ctx: &mut LayerContext<'_>, from: Ip, to: Ip) -> SimResult<()> {
        let link = self.links.get_mut(&(from, to)).ok_or(SimError::UnknownAddress(to))?;
        let Some(InFlight { packet, dropped }) = link.in_flight.take() else {
            warn!(from, to, "transmission completed on an idle link");
            return Ok(());
        };
        let next = link.queue.pop_front();

        match dropped {
            None => {
                link.stats.delivered += 1;
                link.stats.delivered_bytes += packet.size() as u64;
                self.stats.delivered += 1;
                self.stats.delivered_bytes += packet.size() as u64;
                let target = *self.attached.get(&to).ok_or(SimError::UnknownAddress(to))?;
                trace!(packet = packet.id(), from, to, "delivered");
                ctx.send_up(packet, Some(target))?;
            }
            Some(reason) => {
                link.stats.dropped += 1;
                debug!(packet = packet.id(), from, to, %reason, "lost on link");
                self.record_drop(reason);
            }
        }

        if let Some(packet) = next {
            self.start_transmission(ctx, from, to, packet)?;
        }
        Ok(())
    }
}

impl ProtocolLayer for Channel {
    fn recv_from_up(&mut self, ctx: &mut LayerContext<'_>, packet: Packet, _from: LayerId) -> SimResult<()> {
        let from = packet.require_prev_hop()?;
        let to = packet.require_next_hop()?;
        let limit = self.config.queue_limit;
        let overflow = self.config.overflow;

        let link = self.links.get_mut(&(from, to)).ok_or(SimError::UnknownAddress(to))?;
        link.stats.queued += 1;
        if !link.is_busy() {
            return self.start_transmission(ctx, from, to, packet);
        }

        match limit {
            Some(limit) if link.queue.len() >= limit => {
                let saturated = SimError::LinkSaturated { from, to, queued: link.queue.len() };
                let discarded = match overflow {
                    OverflowPolicy::DropNewest => packet,
                    OverflowPolicy::DropOldest => {
                        link.queue.push_back(packet);
                        match link.queue.pop_front() {
                            Some(oldest) => oldest,
                            None => return Ok(()),
                        }
                    }
                };
                link.stats.dropped += 1;
                debug!(packet = discarded.id(), "{}", saturated);
                if let Some(reason) = saturated.drop_reason() {
                    self.record_drop(reason);
                }
            }
            _ => link.queue.push_back(packet),
        }
        Ok(())
    }

    fn recv_from_down(&mut self, ctx: &mut LayerContext<'_>, _packet: Packet, _from: LayerId) -> SimResult<()> {
        Err(SimError::NoNeighbor { layer: ctx.id(), direction: Direction::Down })
    }
}
