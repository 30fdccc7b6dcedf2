//! Application endpoints
//!
//! An `ApplicationLayer` is one end of a flow: bound to `(local_ip,
//! local_port)` on its routing node and talking to a fixed remote
//! `(dst_ip, dst_port)`. A generating endpoint fires a
//! [`SimEvent::Generate`](crate::event::SimEvent::Generate) event, sends one
//! packet, and asks the run to fire it again after the next inter-arrival
//! time, until `stop_time`.

use crate::config::TrafficPattern;
use crate::error::{SimError, SimResult};
use crate::layer::{Direction, LayerContext, LayerId, ProtocolLayer};
use crate::metrics::DeliveryRecord;
use crate::packet::{Ip, Packet, PacketHeader, Port};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Deterministic `(size, inter_arrival)` sequence of one endpoint
#[derive(Debug, Clone)]
pub struct TrafficSource {
    pattern: TrafficPattern,
    rng: ChaCha8Rng,
}

impl TrafficSource {
    /// Stream `stream` of the run seeded with `seed`
    pub fn new(pattern: TrafficPattern, seed: u64, stream: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        rng.set_stream(stream);
        Self { pattern, rng }
    }

    /// Next packet size (bytes) and the time until the following packet (s)
    pub fn next_packet(&mut self) -> (u32, f64) {
        match self.pattern {
            TrafficPattern::Uniform { max_interarrival, min_size, max_size } => {
                let size = self.rng.gen_range(min_size..=max_size);
                let inter_arrival = self.rng.gen::<f64>() * max_interarrival;
                (size, inter_arrival)
            }
            TrafficPattern::Periodic { interval, size } => (size, interval),
        }
    }
}

/// Traffic counters of one endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowCounters {
    pub tx_count: u64,
    pub tx_bytes: u64,
    pub rx_count: u64,
    pub rx_bytes: u64,
    /// Packets that reached this endpoint with a foreign 4-tuple
    pub rx_ignored: u64,
    /// Sum of end-to-end latencies of accepted packets (s)
    pub latency_sum: f64,
}

impl FlowCounters {
    pub fn mean_latency(&self) -> Option<f64> {
        (self.rx_count > 0).then(|| self.latency_sum / self.rx_count as f64)
    }
}

/// One end of a flow
#[derive(Debug, Clone)]
pub struct ApplicationLayer {
    pub local_ip: Ip,
    pub local_port: Port,
    pub dst_ip: Ip,
    pub dst_port: Port,
    stop_time: f64,
    /// Whether this endpoint sends, or only receives
    generates: bool,
    source: TrafficSource,
    counters: FlowCounters,
}

impl ApplicationLayer {
    pub fn new(
        local: (Ip, Port),
        remote: (Ip, Port),
        stop_time: f64,
        generates: bool,
        source: TrafficSource,
    ) -> Self {
        Self {
            local_ip: local.0,
            local_port: local.1,
            dst_ip: remote.0,
            dst_port: remote.1,
            stop_time,
            generates,
            source,
            counters: FlowCounters::default(),
        }
    }

    pub fn generates(&self) -> bool {
        self.generates
    }

    pub fn counters(&self) -> &FlowCounters {
        &self.counters
    }

    /// Send one packet; returns when to fire next, or `None` once past
    /// `stop_time`
    pub fn generate(&mut self, ctx: &mut LayerContext<'_>) -> SimResult<Option<f64>> {
        let now = ctx.now();
        let (size, inter_arrival) = self.source.next_packet();
        if now + inter_arrival >= self.stop_time {
            trace!(ip = self.local_ip, port = self.local_port, now, "generator done");
            return Ok(None);
        }

        let header = PacketHeader::new(self.local_ip, self.local_port, self.dst_ip, self.dst_port).with_tx_time(now);
        let packet = ctx.packets.build(size, header)?;
        self.counters.tx_count += 1;
        self.counters.tx_bytes += size as u64;
        trace!(%packet, now, "generate");
        ctx.send_down(packet, None)?;
        Ok(Some(now + inter_arrival))
    }

    fn accepts(&self, packet: &Packet) -> bool {
        let h = &packet.header;
        h.dst_ip == self.local_ip && h.dst_port == self.local_port && h.src_ip == self.dst_ip && h.src_port == self.dst_port
    }
}

impl ProtocolLayer for ApplicationLayer {
    fn recv_from_up(&mut self, ctx: &mut LayerContext<'_>, _packet: Packet, _from: LayerId) -> SimResult<()> {
        Err(SimError::NoNeighbor { layer: ctx.id(), direction: Direction::Up })
    }

    fn recv_from_down(&mut self, ctx: &mut LayerContext<'_>, packet: Packet, _from: LayerId) -> SimResult<()> {
        if !self.accepts(&packet) {
            trace!(%packet, ip = self.local_ip, port = self.local_port, "ignored");
            self.counters.rx_ignored += 1;
            return Ok(());
        }

        let now = ctx.now();
        let latency = packet.header.tx_time().map(|sent| now - sent);
        self.counters.rx_count += 1;
        self.counters.rx_bytes += packet.size() as u64;
        self.counters.latency_sum += latency.unwrap_or(0.0);

        if let Some(log) = ctx.deliveries.as_mut() {
            log.push(DeliveryRecord {
                packet: packet.id(),
                src_ip: packet.header.src_ip,
                dst_ip: packet.header.dst_ip,
                size: packet.size(),
                path: packet.header.path().to_vec(),
                latency,
                time: now,
            });
        }
        Ok(())
    }
}
