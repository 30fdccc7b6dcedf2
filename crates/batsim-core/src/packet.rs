//! Packet types exchanged between layers
//!
//! A packet has an immutable identity (`id`, `size`) and a mutable header that
//! layers stamp as it moves through the stack.
//!
//! ## Header
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────┐
//! │ src_ip   │ src_port │ dst_ip   │ dst_port │   end-to-end 4-tuple (required)
//! ├──────────┼──────────┼──────────┼──────────┤
//! │ next_hop │ prev_hop │ tx_time  │ path     │   routing metadata (optional)
//! └──────────┴──────────┴──────────┴──────────┘
//! ```

use crate::error::{SimError, SimResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Node address. Valid addresses are strictly positive.
pub type Ip = u32;

/// Application port on a node.
pub type Port = u16;

/// Packet header with the end-to-end addressing and per-hop routing stamps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketHeader {
    /// Originating node
    pub src_ip: Ip,
    /// Originating application port
    pub src_port: Port,
    /// Final destination node
    pub dst_ip: Ip,
    /// Destination application port
    pub dst_port: Port,
    next_hop: Option<Ip>,
    prev_hop: Option<Ip>,
    tx_time: Option<f64>,
    /// Routing nodes that transmitted this packet, in order
    path: Vec<Ip>,
}

impl PacketHeader {
    /// Create a header carrying only the 4-tuple
    pub fn new(src_ip: Ip, src_port: Port, dst_ip: Ip, dst_port: Port) -> Self {
        Self {
            src_ip,
            src_port,
            dst_ip,
            dst_port,
            next_hop: None,
            prev_hop: None,
            tx_time: None,
            path: Vec::new(),
        }
    }

    /// Set the origination timestamp
    pub fn with_tx_time(mut self, tx_time: f64) -> Self {
        self.tx_time = Some(tx_time);
        self
    }

    pub fn next_hop(&self) -> Option<Ip> {
        self.next_hop
    }

    pub fn prev_hop(&self) -> Option<Ip> {
        self.prev_hop
    }

    pub fn tx_time(&self) -> Option<f64> {
        self.tx_time
    }

    pub fn path(&self) -> &[Ip] {
        &self.path
    }

    /// Number of transmissions so far
    pub fn hops(&self) -> usize {
        self.path.len()
    }

    /// Stamp the header for a transmission from `from` toward `next_hop`.
    pub fn stamp_hop(&mut self, from: Ip, next_hop: Ip) {
        self.prev_hop = Some(from);
        self.next_hop = Some(next_hop);
        self.path.push(from);
    }

    /// Nodes that relayed the packet (path minus the originator)
    pub fn relays(&self) -> &[Ip] {
        if self.path.is_empty() {
            &self.path
        } else {
            &self.path[1..]
        }
    }
}

/// A simulated data unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    id: u64,
    size: u32,
    /// Header, mutated in place by the layers
    pub header: PacketHeader,
}

impl Packet {
    /// Create a packet, validating size and addressing
    pub fn new(id: u64, size: u32, header: PacketHeader) -> SimResult<Self> {
        if size == 0 {
            return Err(SimError::InvalidConfig(format!(
                "packet {} has zero size",
                id
            )));
        }
        if header.src_ip == 0 {
            return Err(SimError::MalformedHeader { packet: id, field: "src_ip" });
        }
        if header.dst_ip == 0 {
            return Err(SimError::MalformedHeader { packet: id, field: "dst_ip" });
        }
        Ok(Self { id, size, header })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size in bytes
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Size in bits, as seen by the bit-error model
    pub fn size_bits(&self) -> u64 {
        self.size as u64 * 8
    }

    /// Next hop, or a fatal error if no routing layer stamped one
    pub fn require_next_hop(&self) -> SimResult<Ip> {
        self.header
            .next_hop()
            .ok_or(SimError::MalformedHeader { packet: self.id, field: "next_hop" })
    }

    /// Previous hop, or a fatal error if the packet never crossed a link
    pub fn require_prev_hop(&self) -> SimResult<Ip> {
        self.header
            .prev_hop()
            .ok_or(SimError::MalformedHeader { packet: self.id, field: "prev_hop" })
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {}B {}:{} -> {}:{}",
            self.id,
            self.size,
            self.header.src_ip,
            self.header.src_port,
            self.header.dst_ip,
            self.header.dst_port
        )
    }
}

/// Run-scoped packet id allocator
#[derive(Debug, Default)]
pub struct PacketFactory {
    last_id: u64,
}

impl PacketFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a packet with the next id
    pub fn build(&mut self, size: u32, header: PacketHeader) -> SimResult<Packet> {
        self.last_id += 1;
        Packet::new(self.last_id, size, header)
    }

    /// Number of packets created so far
    pub fn created(&self) -> u64 {
        self.last_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_ids_increase() {
        let mut factory = PacketFactory::new();
        let a = factory.build(100, PacketHeader::new(1, 1000, 2, 1001)).unwrap();
        let b = factory.build(120, PacketHeader::new(2, 1001, 1, 1000)).unwrap();
        assert_eq!(a.id(), 1);
        assert_eq!(b.id(), 2);
        assert_eq!(factory.created(), 2);
    }

    #[test]
    fn test_invalid_packets_rejected() {
        assert!(Packet::new(1, 0, PacketHeader::new(1, 1, 2, 2)).is_err());
        assert_eq!(
            Packet::new(1, 10, PacketHeader::new(0, 1, 2, 2)),
            Err(SimError::MalformedHeader { packet: 1, field: "src_ip" })
        );
    }

    #[test]
    fn test_missing_next_hop_is_malformed() {
        let packet = Packet::new(9, 10, PacketHeader::new(1, 1, 2, 2)).unwrap();
        assert_eq!(
            packet.require_next_hop(),
            Err(SimError::MalformedHeader { packet: 9, field: "next_hop" })
        );
        assert!(packet.header.tx_time().is_none());
    }

    #[test]
    fn test_stamp_hop_builds_path() {
        let mut header = PacketHeader::new(1, 1000, 3, 1001).with_tx_time(0.5);
        header.stamp_hop(1, 2);
        header.stamp_hop(2, 3);

        assert_eq!(header.path(), &[1, 2]);
        assert_eq!(header.relays(), &[2]);
        assert_eq!(header.prev_hop(), Some(2));
        assert_eq!(header.next_hop(), Some(3));
        assert_eq!(header.tx_time(), Some(0.5));
    }
}
