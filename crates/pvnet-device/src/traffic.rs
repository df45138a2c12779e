//! Synthetic traffic for exercising a device.
//!
//! Generates packets for a fixed set of random TCP/UDP flows. Each packet
//! carries the Toeplitz hash of its flow so it can be steered with
//! [`crate::DeviceRuntime::try_send_hashed`].

use std::net::Ipv4Addr;

use bytes::Bytes;
use rand::RngExt as _;
use rand::SeedableRng;
use rand::rngs::StdRng;

use pvnet_ring::PacketDescriptor;
use pvnet_ring::packet::{ChecksumRequest, IpFamily, L4Protocol};
use pvnet_ring::rss::{FlowTuple, Toeplitz};

/// Offset of the transport header in an untagged IPv4 frame.
const IPV4_TRANSPORT_OFFSET: u16 = 14 + 20;

#[derive(Debug)]
pub struct TrafficGenerator {
    rng: StdRng,
    flows: Vec<FlowTuple>,
    toeplitz: Toeplitz,
    size: usize,
    checksum_offload: bool,
    next_flow: usize,
}

impl TrafficGenerator {
    /// `flows` random IPv4 flows, `size`-byte frames.
    pub fn new(seed: u64, flows: usize, size: usize, toeplitz: Toeplitz) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let flows = (0..flows.max(1))
            .map(|_| {
                let src = Ipv4Addr::from(rng.random::<u32>());
                let dst = Ipv4Addr::from(rng.random::<u32>());
                let l4 = if rng.random::<bool>() {
                    L4Protocol::Tcp
                } else {
                    L4Protocol::Udp
                };
                FlowTuple::v4(src, dst).with_ports(
                    l4,
                    rng.random_range(1024..u16::MAX),
                    rng.random_range(1..1024),
                )
            })
            .collect();
        TrafficGenerator {
            rng,
            flows,
            toeplitz,
            size,
            checksum_offload: false,
            next_flow: 0,
        }
    }

    /// Ask the remote to fill in IPv4 and transport checksums.
    pub fn with_checksum_offload(mut self, enabled: bool) -> Self {
        self.checksum_offload = enabled;
        self
    }

    pub fn flows(&self) -> &[FlowTuple] {
        &self.flows
    }

    /// Next packet, round-robin over the flows.
    pub fn next_packet(&mut self) -> PacketDescriptor {
        let flow = self.flows[self.next_flow % self.flows.len()];
        self.next_flow = self.next_flow.wrapping_add(1);

        let frame: Vec<u8> = (0..self.size).map(|_| self.rng.random::<u8>()).collect();
        let hash = self.toeplitz.hash_flow(&flow);
        let mut packet =
            PacketDescriptor::new(Bytes::from(frame)).with_flow_hash(hash.value, hash.kind);
        if self.checksum_offload {
            if let Some((l4, _, _)) = flow.ports {
                packet = packet.with_checksum(ChecksumRequest {
                    family: IpFamily::V4,
                    ip_header: true,
                    l4,
                    transport_offset: IPV4_TRANSPORT_OFFSET,
                });
            }
        }
        packet
    }
}

impl Iterator for TrafficGenerator {
    type Item = PacketDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_packet())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvnet_ring::packet::HashType;

    #[test]
    fn deterministic_for_seed() {
        let a: Vec<_> = TrafficGenerator::new(7, 4, 64, Toeplitz::default()).take(8).collect();
        let b: Vec<_> = TrafficGenerator::new(7, 4, 64, Toeplitz::default()).take(8).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn packets_carry_flow_hash() {
        let t = Toeplitz::default();
        let mut tg = TrafficGenerator::new(1, 3, 100, t.clone()).with_checksum_offload(true);
        let flows = tg.flows().to_vec();
        for flow in flows.iter().cycle().take(6) {
            let p = tg.next_packet();
            assert_eq!(p.len(), 100);
            let hash = p.flow_hash.unwrap();
            assert_eq!(hash.value, t.hash_flow(flow).value);
            assert!(matches!(hash.kind, HashType::TcpIpv4 | HashType::UdpIpv4));
            assert!(p.checksum.is_some());
        }
    }
}
