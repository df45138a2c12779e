//! # Receive-Side Scaling
//!
//! Indirection table mapping hash buckets to active queue indices, and the
//! Toeplitz hash used to place flows.
//!
//! The table is published through [`SharedRssTable`]: readers load a
//! snapshot lock-free, the manager stores a complete replacement. Every
//! published table satisfies `entry < active` for all entries, so no reader
//! can observe a dangling queue index.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::packet::{FlowHash, HashType, L4Protocol};

/// Indirection table size used when none is configured.
pub const DEFAULT_TABLE_SIZE: usize = 256;

/// Toeplitz key length.
pub const RSS_KEY_LEN: usize = 40;

/// The widely deployed default Toeplitz key.
pub const DEFAULT_RSS_KEY: [u8; RSS_KEY_LEN] = [
    0x6d, 0x5a, 0x56, 0xda, 0x25, 0x5b, 0x0e, 0xc2, 0x41, 0x67, 0x25, 0x3d, 0x43, 0xa3, 0x8f, 0xb0,
    0xd0, 0xca, 0x2b, 0xcb, 0xae, 0x7b, 0x30, 0xb4, 0x77, 0xcb, 0x2d, 0xa3, 0x80, 0x30, 0xf2, 0x0c,
    0x6a, 0x42, 0xb7, 0x3b, 0xbe, 0xac, 0x01, 0xfa,
];

// ─── Indirection table ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RssTable {
    entries: Box<[u16]>,
    active: u16,
}

impl RssTable {
    /// Default round-robin table: entry `i` maps to `i % active`.
    pub fn new(size: usize, active: u16) -> Self {
        let active = active.max(1);
        let entries = (0..size.max(1)).map(|i| (i % active as usize) as u16).collect();
        RssTable { entries, active }
    }

    /// Queue for a flow hash.
    #[inline]
    pub fn select(&self, hash: u32) -> u16 {
        self.entries[hash as usize % self.entries.len()]
    }

    /// Table for a new active queue count.
    ///
    /// Shrinking remaps each now-invalid entry to `entry % active` and leaves
    /// valid entries alone. Growing rebuilds the default distribution so the
    /// new queues receive traffic.
    pub fn resize(&self, active: u16) -> RssTable {
        let active = active.max(1);
        if active > self.active {
            return RssTable::new(self.entries.len(), active);
        }
        let entries = self
            .entries
            .iter()
            .map(|&e| if e < active { e } else { e % active })
            .collect();
        RssTable { entries, active }
    }

    pub fn entries(&self) -> &[u16] {
        &self.entries
    }

    pub fn active(&self) -> u16 {
        self.active
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every entry references an active queue.
    pub fn is_valid(&self) -> bool {
        self.entries.iter().all(|&e| e < self.active)
    }
}

/// Single-writer, many-reader handle to the current table.
#[derive(Debug)]
pub struct SharedRssTable(ArcSwap<RssTable>);

impl SharedRssTable {
    pub fn new(table: RssTable) -> Self {
        SharedRssTable(ArcSwap::from_pointee(table))
    }

    pub fn load(&self) -> Arc<RssTable> {
        self.0.load_full()
    }

    #[inline]
    pub fn select(&self, hash: u32) -> u16 {
        self.0.load().select(hash)
    }

    pub fn active(&self) -> u16 {
        self.0.load().active()
    }

    /// Publish a complete replacement table.
    pub fn store(&self, table: RssTable) {
        debug_assert!(table.is_valid());
        self.0.store(Arc::new(table));
    }

    /// Publish the current table resized for `active` queues. Returns the
    /// new table.
    pub fn resize(&self, active: u16) -> Arc<RssTable> {
        let next = Arc::new(self.0.load().resize(active));
        self.0.store(next.clone());
        next
    }
}

// ─── Toeplitz hash ──────────────────────────────────────────────────────────

/// Source and destination addresses of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowAddrs {
    V4 { src: Ipv4Addr, dst: Ipv4Addr },
    V6 { src: Ipv6Addr, dst: Ipv6Addr },
}

/// Fields a flow hash is computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTuple {
    pub addrs: FlowAddrs,
    /// Transport protocol with source and destination ports.
    pub ports: Option<(L4Protocol, u16, u16)>,
}

impl FlowTuple {
    pub fn v4(src: Ipv4Addr, dst: Ipv4Addr) -> Self {
        FlowTuple {
            addrs: FlowAddrs::V4 { src, dst },
            ports: None,
        }
    }

    pub fn v6(src: Ipv6Addr, dst: Ipv6Addr) -> Self {
        FlowTuple {
            addrs: FlowAddrs::V6 { src, dst },
            ports: None,
        }
    }

    pub fn with_ports(mut self, l4: L4Protocol, src_port: u16, dst_port: u16) -> Self {
        self.ports = Some((l4, src_port, dst_port));
        self
    }

    /// Serialize in hash input order into `out`; returns the length used.
    fn write_input(&self, out: &mut [u8; 36]) -> usize {
        let mut len = match self.addrs {
            FlowAddrs::V4 { src, dst } => {
                out[..4].copy_from_slice(&src.octets());
                out[4..8].copy_from_slice(&dst.octets());
                8
            }
            FlowAddrs::V6 { src, dst } => {
                out[..16].copy_from_slice(&src.octets());
                out[16..32].copy_from_slice(&dst.octets());
                32
            }
        };
        if let Some((L4Protocol::Tcp | L4Protocol::Udp, sp, dp)) = self.ports {
            out[len..len + 2].copy_from_slice(&sp.to_be_bytes());
            out[len + 2..len + 4].copy_from_slice(&dp.to_be_bytes());
            len += 4;
        }
        len
    }

    fn hash_type(&self) -> HashType {
        let l4 = self.ports.map(|(l4, _, _)| l4);
        match (self.addrs, l4) {
            (FlowAddrs::V4 { .. }, Some(L4Protocol::Tcp)) => HashType::TcpIpv4,
            (FlowAddrs::V4 { .. }, Some(L4Protocol::Udp)) => HashType::UdpIpv4,
            (FlowAddrs::V4 { .. }, _) => HashType::Ipv4,
            (FlowAddrs::V6 { .. }, Some(L4Protocol::Tcp)) => HashType::TcpIpv6,
            (FlowAddrs::V6 { .. }, Some(L4Protocol::Udp)) => HashType::UdpIpv6,
            (FlowAddrs::V6 { .. }, _) => HashType::Ipv6,
        }
    }
}

/// Toeplitz hash with a fixed key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toeplitz {
    key: [u8; RSS_KEY_LEN],
}

impl Default for Toeplitz {
    fn default() -> Self {
        Toeplitz::new(DEFAULT_RSS_KEY)
    }
}

impl Toeplitz {
    pub fn new(key: [u8; RSS_KEY_LEN]) -> Self {
        Toeplitz { key }
    }

    pub fn key(&self) -> &[u8; RSS_KEY_LEN] {
        &self.key
    }

    /// Hash `input`, which must be at most `RSS_KEY_LEN - 4` bytes.
    pub fn hash(&self, input: &[u8]) -> u32 {
        let key = &self.key;
        let mut window = u32::from_be_bytes([key[0], key[1], key[2], key[3]]);
        let mut result = 0u32;
        for (i, &byte) in input.iter().enumerate() {
            let next = key.get(i + 4).copied().unwrap_or(0);
            for bit in 0..8 {
                if byte & (0x80 >> bit) != 0 {
                    result ^= window;
                }
                window = (window << 1) | ((next >> (7 - bit)) & 1) as u32;
            }
        }
        result
    }

    pub fn hash_flow(&self, tuple: &FlowTuple) -> FlowHash {
        let mut input = [0u8; 36];
        let len = tuple.write_input(&mut input);
        FlowHash {
            value: self.hash(&input[..len]),
            kind: tuple.hash_type(),
        }
    }
}
