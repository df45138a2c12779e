//! # Packet Descriptor
//!
//! Logical packet handed to a transmit ring or produced by a receive ring:
//! frame bytes plus optional offload metadata.

use bytes::Bytes;

/// Ethernet header length without a VLAN tag.
pub const ETH_HEADER_LEN: usize = 14;

/// 802.1Q tag length.
pub const VLAN_TAG_LEN: usize = 4;

// ─── VLAN ───────────────────────────────────────────────────────────────────

/// 802.1Q tag carried out-of-band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VlanTag {
    /// VLAN identifier (12 bits).
    pub vlan_id: u16,
    /// Priority code point (3 bits).
    pub priority: u8,
}

impl VlanTag {
    pub const MAX_ID: u16 = 0x0FFF;

    /// Returns `None` if either field exceeds its bit width.
    pub fn new(vlan_id: u16, priority: u8) -> Option<Self> {
        if vlan_id > Self::MAX_ID || priority > 7 {
            return None;
        }
        Some(VlanTag { vlan_id, priority })
    }

    /// Tag control information: PCP(3) | DEI(1) | VID(12).
    pub fn tci(&self) -> u16 {
        ((self.priority as u16) << 13) | (self.vlan_id & Self::MAX_ID)
    }

    pub fn from_tci(tci: u16) -> Self {
        VlanTag {
            vlan_id: tci & Self::MAX_ID,
            priority: (tci >> 13) as u8,
        }
    }
}

// ─── Checksum offload ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L4Protocol {
    Tcp,
    Udp,
    Other,
}

/// Checksum work the remote side should perform on transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumRequest {
    pub family: IpFamily,
    /// Compute the IPv4 header checksum.
    pub ip_header: bool,
    pub l4: L4Protocol,
    /// Offset of the transport header from the start of the frame.
    pub transport_offset: u16,
}

/// What the remote side reports about one checksum.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumState {
    /// Not reported. Upper layers apply their own policy.
    #[default]
    Unknown,
    Verified,
    Failed,
}

/// Checksum validation reported on receive.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumStatus {
    pub ip: ChecksumState,
    pub l4: ChecksumState,
}

impl ChecksumStatus {
    /// True only when the remote explicitly verified the transport checksum
    /// and did not flag the IP header.
    pub fn trusted(&self) -> bool {
        self.l4 == ChecksumState::Verified && self.ip != ChecksumState::Failed
    }

    pub fn is_unknown(&self) -> bool {
        self.ip == ChecksumState::Unknown && self.l4 == ChecksumState::Unknown
    }
}

// ─── Segmentation offload ───────────────────────────────────────────────────

/// Large-send request: the remote side segments the TCP payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentationOffload {
    pub family: IpFamily,
    /// Maximum segment size (20 significant bits).
    pub mss: u32,
    /// Offset of the TCP header from the start of the frame.
    pub tcp_offset: u16,
}

impl SegmentationOffload {
    pub const MAX_MSS: u32 = 0x000F_FFFF;
}

// ─── Flow hash ──────────────────────────────────────────────────────────────

/// Which packet fields fed the hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HashType {
    Ipv4 = 1,
    TcpIpv4 = 2,
    UdpIpv4 = 3,
    Ipv6 = 4,
    TcpIpv6 = 5,
    UdpIpv6 = 6,
    /// Value computed by the remote with an unspecified function.
    Opaque = 7,
    /// Ring-local default (the receive queue index).
    Queue = 8,
}

impl HashType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(HashType::Ipv4),
            2 => Some(HashType::TcpIpv4),
            3 => Some(HashType::UdpIpv4),
            4 => Some(HashType::Ipv6),
            5 => Some(HashType::TcpIpv6),
            6 => Some(HashType::UdpIpv6),
            7 => Some(HashType::Opaque),
            8 => Some(HashType::Queue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowHash {
    pub value: u32,
    pub kind: HashType,
}

// ─── PacketDescriptor ───────────────────────────────────────────────────────

/// A packet to transmit, or a decoded inbound packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketDescriptor {
    /// Raw frame bytes.
    pub payload: Bytes,
    pub vlan: Option<VlanTag>,
    /// Transmit-side checksum request.
    pub checksum: Option<ChecksumRequest>,
    /// Receive-side checksum validation. Always `Unknown` on transmit.
    pub checksum_status: ChecksumStatus,
    pub segmentation: Option<SegmentationOffload>,
    pub flow_hash: Option<FlowHash>,
}

impl PacketDescriptor {
    pub fn new(payload: Bytes) -> Self {
        PacketDescriptor {
            payload,
            ..Default::default()
        }
    }

    pub fn with_vlan(mut self, tag: VlanTag) -> Self {
        self.vlan = Some(tag);
        self
    }

    pub fn with_checksum(mut self, request: ChecksumRequest) -> Self {
        self.checksum = Some(request);
        self
    }

    pub fn with_segmentation(mut self, lso: SegmentationOffload) -> Self {
        self.segmentation = Some(lso);
        self
    }

    pub fn with_flow_hash(mut self, value: u32, kind: HashType) -> Self {
        self.flow_hash = Some(FlowHash { value, kind });
        self
    }

    /// Frame length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
