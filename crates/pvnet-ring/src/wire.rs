//! # Wire Format
//!
//! Encapsulation protocol between the front-end and the remote endpoint.
//! All multi-byte fields are little-endian.
//!
//! ## Packet message
//!
//! ```text
//!  0       1       2       3       4               8              12              16
//! +-------+-------+-------+-------+---------------+---------------+---------------+
//! |  ver  | kind  | mode  |  rsv  | metadata_len  |  payload_len  |  message_len  |
//! +-------+-------+-------+-------+---------------+---------------+---------------+
//! | metadata items (metadata_len bytes) ...                                       |
//! +-------------------------------------------------------------------------------+
//! | mode=Inline:    payload bytes (payload_len)                                   |
//! | mode=Reference: count(u16) rsv(u16) len(u32) × count                          |
//! +-------------------------------------------------------------------------------+
//! ```
//!
//! Each metadata item is `type(u16) value_len(u16) value`. Items are written
//! in a fixed order (hash, VLAN, segmentation, checksum) and never reordered.
//! Unknown item types are skipped by the decoder.
//!
//! ## Control message
//!
//! `kind(u32) body_len(u32) body`. Used only for setup and teardown.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::DecodeError;
use crate::packet::{
    ChecksumRequest, ChecksumState, ChecksumStatus, FlowHash, HashType, IpFamily, L4Protocol,
    SegmentationOffload, VlanTag,
};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Data message protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed packet-message header size.
pub const HEADER_LEN: usize = 16;

/// Size of the type + length prefix of every metadata item.
pub const ITEM_HEADER_LEN: usize = 4;

/// Control protocol with a single channel only.
pub const CONTROL_VERSION_1: u32 = 1;

/// Control protocol adding sub-channels and RSS parameters.
pub const CONTROL_VERSION_2: u32 = 2;

/// Control message `kind` + `body_len` prefix.
pub const CONTROL_HEADER_LEN: usize = 8;

/// Sanity limits on variable-length control bodies.
pub const MAX_RSS_KEY_LEN: usize = 64;
pub const MAX_RSS_TABLE_LEN: usize = 4096;

// ─── Header ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Packet = 1,
}

impl MessageKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(MessageKind::Packet),
            _ => None,
        }
    }
}

/// Where the frame bytes travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadMode {
    /// Copied into the message after the metadata.
    Inline = 0,
    /// Described by a reference descriptor; bytes travel as separate regions.
    Reference = 1,
}

impl PayloadMode {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PayloadMode::Inline),
            1 => Some(PayloadMode::Reference),
            _ => None,
        }
    }
}

/// Decoded packet-message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub version: u8,
    pub kind: MessageKind,
    pub payload_mode: PayloadMode,
    /// Bytes of metadata items following the header.
    pub metadata_len: u32,
    /// Frame length, whatever the payload mode.
    pub payload_len: u32,
    /// Total message length: header + metadata + payload section.
    pub message_len: u32,
}

impl MessageHeader {
    pub fn packet(payload_mode: PayloadMode, metadata_len: u32, payload_len: u32, message_len: u32) -> Self {
        MessageHeader {
            version: PROTOCOL_VERSION,
            kind: MessageKind::Packet,
            payload_mode,
            metadata_len,
            payload_len,
            message_len,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.payload_mode as u8);
        buf.put_u8(0);
        buf.put_u32_le(self.metadata_len);
        buf.put_u32_le(self.payload_len);
        buf.put_u32_le(self.message_len);
    }

    /// Parse the fixed header. Bounds are checked separately by
    /// [`MessageHeader::validate`].
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        if raw.len() < HEADER_LEN {
            return Err(DecodeError::Malformed);
        }
        let mut buf = &raw[..HEADER_LEN];
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let kind = MessageKind::from_u8(buf.get_u8()).ok_or(DecodeError::Malformed)?;
        let payload_mode = PayloadMode::from_u8(buf.get_u8()).ok_or(DecodeError::Malformed)?;
        let _reserved = buf.get_u8();
        Ok(MessageHeader {
            version,
            kind,
            payload_mode,
            metadata_len: buf.get_u32_le(),
            payload_len: buf.get_u32_le(),
            message_len: buf.get_u32_le(),
        })
    }

    /// Check the declared lengths against the buffer holding the message.
    pub fn validate(&self, buffer_len: usize) -> Result<(), DecodeError> {
        let metadata_end = HEADER_LEN as u64 + self.metadata_len as u64;
        if metadata_end > buffer_len as u64 {
            return Err(DecodeError::OutOfBounds);
        }
        if self.message_len as u64 > buffer_len as u64 {
            return Err(DecodeError::OutOfBounds);
        }
        if (self.message_len as u64) < metadata_end {
            return Err(DecodeError::Malformed);
        }
        if self.payload_mode == PayloadMode::Inline
            && metadata_end + self.payload_len as u64 != self.message_len as u64
        {
            // An inline payload that runs past the message is out of bounds;
            // one that stops short means the header is inconsistent.
            return if metadata_end + self.payload_len as u64 > buffer_len as u64 {
                Err(DecodeError::OutOfBounds)
            } else {
                Err(DecodeError::Malformed)
            };
        }
        Ok(())
    }
}

// ─── Metadata items ─────────────────────────────────────────────────────────

/// Metadata item type tags.
pub mod item_type {
    pub const HASH: u16 = 1;
    pub const VLAN: u16 = 2;
    pub const SEGMENTATION: u16 = 3;
    pub const CHECKSUM_REQUEST: u16 = 4;
    pub const CHECKSUM_RESULT: u16 = 5;
}

const CSUM_REQ_IPV4: u8 = 1 << 0;
const CSUM_REQ_IPV6: u8 = 1 << 1;
const CSUM_REQ_TCP: u8 = 1 << 2;
const CSUM_REQ_UDP: u8 = 1 << 3;
const CSUM_REQ_IP_HEADER: u8 = 1 << 4;

const CSUM_RES_IP_OK: u8 = 1 << 0;
const CSUM_RES_IP_FAILED: u8 = 1 << 1;
const CSUM_RES_L4_OK: u8 = 1 << 2;
const CSUM_RES_L4_FAILED: u8 = 1 << 3;

/// One typed per-packet metadata item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataItem {
    Hash(FlowHash),
    Vlan(VlanTag),
    Segmentation(SegmentationOffload),
    ChecksumRequest(ChecksumRequest),
    ChecksumResult(ChecksumStatus),
}

impl MetadataItem {
    pub fn item_type(&self) -> u16 {
        match self {
            MetadataItem::Hash(_) => item_type::HASH,
            MetadataItem::Vlan(_) => item_type::VLAN,
            MetadataItem::Segmentation(_) => item_type::SEGMENTATION,
            MetadataItem::ChecksumRequest(_) => item_type::CHECKSUM_REQUEST,
            MetadataItem::ChecksumResult(_) => item_type::CHECKSUM_RESULT,
        }
    }

    fn value_len(&self) -> usize {
        match self {
            MetadataItem::Hash(_) | MetadataItem::Segmentation(_) => 8,
            MetadataItem::Vlan(_)
            | MetadataItem::ChecksumRequest(_)
            | MetadataItem::ChecksumResult(_) => 4,
        }
    }

    /// Encoded size including the item prefix.
    pub fn encoded_len(&self) -> usize {
        ITEM_HEADER_LEN + self.value_len()
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.item_type());
        buf.put_u16_le(self.value_len() as u16);
        match self {
            MetadataItem::Hash(h) => {
                buf.put_u32_le(h.value);
                buf.put_u8(h.kind as u8);
                buf.put_bytes(0, 3);
            }
            MetadataItem::Vlan(tag) => {
                buf.put_u16_le(tag.tci());
                buf.put_u16_le(0);
            }
            MetadataItem::Segmentation(lso) => {
                buf.put_u8(family_to_u8(lso.family));
                buf.put_u8(0);
                buf.put_u16_le(lso.tcp_offset);
                buf.put_u32_le(lso.mss & SegmentationOffload::MAX_MSS);
            }
            MetadataItem::ChecksumRequest(req) => {
                let mut flags = match req.family {
                    IpFamily::V4 => CSUM_REQ_IPV4,
                    IpFamily::V6 => CSUM_REQ_IPV6,
                };
                flags |= match req.l4 {
                    L4Protocol::Tcp => CSUM_REQ_TCP,
                    L4Protocol::Udp => CSUM_REQ_UDP,
                    L4Protocol::Other => 0,
                };
                if req.ip_header {
                    flags |= CSUM_REQ_IP_HEADER;
                }
                buf.put_u8(flags);
                buf.put_u8(0);
                buf.put_u16_le(req.transport_offset);
            }
            MetadataItem::ChecksumResult(status) => {
                let flags = state_bits(status.ip, CSUM_RES_IP_OK, CSUM_RES_IP_FAILED)
                    | state_bits(status.l4, CSUM_RES_L4_OK, CSUM_RES_L4_FAILED);
                buf.put_u8(flags);
                buf.put_bytes(0, 3);
            }
        }
    }

    /// Decode one item from the front of `buf`, advancing past it.
    ///
    /// Returns `Ok(None)` for an unknown item type, which the caller skips.
    pub fn decode(buf: &mut &[u8]) -> Result<Option<Self>, DecodeError> {
        if buf.remaining() < ITEM_HEADER_LEN {
            return Err(DecodeError::Malformed);
        }
        let kind = buf.get_u16_le();
        let value_len = buf.get_u16_le() as usize;
        if buf.remaining() < value_len {
            return Err(DecodeError::Malformed);
        }
        let mut value = &buf[..value_len];
        buf.advance(value_len);

        let item = match kind {
            item_type::HASH => {
                need(&value, 8)?;
                let v = value.get_u32_le();
                let kind = HashType::from_u8(value.get_u8()).unwrap_or(HashType::Opaque);
                MetadataItem::Hash(FlowHash { value: v, kind })
            }
            item_type::VLAN => {
                need(&value, 2)?;
                MetadataItem::Vlan(VlanTag::from_tci(value.get_u16_le()))
            }
            item_type::SEGMENTATION => {
                need(&value, 8)?;
                let family = family_from_u8(value.get_u8())?;
                let _reserved = value.get_u8();
                let tcp_offset = value.get_u16_le();
                let mss = value.get_u32_le() & SegmentationOffload::MAX_MSS;
                MetadataItem::Segmentation(SegmentationOffload {
                    family,
                    mss,
                    tcp_offset,
                })
            }
            item_type::CHECKSUM_REQUEST => {
                need(&value, 4)?;
                let flags = value.get_u8();
                let _reserved = value.get_u8();
                let transport_offset = value.get_u16_le();
                let family = match (flags & CSUM_REQ_IPV4 != 0, flags & CSUM_REQ_IPV6 != 0) {
                    (true, false) => IpFamily::V4,
                    (false, true) => IpFamily::V6,
                    _ => return Err(DecodeError::Malformed),
                };
                let l4 = match (flags & CSUM_REQ_TCP != 0, flags & CSUM_REQ_UDP != 0) {
                    (true, false) => L4Protocol::Tcp,
                    (false, true) => L4Protocol::Udp,
                    (false, false) => L4Protocol::Other,
                    (true, true) => return Err(DecodeError::Malformed),
                };
                MetadataItem::ChecksumRequest(ChecksumRequest {
                    family,
                    ip_header: flags & CSUM_REQ_IP_HEADER != 0,
                    l4,
                    transport_offset,
                })
            }
            item_type::CHECKSUM_RESULT => {
                need(&value, 1)?;
                let flags = value.get_u8();
                MetadataItem::ChecksumResult(ChecksumStatus {
                    ip: bits_state(flags, CSUM_RES_IP_OK, CSUM_RES_IP_FAILED),
                    l4: bits_state(flags, CSUM_RES_L4_OK, CSUM_RES_L4_FAILED),
                })
            }
            _ => return Ok(None),
        };
        Ok(Some(item))
    }
}

#[inline]
fn need(value: &&[u8], len: usize) -> Result<(), DecodeError> {
    if value.len() < len {
        Err(DecodeError::Malformed)
    } else {
        Ok(())
    }
}

fn family_to_u8(f: IpFamily) -> u8 {
    match f {
        IpFamily::V4 => 4,
        IpFamily::V6 => 6,
    }
}

fn family_from_u8(v: u8) -> Result<IpFamily, DecodeError> {
    match v {
        4 => Ok(IpFamily::V4),
        6 => Ok(IpFamily::V6),
        _ => Err(DecodeError::Malformed),
    }
}

fn state_bits(state: ChecksumState, ok: u8, failed: u8) -> u8 {
    match state {
        ChecksumState::Unknown => 0,
        ChecksumState::Verified => ok,
        ChecksumState::Failed => failed,
    }
}

// A remote that sets both bits gets the conservative answer.
fn bits_state(flags: u8, ok: u8, failed: u8) -> ChecksumState {
    if flags & failed != 0 {
        ChecksumState::Failed
    } else if flags & ok != 0 {
        ChecksumState::Verified
    } else {
        ChecksumState::Unknown
    }
}

// ─── Reference descriptor ───────────────────────────────────────────────────

/// Lengths of the buffer regions carrying a by-reference payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceDescriptor {
    pub lengths: Vec<u32>,
}

impl ReferenceDescriptor {
    pub fn encoded_len(region_count: usize) -> usize {
        4 + 4 * region_count
    }

    pub fn total_len(&self) -> u64 {
        self.lengths.iter().map(|&l| l as u64).sum()
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        Self::encode_regions(self.lengths.iter().map(|&l| l as usize), buf);
    }

    /// Write a descriptor straight from region lengths.
    pub fn encode_regions<I>(lengths: I, buf: &mut impl BufMut)
    where
        I: ExactSizeIterator<Item = usize>,
    {
        debug_assert!(lengths.len() <= u16::MAX as usize, "too many regions");
        buf.put_u16_le(lengths.len() as u16);
        buf.put_u16_le(0);
        for len in lengths {
            buf.put_u32_le(len as u32);
        }
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.remaining() < 4 {
            return Err(DecodeError::Malformed);
        }
        let count = buf.get_u16_le() as usize;
        let _reserved = buf.get_u16_le();
        if buf.remaining() < 4 * count {
            return Err(DecodeError::Malformed);
        }
        let lengths = (0..count).map(|_| buf.get_u32_le()).collect();
        Ok(ReferenceDescriptor { lengths })
    }
}

// ─── Control messages ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlKind {
    Init = 1,
    InitComplete = 2,
    Config = 3,
    RegisterRecvRegion = 4,
    RecvRegionComplete = 5,
    SubchannelRequest = 6,
    SubchannelComplete = 7,
    SetRss = 8,
    StopReceive = 9,
    RevokeRecvRegion = 10,
    Ack = 11,
}

impl ControlKind {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(ControlKind::Init),
            2 => Some(ControlKind::InitComplete),
            3 => Some(ControlKind::Config),
            4 => Some(ControlKind::RegisterRecvRegion),
            5 => Some(ControlKind::RecvRegionComplete),
            6 => Some(ControlKind::SubchannelRequest),
            7 => Some(ControlKind::SubchannelComplete),
            8 => Some(ControlKind::SetRss),
            9 => Some(ControlKind::StopReceive),
            10 => Some(ControlKind::RevokeRecvRegion),
            11 => Some(ControlKind::Ack),
            _ => None,
        }
    }
}

/// Result code carried by completion messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Success = 0,
    Failure = 1,
    Unsupported = 2,
}

impl Status {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => Status::Success,
            2 => Status::Unsupported,
            _ => Status::Failure,
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

/// Setup, negotiation and teardown messages. Never on the packet fast path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Offer a control protocol version range.
    Init { min_version: u32, max_version: u32 },
    InitComplete { status: Status, version: u32 },
    /// Announce the device MTU.
    Config { mtu: u32 },
    /// Hand the remote a receive region it may write inbound frames into.
    RegisterRecvRegion { channel: u16, region_id: u32, size: u32 },
    RecvRegionComplete { status: Status, section_size: u32, section_count: u32 },
    /// Ask for `count` additional channels.
    SubchannelRequest { count: u16 },
    SubchannelComplete { status: Status, granted: u16 },
    /// Toeplitz key and indirection table.
    SetRss { key: Vec<u8>, table: Vec<u16> },
    StopReceive { channel: u16 },
    RevokeRecvRegion { channel: u16, region_id: u32 },
    Ack { status: Status },
}

impl ControlMessage {
    pub fn kind(&self) -> ControlKind {
        match self {
            ControlMessage::Init { .. } => ControlKind::Init,
            ControlMessage::InitComplete { .. } => ControlKind::InitComplete,
            ControlMessage::Config { .. } => ControlKind::Config,
            ControlMessage::RegisterRecvRegion { .. } => ControlKind::RegisterRecvRegion,
            ControlMessage::RecvRegionComplete { .. } => ControlKind::RecvRegionComplete,
            ControlMessage::SubchannelRequest { .. } => ControlKind::SubchannelRequest,
            ControlMessage::SubchannelComplete { .. } => ControlKind::SubchannelComplete,
            ControlMessage::SetRss { .. } => ControlKind::SetRss,
            ControlMessage::StopReceive { .. } => ControlKind::StopReceive,
            ControlMessage::RevokeRecvRegion { .. } => ControlKind::RevokeRecvRegion,
            ControlMessage::Ack { .. } => ControlKind::Ack,
        }
    }

    /// Completion status, for reply messages.
    pub fn status(&self) -> Option<Status> {
        match self {
            ControlMessage::InitComplete { status, .. }
            | ControlMessage::RecvRegionComplete { status, .. }
            | ControlMessage::SubchannelComplete { status, .. }
            | ControlMessage::Ack { status } => Some(*status),
            _ => None,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            ControlMessage::Init { .. } | ControlMessage::InitComplete { .. } => 8,
            ControlMessage::Config { .. } => 4,
            ControlMessage::RegisterRecvRegion { .. } => 12,
            ControlMessage::RecvRegionComplete { .. } => 12,
            ControlMessage::SubchannelRequest { .. } => 4,
            ControlMessage::SubchannelComplete { .. } => 8,
            ControlMessage::SetRss { key, table } => 4 + key.len() + 2 * table.len(),
            ControlMessage::StopReceive { .. } => 4,
            ControlMessage::RevokeRecvRegion { .. } => 8,
            ControlMessage::Ack { .. } => 4,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(CONTROL_HEADER_LEN + self.body_len());
        buf.put_u32_le(self.kind() as u32);
        buf.put_u32_le(self.body_len() as u32);
        match self {
            ControlMessage::Init {
                min_version,
                max_version,
            } => {
                buf.put_u32_le(*min_version);
                buf.put_u32_le(*max_version);
            }
            ControlMessage::InitComplete { status, version } => {
                buf.put_u32_le(*status as u32);
                buf.put_u32_le(*version);
            }
            ControlMessage::Config { mtu } => buf.put_u32_le(*mtu),
            ControlMessage::RegisterRecvRegion {
                channel,
                region_id,
                size,
            } => {
                buf.put_u16_le(*channel);
                buf.put_u16_le(0);
                buf.put_u32_le(*region_id);
                buf.put_u32_le(*size);
            }
            ControlMessage::RecvRegionComplete {
                status,
                section_size,
                section_count,
            } => {
                buf.put_u32_le(*status as u32);
                buf.put_u32_le(*section_size);
                buf.put_u32_le(*section_count);
            }
            ControlMessage::SubchannelRequest { count } => {
                buf.put_u16_le(*count);
                buf.put_u16_le(0);
            }
            ControlMessage::SubchannelComplete { status, granted } => {
                buf.put_u32_le(*status as u32);
                buf.put_u16_le(*granted);
                buf.put_u16_le(0);
            }
            ControlMessage::SetRss { key, table } => {
                buf.put_u16_le(key.len() as u16);
                buf.put_u16_le(table.len() as u16);
                buf.put_slice(key);
                for &entry in table {
                    buf.put_u16_le(entry);
                }
            }
            ControlMessage::StopReceive { channel } => {
                buf.put_u16_le(*channel);
                buf.put_u16_le(0);
            }
            ControlMessage::RevokeRecvRegion { channel, region_id } => {
                buf.put_u16_le(*channel);
                buf.put_u16_le(0);
                buf.put_u32_le(*region_id);
            }
            ControlMessage::Ack { status } => buf.put_u32_le(*status as u32),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CONTROL_HEADER_LEN + self.body_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        if raw.len() < CONTROL_HEADER_LEN {
            return Err(DecodeError::Malformed);
        }
        let mut buf = raw;
        let kind = ControlKind::from_u32(buf.get_u32_le()).ok_or(DecodeError::Malformed)?;
        let body_len = buf.get_u32_le() as usize;
        if body_len > buf.remaining() {
            return Err(DecodeError::OutOfBounds);
        }
        let mut body = &buf[..body_len];
        let min = |n: usize| -> Result<(), DecodeError> {
            if body_len < n {
                Err(DecodeError::Malformed)
            } else {
                Ok(())
            }
        };

        let msg = match kind {
            ControlKind::Init => {
                min(8)?;
                ControlMessage::Init {
                    min_version: body.get_u32_le(),
                    max_version: body.get_u32_le(),
                }
            }
            ControlKind::InitComplete => {
                min(8)?;
                ControlMessage::InitComplete {
                    status: Status::from_u32(body.get_u32_le()),
                    version: body.get_u32_le(),
                }
            }
            ControlKind::Config => {
                min(4)?;
                ControlMessage::Config {
                    mtu: body.get_u32_le(),
                }
            }
            ControlKind::RegisterRecvRegion => {
                min(12)?;
                let channel = body.get_u16_le();
                let _reserved = body.get_u16_le();
                ControlMessage::RegisterRecvRegion {
                    channel,
                    region_id: body.get_u32_le(),
                    size: body.get_u32_le(),
                }
            }
            ControlKind::RecvRegionComplete => {
                min(12)?;
                ControlMessage::RecvRegionComplete {
                    status: Status::from_u32(body.get_u32_le()),
                    section_size: body.get_u32_le(),
                    section_count: body.get_u32_le(),
                }
            }
            ControlKind::SubchannelRequest => {
                min(2)?;
                ControlMessage::SubchannelRequest {
                    count: body.get_u16_le(),
                }
            }
            ControlKind::SubchannelComplete => {
                min(6)?;
                ControlMessage::SubchannelComplete {
                    status: Status::from_u32(body.get_u32_le()),
                    granted: body.get_u16_le(),
                }
            }
            ControlKind::SetRss => {
                min(4)?;
                let key_len = body.get_u16_le() as usize;
                let table_len = body.get_u16_le() as usize;
                if key_len > MAX_RSS_KEY_LEN || table_len > MAX_RSS_TABLE_LEN {
                    return Err(DecodeError::Malformed);
                }
                if body.remaining() < key_len + 2 * table_len {
                    return Err(DecodeError::OutOfBounds);
                }
                let key = body[..key_len].to_vec();
                body.advance(key_len);
                let table = (0..table_len).map(|_| body.get_u16_le()).collect();
                ControlMessage::SetRss { key, table }
            }
            ControlKind::StopReceive => {
                min(2)?;
                ControlMessage::StopReceive {
                    channel: body.get_u16_le(),
                }
            }
            ControlKind::RevokeRecvRegion => {
                min(8)?;
                let channel = body.get_u16_le();
                let _reserved = body.get_u16_le();
                ControlMessage::RevokeRecvRegion {
                    channel,
                    region_id: body.get_u32_le(),
                }
            }
            ControlKind::Ack => {
                min(4)?;
                ControlMessage::Ack {
                    status: Status::from_u32(body.get_u32_le()),
                }
            }
        };
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_little_endian() {
        let hdr = MessageHeader::packet(PayloadMode::Inline, 0x0102, 0x0A0B, 0x1112);
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(&buf[..4], &[PROTOCOL_VERSION, 1, 0, 0]);
        assert_eq!(&buf[4..8], &[0x02, 0x01, 0, 0]);
        assert_eq!(&buf[8..12], &[0x0B, 0x0A, 0, 0]);
        assert_eq!(MessageHeader::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn header_rejects_unknown_version() {
        let mut buf = BytesMut::new();
        MessageHeader::packet(PayloadMode::Inline, 0, 0, HEADER_LEN as u32).encode(&mut buf);
        buf[0] = 9;
        assert_eq!(
            MessageHeader::decode(&buf),
            Err(DecodeError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn header_rejects_unknown_kind_and_short_buffer() {
        let mut buf = BytesMut::new();
        MessageHeader::packet(PayloadMode::Inline, 0, 0, HEADER_LEN as u32).encode(&mut buf);
        assert_eq!(MessageHeader::decode(&buf[..8]), Err(DecodeError::Malformed));
        buf[1] = 0x7F;
        assert_eq!(MessageHeader::decode(&buf), Err(DecodeError::Malformed));
    }

    #[test]
    fn metadata_length_beyond_buffer_is_out_of_bounds() {
        let hdr = MessageHeader::packet(PayloadMode::Inline, 40, 0, 56);
        assert_eq!(hdr.validate(32), Err(DecodeError::OutOfBounds));
    }

    #[test]
    fn inline_length_mismatch_is_malformed() {
        // Declares a 4-byte payload but the message ends 2 bytes later.
        let hdr = MessageHeader::packet(PayloadMode::Inline, 0, 4, HEADER_LEN as u32 + 2);
        assert_eq!(hdr.validate(64), Err(DecodeError::Malformed));
    }

    #[test]
    fn item_roundtrip_all_kinds() {
        let items = [
            MetadataItem::Hash(FlowHash {
                value: 0xDEAD_BEEF,
                kind: HashType::TcpIpv6,
            }),
            MetadataItem::Vlan(VlanTag::new(4000, 3).unwrap()),
            MetadataItem::Segmentation(SegmentationOffload {
                family: IpFamily::V6,
                mss: 1440,
                tcp_offset: 54,
            }),
            MetadataItem::ChecksumRequest(ChecksumRequest {
                family: IpFamily::V4,
                ip_header: true,
                l4: L4Protocol::Udp,
                transport_offset: 34,
            }),
            MetadataItem::ChecksumResult(ChecksumStatus {
                ip: ChecksumState::Verified,
                l4: ChecksumState::Failed,
            }),
        ];
        let mut buf = BytesMut::new();
        for item in &items {
            item.encode(&mut buf);
        }
        let expected: usize = items.iter().map(|i| i.encoded_len()).sum();
        assert_eq!(buf.len(), expected);

        let mut cursor: &[u8] = &buf;
        for item in &items {
            assert_eq!(MetadataItem::decode(&mut cursor).unwrap(), Some(*item));
        }
        assert!(cursor.is_empty());
    }

    #[test]
    fn unknown_item_is_skipped() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(0x7777);
        buf.put_u16_le(6);
        buf.put_bytes(0xAA, 6);
        MetadataItem::Vlan(VlanTag::new(5, 0).unwrap()).encode(&mut buf);

        let mut cursor: &[u8] = &buf;
        assert_eq!(MetadataItem::decode(&mut cursor).unwrap(), None);
        assert!(matches!(
            MetadataItem::decode(&mut cursor).unwrap(),
            Some(MetadataItem::Vlan(_))
        ));
    }

    #[test]
    fn item_value_overrun_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(item_type::HASH);
        buf.put_u16_le(8);
        buf.put_u32_le(1);
        let mut cursor: &[u8] = &buf;
        assert_eq!(MetadataItem::decode(&mut cursor), Err(DecodeError::Malformed));
    }

    #[test]
    fn checksum_request_with_both_families_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(item_type::CHECKSUM_REQUEST);
        buf.put_u16_le(4);
        buf.put_u8(CSUM_REQ_IPV4 | CSUM_REQ_IPV6);
        buf.put_bytes(0, 3);
        let mut cursor: &[u8] = &buf;
        assert_eq!(MetadataItem::decode(&mut cursor), Err(DecodeError::Malformed));
    }

    #[test]
    fn reference_descriptor_roundtrip() {
        let desc = ReferenceDescriptor {
            lengths: vec![4096, 4096, 17],
        };
        let mut buf = BytesMut::new();
        desc.encode(&mut buf);
        assert_eq!(buf.len(), ReferenceDescriptor::encoded_len(3));
        let decoded = ReferenceDescriptor::decode(&buf).unwrap();
        assert_eq!(decoded, desc);
        assert_eq!(decoded.total_len(), 8209);
    }

    #[test]
    fn control_roundtrip() {
        let msgs = vec![
            ControlMessage::Init {
                min_version: CONTROL_VERSION_1,
                max_version: CONTROL_VERSION_2,
            },
            ControlMessage::InitComplete {
                status: Status::Success,
                version: CONTROL_VERSION_2,
            },
            ControlMessage::Config { mtu: 9000 },
            ControlMessage::RegisterRecvRegion {
                channel: 3,
                region_id: 77,
                size: 1 << 20,
            },
            ControlMessage::RecvRegionComplete {
                status: Status::Success,
                section_size: 1728,
                section_count: 606,
            },
            ControlMessage::SubchannelRequest { count: 7 },
            ControlMessage::SubchannelComplete {
                status: Status::Failure,
                granted: 0,
            },
            ControlMessage::SetRss {
                key: vec![1, 2, 3, 4],
                table: vec![0, 1, 0, 1],
            },
            ControlMessage::StopReceive { channel: 2 },
            ControlMessage::RevokeRecvRegion {
                channel: 2,
                region_id: 77,
            },
            ControlMessage::Ack {
                status: Status::Unsupported,
            },
        ];
        for msg in msgs {
            let bytes = msg.to_bytes();
            assert_eq!(ControlMessage::decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn control_body_overrun_is_out_of_bounds() {
        let mut bytes = BytesMut::from(&ControlMessage::Config { mtu: 1500 }.to_bytes()[..]);
        bytes.truncate(CONTROL_HEADER_LEN + 2);
        assert_eq!(
            ControlMessage::decode(&bytes),
            Err(DecodeError::OutOfBounds)
        );
    }
}
