//! # Packet Codec
//!
//! Encodes a [`PacketDescriptor`] into the encapsulation format of
//! [`crate::wire`] and decodes inbound messages back into packets.
//!
//! Encoding reuses a caller-owned scratch buffer: the message is written into
//! it and split off as a frozen [`Bytes`], so steady-state operation does not
//! allocate once the scratch has grown to the largest inline message.
//! By-reference payloads are never copied; they are sliced into page-bounded
//! regions that share the caller's buffer.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::DecodeError;
use crate::packet::{IpFamily, PacketDescriptor};
use crate::wire::{
    MessageHeader, MetadataItem, PayloadMode, ReferenceDescriptor, HEADER_LEN,
};

/// Granularity of by-reference payload regions.
pub const PAGE_SIZE: usize = 4096;

/// Largest payload the format can carry: the reference descriptor counts
/// regions in a `u16`.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize * PAGE_SIZE;

/// One packet in wire form, ready to hand to a channel.
#[derive(Debug, Clone)]
pub struct EncodedView {
    pub mode: PayloadMode,
    /// Header plus metadata items.
    pub header_len: usize,
    /// Header, metadata and payload. Drives the inline/scattered decision.
    pub encoded_len: usize,
    /// Inline: the complete message. Reference: header, metadata and the
    /// reference descriptor.
    pub head: Bytes,
    /// Payload regions for by-reference delivery. Empty when inline.
    pub regions: Vec<Bytes>,
}

/// Stateless encapsulation codec.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    hash_enabled: bool,
}

impl Default for Codec {
    fn default() -> Self {
        Codec::new(true)
    }
}

impl Codec {
    /// `hash_enabled` controls whether flow-hash items are written on encode.
    pub fn new(hash_enabled: bool) -> Self {
        Codec { hash_enabled }
    }

    pub fn hash_enabled(&self) -> bool {
        self.hash_enabled
    }

    /// Metadata items for `packet`, in wire order.
    fn items(&self, packet: &PacketDescriptor) -> impl Iterator<Item = MetadataItem> {
        let hash = packet
            .flow_hash
            .filter(|_| self.hash_enabled)
            .map(MetadataItem::Hash);
        let vlan = packet.vlan.map(MetadataItem::Vlan);
        let lso = packet.segmentation.map(MetadataItem::Segmentation);
        // IPv6 TCP/UDP cannot be told apart from other payloads without
        // parsing the frame, so only IPv4 requests are forwarded.
        let csum = packet
            .checksum
            .filter(|req| req.family == IpFamily::V4)
            .map(MetadataItem::ChecksumRequest);
        let result = (!packet.checksum_status.is_unknown())
            .then_some(MetadataItem::ChecksumResult(packet.checksum_status));
        [hash, vlan, lso, csum, result].into_iter().flatten()
    }

    pub fn metadata_len(&self, packet: &PacketDescriptor) -> usize {
        self.items(packet).map(|i| i.encoded_len()).sum()
    }

    /// Size of the message if sent inline.
    pub fn encoded_len(&self, packet: &PacketDescriptor) -> usize {
        HEADER_LEN + self.metadata_len(packet) + packet.len()
    }

    /// Encode `packet` for delivery in `mode`.
    pub fn encode(
        &self,
        packet: &PacketDescriptor,
        mode: PayloadMode,
        scratch: &mut BytesMut,
    ) -> EncodedView {
        debug_assert!(packet.len() <= MAX_PAYLOAD_LEN, "payload not encodable");
        let metadata_len = self.metadata_len(packet);
        let header_len = HEADER_LEN + metadata_len;
        let encoded_len = header_len + packet.len();
        scratch.clear();

        match mode {
            PayloadMode::Inline => {
                scratch.reserve(encoded_len);
                MessageHeader::packet(
                    PayloadMode::Inline,
                    metadata_len as u32,
                    packet.len() as u32,
                    encoded_len as u32,
                )
                .encode(scratch);
                self.put_items(packet, scratch);
                scratch.put_slice(&packet.payload);
                EncodedView {
                    mode,
                    header_len,
                    encoded_len,
                    head: scratch.split().freeze(),
                    regions: Vec::new(),
                }
            }
            PayloadMode::Reference => {
                let regions = page_regions(&packet.payload);
                let message_len = header_len + ReferenceDescriptor::encoded_len(regions.len());
                scratch.reserve(message_len);
                MessageHeader::packet(
                    PayloadMode::Reference,
                    metadata_len as u32,
                    packet.len() as u32,
                    message_len as u32,
                )
                .encode(scratch);
                self.put_items(packet, scratch);
                ReferenceDescriptor::encode_regions(regions.iter().map(Bytes::len), scratch);
                EncodedView {
                    mode,
                    header_len,
                    encoded_len,
                    head: scratch.split().freeze(),
                    regions,
                }
            }
        }
    }

    fn put_items(&self, packet: &PacketDescriptor, buf: &mut BytesMut) {
        for item in self.items(packet) {
            item.encode(buf);
        }
    }

    /// Decode an inline message. The payload is copied out of `raw`.
    pub fn decode(&self, raw: &[u8]) -> Result<PacketDescriptor, DecodeError> {
        let header = MessageHeader::decode(raw)?;
        header.validate(raw.len())?;
        if header.payload_mode != PayloadMode::Inline {
            return Err(DecodeError::Malformed);
        }
        let meta_end = HEADER_LEN + header.metadata_len as usize;
        let mut packet = decode_metadata(&raw[HEADER_LEN..meta_end])?;
        let payload_end = meta_end + header.payload_len as usize;
        packet.payload = Bytes::copy_from_slice(&raw[meta_end..payload_end]);
        Ok(packet)
    }

    /// Decode a by-reference message whose payload travelled in `regions`.
    pub fn decode_scattered(
        &self,
        head: &[u8],
        regions: &[Bytes],
    ) -> Result<PacketDescriptor, DecodeError> {
        let header = MessageHeader::decode(head)?;
        header.validate(head.len())?;
        if header.payload_mode != PayloadMode::Reference {
            return Err(DecodeError::Malformed);
        }
        let meta_end = HEADER_LEN + header.metadata_len as usize;
        let mut packet = decode_metadata(&head[HEADER_LEN..meta_end])?;
        let desc = ReferenceDescriptor::decode(&head[meta_end..header.message_len as usize])?;

        if desc.lengths.len() != regions.len()
            || desc
                .lengths
                .iter()
                .zip(regions)
                .any(|(&len, region)| len as usize != region.len())
        {
            return Err(DecodeError::Malformed);
        }
        if desc.total_len() != header.payload_len as u64 {
            return Err(DecodeError::Malformed);
        }

        packet.payload = match regions {
            [] => Bytes::new(),
            [single] => single.clone(),
            many => {
                let mut buf = BytesMut::with_capacity(header.payload_len as usize);
                for region in many {
                    buf.put_slice(region);
                }
                buf.freeze()
            }
        };
        Ok(packet)
    }
}

/// Walk a metadata region, skipping unknown items.
fn decode_metadata(mut raw: &[u8]) -> Result<PacketDescriptor, DecodeError> {
    let mut packet = PacketDescriptor::default();
    while !raw.is_empty() {
        let Some(item) = MetadataItem::decode(&mut raw)? else {
            continue;
        };
        match item {
            MetadataItem::Hash(h) => packet.flow_hash = Some(h),
            MetadataItem::Vlan(v) => packet.vlan = Some(v),
            MetadataItem::Segmentation(s) => packet.segmentation = Some(s),
            MetadataItem::ChecksumRequest(c) => packet.checksum = Some(c),
            MetadataItem::ChecksumResult(s) => packet.checksum_status = s,
        }
    }
    Ok(packet)
}

/// Split a payload into zero-copy slices of at most [`PAGE_SIZE`] bytes.
pub fn page_regions(payload: &Bytes) -> Vec<Bytes> {
    let len = payload.len();
    (0..len)
        .step_by(PAGE_SIZE)
        .map(|start| payload.slice(start..(start + PAGE_SIZE).min(len)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{
        ChecksumRequest, ChecksumState, ChecksumStatus, HashType, L4Protocol,
        SegmentationOffload, VlanTag,
    };
    use crate::wire::item_type;
    use bytes::Buf;

    fn full_packet(len: usize) -> PacketDescriptor {
        PacketDescriptor::new(Bytes::from(vec![0x5A; len]))
            .with_flow_hash(0x1234_5678, HashType::TcpIpv4)
            .with_vlan(VlanTag::new(42, 1).unwrap())
            .with_segmentation(SegmentationOffload {
                family: IpFamily::V4,
                mss: 1448,
                tcp_offset: 34,
            })
            .with_checksum(ChecksumRequest {
                family: IpFamily::V4,
                ip_header: true,
                l4: L4Protocol::Tcp,
                transport_offset: 34,
            })
    }

    fn item_types(head: &[u8]) -> Vec<u16> {
        let header = MessageHeader::decode(head).unwrap();
        let mut meta = &head[HEADER_LEN..HEADER_LEN + header.metadata_len as usize];
        let mut types = Vec::new();
        while meta.has_remaining() {
            types.push(u16::from_le_bytes([meta[0], meta[1]]));
            MetadataItem::decode(&mut meta).unwrap();
        }
        types
    }

    #[test]
    fn inline_roundtrip() {
        let codec = Codec::new(true);
        let pkt = full_packet(100);
        let mut scratch = BytesMut::new();
        let view = codec.encode(&pkt, PayloadMode::Inline, &mut scratch);
        assert_eq!(view.encoded_len, codec.encoded_len(&pkt));
        assert_eq!(view.head.len(), view.encoded_len);
        assert!(view.regions.is_empty());
        assert_eq!(codec.decode(&view.head).unwrap(), pkt);
    }

    #[test]
    fn items_written_in_fixed_order() {
        let codec = Codec::new(true);
        let mut scratch = BytesMut::new();
        let view = codec.encode(&full_packet(10), PayloadMode::Inline, &mut scratch);
        assert_eq!(
            item_types(&view.head),
            vec![
                item_type::HASH,
                item_type::VLAN,
                item_type::SEGMENTATION,
                item_type::CHECKSUM_REQUEST
            ]
        );
    }

    #[test]
    fn hash_omitted_when_disabled() {
        let codec = Codec::new(false);
        let pkt = PacketDescriptor::new(Bytes::from_static(b"x"))
            .with_flow_hash(7, HashType::Ipv4);
        assert_eq!(codec.metadata_len(&pkt), 0);
        let mut scratch = BytesMut::new();
        let view = codec.encode(&pkt, PayloadMode::Inline, &mut scratch);
        assert_eq!(codec.decode(&view.head).unwrap().flow_hash, None);
    }

    #[test]
    fn ipv6_checksum_request_not_forwarded() {
        let codec = Codec::new(true);
        let pkt = PacketDescriptor::new(Bytes::from_static(b"v6")).with_checksum(ChecksumRequest {
            family: IpFamily::V6,
            ip_header: false,
            l4: L4Protocol::Tcp,
            transport_offset: 54,
        });
        assert_eq!(codec.metadata_len(&pkt), 0);
    }

    #[test]
    fn checksum_result_survives_roundtrip() {
        let codec = Codec::default();
        let mut pkt = PacketDescriptor::new(Bytes::from_static(b"rx"));
        pkt.checksum_status = ChecksumStatus {
            ip: ChecksumState::Verified,
            l4: ChecksumState::Verified,
        };
        let mut scratch = BytesMut::new();
        let view = codec.encode(&pkt, PayloadMode::Inline, &mut scratch);
        assert!(codec.decode(&view.head).unwrap().checksum_status.trusted());
    }

    #[test]
    fn reference_mode_splits_pages_without_copy() {
        let codec = Codec::new(true);
        let pkt = full_packet(2 * PAGE_SIZE + 17);
        let mut scratch = BytesMut::new();
        let view = codec.encode(&pkt, PayloadMode::Reference, &mut scratch);
        assert_eq!(view.regions.len(), 3);
        assert_eq!(view.regions[2].len(), 17);
        assert_eq!(view.regions[0].as_ptr(), pkt.payload.as_ptr());
        assert!(view.head.len() < 128);
        assert_eq!(view.encoded_len, codec.encoded_len(&pkt));

        let decoded = codec.decode_scattered(&view.head, &view.regions).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn scattered_region_mismatch_is_malformed() {
        let codec = Codec::new(true);
        let pkt = PacketDescriptor::new(Bytes::from(vec![1u8; PAGE_SIZE + 1]));
        let mut scratch = BytesMut::new();
        let view = codec.encode(&pkt, PayloadMode::Reference, &mut scratch);
        assert_eq!(
            codec.decode_scattered(&view.head, &view.regions[..1]),
            Err(DecodeError::Malformed)
        );
    }

    #[test]
    fn inline_decoder_rejects_reference_message() {
        let codec = Codec::new(true);
        let pkt = PacketDescriptor::new(Bytes::from_static(b"abc"));
        let mut scratch = BytesMut::new();
        let view = codec.encode(&pkt, PayloadMode::Reference, &mut scratch);
        assert_eq!(codec.decode(&view.head), Err(DecodeError::Malformed));
    }

    #[test]
    fn metadata_beyond_buffer_is_out_of_bounds() {
        let mut raw = BytesMut::new();
        MessageHeader::packet(PayloadMode::Inline, 40, 0, 56).encode(&mut raw);
        raw.put_bytes(0, 16);
        assert_eq!(raw.len(), 32);
        assert_eq!(Codec::default().decode(&raw), Err(DecodeError::OutOfBounds));
    }

    #[test]
    fn truncated_payload_is_out_of_bounds() {
        let codec = Codec::default();
        let mut scratch = BytesMut::new();
        let view = codec.encode(
            &PacketDescriptor::new(Bytes::from_static(b"0123456789")),
            PayloadMode::Inline,
            &mut scratch,
        );
        assert_eq!(
            codec.decode(&view.head[..view.head.len() - 4]),
            Err(DecodeError::OutOfBounds)
        );
    }

    #[test]
    fn scratch_is_reused() {
        let codec = Codec::default();
        let mut scratch = BytesMut::with_capacity(4096);
        for _ in 0..8 {
            let view = codec.encode(
                &PacketDescriptor::new(Bytes::from_static(b"reuse")),
                PayloadMode::Inline,
                &mut scratch,
            );
            drop(view);
            assert!(scratch.is_empty());
        }
    }

    #[test]
    fn empty_payload_has_no_regions() {
        assert!(page_regions(&Bytes::new()).is_empty());
    }
}
