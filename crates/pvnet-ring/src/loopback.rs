//! # Loopback Transport
//!
//! In-memory remote endpoint implementing [`ChannelTransport`]. It speaks the
//! control protocol, decodes every frame sent to it, and can write frames into
//! a channel's receive region as a real remote would.
//!
//! Fault injection covers the cases the rings and manager must survive:
//! transient send refusal, deferred completions, refused or partial
//! sub-channel grants, channels that fail to open, and older protocol
//! versions.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::channel::{
    ChannelHandle, ChannelTransport, CompletionStatus, CompletionToken, OutboundMessage,
    RawMessage, ReceiveRegion, RxSegment,
};
use crate::codec::Codec;
use crate::error::{DecodeError, TransportBusy, TransportError};
use crate::packet::{ChecksumState, ChecksumStatus, L4Protocol, PacketDescriptor};
use crate::wire::{ControlKind, ControlMessage, PayloadMode, Status, CONTROL_VERSION_2};

/// Remote-side behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackConfig {
    /// Total channels the remote will grant, primary included.
    pub max_channels: u16,
    /// Highest control protocol version the remote speaks.
    pub version: u32,
    /// Reply `Failure` to every sub-channel request.
    pub fail_subchannel_request: bool,
    /// Refuse to open this channel index.
    pub fail_open_at: Option<u16>,
    /// Write every successfully sent frame back into the sender's receive
    /// region.
    pub echo: bool,
    /// Hold completions until [`LoopbackTransport::complete_pending`].
    pub defer_completions: bool,
    /// Keep every decoded frame for [`LoopbackTransport::sent_frames`].
    pub record_frames: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        LoopbackConfig {
            max_channels: 64,
            version: CONTROL_VERSION_2,
            fail_subchannel_request: false,
            fail_open_at: None,
            echo: false,
            defer_completions: false,
            record_frames: true,
        }
    }
}

/// One message the remote received.
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub token: CompletionToken,
    pub mode: PayloadMode,
    pub wire_len: usize,
    pub packet: Result<PacketDescriptor, DecodeError>,
}

#[derive(Default)]
struct LoopChannel {
    capacity: usize,
    open: bool,
    receive_stopped: bool,
    inbound: VecDeque<RawMessage>,
    deferred: VecDeque<CompletionToken>,
    region: Option<(u32, Arc<ReceiveRegion>)>,
    cursor: usize,
    /// Region ranges written but not yet acknowledged: (transaction, offset, len).
    in_use: VecDeque<(u64, usize, usize)>,
    ack_batches: Vec<Vec<u64>>,
    sent: Vec<SentFrame>,
}

impl LoopChannel {
    /// Find room for `len` bytes without overwriting unacknowledged data.
    fn alloc(&mut self, len: usize) -> Option<usize> {
        let (_, region) = self.region.as_ref()?;
        let size = region.len();
        if len == 0 || len > size {
            return None;
        }
        let mut offset = self.cursor;
        if offset + len > size {
            offset = 0;
        }
        let overlaps = self
            .in_use
            .iter()
            .any(|&(_, o, l)| offset < o + l && o < offset + len);
        if overlaps {
            return None;
        }
        self.cursor = offset + len;
        Some(offset)
    }
}

#[derive(Default)]
struct LoopInner {
    channels: HashMap<u16, LoopChannel>,
    negotiated: Option<u32>,
    granted_subchannels: u16,
    mtu: Option<u32>,
    rss: Option<(Vec<u8>, Vec<u16>)>,
    next_region_id: u32,
    next_transaction: u64,
    control_log: Vec<ControlKind>,
}

impl LoopInner {
    /// Write `raw` into the channel's region and announce it.
    fn inject(&mut self, channel: u16, raw: &[u8]) -> bool {
        let transaction = self.next_transaction;
        let Some(ch) = self.channels.get_mut(&channel) else {
            return false;
        };
        if !ch.open || ch.receive_stopped {
            return false;
        }
        let Some(offset) = ch.alloc(raw.len()) else {
            trace!(channel, len = raw.len(), "receive region full");
            return false;
        };
        let written = ch
            .region
            .as_ref()
            .is_some_and(|(_, region)| region.write(offset, raw));
        if !written {
            return false;
        }
        ch.in_use.push_back((transaction, offset, raw.len()));
        ch.inbound.push_back(RawMessage::Receive {
            transaction,
            segments: vec![RxSegment {
                offset: offset as u32,
                len: raw.len() as u32,
            }],
        });
        self.next_transaction += 1;
        true
    }
}

/// In-memory [`ChannelTransport`].
pub struct LoopbackTransport {
    config: LoopbackConfig,
    codec: Codec,
    inner: Mutex<LoopInner>,
    busy_budget: AtomicUsize,
}

impl LoopbackTransport {
    pub fn new(config: LoopbackConfig) -> Self {
        LoopbackTransport {
            config,
            codec: Codec::new(true),
            inner: Mutex::new(LoopInner::default()),
            busy_budget: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &LoopbackConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, LoopInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Fault injection and remote-side actions ────────────────────────

    /// Refuse the next `n` sends with [`TransportBusy`].
    pub fn inject_busy(&self, n: usize) {
        self.busy_budget.store(n, Ordering::SeqCst);
    }

    /// Write a raw message into a channel's receive region.
    pub fn inject_frame(&self, channel: u16, raw: &[u8]) -> bool {
        self.lock().inject(channel, raw)
    }

    /// Announce arbitrary segments without writing anything.
    pub fn inject_segments(&self, channel: u16, segments: Vec<RxSegment>) -> Option<u64> {
        let mut inner = self.lock();
        let transaction = inner.next_transaction;
        let ch = inner.channels.get_mut(&channel)?;
        ch.inbound.push_back(RawMessage::Receive {
            transaction,
            segments,
        });
        inner.next_transaction += 1;
        Some(transaction)
    }

    /// Encode `packet` inline and deliver it on `channel`.
    pub fn deliver_packet(&self, channel: u16, packet: &PacketDescriptor) -> bool {
        let mut scratch = BytesMut::new();
        let view = self.codec.encode(packet, PayloadMode::Inline, &mut scratch);
        self.inject_frame(channel, &view.head)
    }

    /// Release up to `n` deferred completions. Returns how many were released.
    pub fn complete_pending(&self, channel: u16, n: usize) -> usize {
        let mut inner = self.lock();
        let Some(ch) = inner.channels.get_mut(&channel) else {
            return 0;
        };
        let mut released = 0;
        while released < n {
            let Some(token) = ch.deferred.pop_front() else {
                break;
            };
            ch.inbound.push_back(RawMessage::Completion {
                token,
                status: CompletionStatus::Success,
            });
            released += 1;
        }
        released
    }

    pub fn pending_completions(&self, channel: u16) -> usize {
        self.lock()
            .channels
            .get(&channel)
            .map_or(0, |ch| ch.deferred.len())
    }

    // ─── Inspection ─────────────────────────────────────────────────────

    pub fn sent_frames(&self, channel: u16) -> Vec<SentFrame> {
        self.lock()
            .channels
            .get(&channel)
            .map(|ch| ch.sent.clone())
            .unwrap_or_default()
    }

    pub fn sent_count(&self, channel: u16) -> usize {
        self.lock().channels.get(&channel).map_or(0, |ch| ch.sent.len())
    }

    pub fn unacked_receives(&self, channel: u16) -> usize {
        self.lock()
            .channels
            .get(&channel)
            .map_or(0, |ch| ch.in_use.len())
    }

    pub fn ack_batches(&self, channel: u16) -> Vec<Vec<u64>> {
        self.lock()
            .channels
            .get(&channel)
            .map(|ch| ch.ack_batches.clone())
            .unwrap_or_default()
    }

    pub fn is_open(&self, channel: u16) -> bool {
        self.lock().channels.get(&channel).is_some_and(|ch| ch.open)
    }

    pub fn has_region(&self, channel: u16) -> bool {
        self.lock()
            .channels
            .get(&channel)
            .is_some_and(|ch| ch.region.is_some())
    }

    pub fn receive_stopped(&self, channel: u16) -> bool {
        self.lock()
            .channels
            .get(&channel)
            .is_some_and(|ch| ch.receive_stopped)
    }

    pub fn rss(&self) -> Option<(Vec<u8>, Vec<u16>)> {
        self.lock().rss.clone()
    }

    pub fn mtu(&self) -> Option<u32> {
        self.lock().mtu
    }

    pub fn negotiated_version(&self) -> Option<u32> {
        self.lock().negotiated
    }

    pub fn control_log(&self) -> Vec<ControlKind> {
        self.lock().control_log.clone()
    }

    // ─── Control handling ───────────────────────────────────────────────

    fn handle_control(&self, inner: &mut LoopInner, request: ControlMessage) -> ControlMessage {
        let ack = |status| ControlMessage::Ack { status };
        match request {
            ControlMessage::Init {
                min_version,
                max_version,
            } => {
                let version = max_version.min(self.config.version);
                if version < min_version {
                    inner.negotiated = None;
                    return ControlMessage::InitComplete {
                        status: Status::Unsupported,
                        version: self.config.version,
                    };
                }
                inner.negotiated = Some(version);
                inner.granted_subchannels = 0;
                inner.rss = None;
                ControlMessage::InitComplete {
                    status: Status::Success,
                    version,
                }
            }
            ControlMessage::Config { mtu } => {
                inner.mtu = Some(mtu);
                ack(Status::Success)
            }
            ControlMessage::RegisterRecvRegion {
                channel,
                region_id,
                size,
            } => {
                let known = inner.channels.get(&channel).and_then(|ch| ch.region.as_ref());
                match known {
                    Some((id, region)) if *id == region_id && region.len() == size as usize => {
                        ControlMessage::RecvRegionComplete {
                            status: Status::Success,
                            section_size: size,
                            section_count: 1,
                        }
                    }
                    _ => ControlMessage::RecvRegionComplete {
                        status: Status::Failure,
                        section_size: 0,
                        section_count: 0,
                    },
                }
            }
            ControlMessage::SubchannelRequest { count } => {
                if self.config.fail_subchannel_request || inner.negotiated < Some(CONTROL_VERSION_2) {
                    return ControlMessage::SubchannelComplete {
                        status: Status::Failure,
                        granted: 0,
                    };
                }
                let granted = count.min(self.config.max_channels.saturating_sub(1));
                inner.granted_subchannels = granted;
                ControlMessage::SubchannelComplete {
                    status: Status::Success,
                    granted,
                }
            }
            ControlMessage::SetRss { key, table } => {
                if inner.negotiated < Some(CONTROL_VERSION_2) {
                    return ack(Status::Unsupported);
                }
                inner.rss = Some((key, table));
                ack(Status::Success)
            }
            ControlMessage::StopReceive { channel } => match inner.channels.get_mut(&channel) {
                Some(ch) => {
                    ch.receive_stopped = true;
                    ack(Status::Success)
                }
                None => ack(Status::Failure),
            },
            ControlMessage::RevokeRecvRegion { channel, region_id } => {
                match inner.channels.get_mut(&channel) {
                    Some(ch) if ch.region.as_ref().is_some_and(|(id, _)| *id == region_id) => {
                        ch.region = None;
                        ch.in_use.clear();
                        ack(Status::Success)
                    }
                    _ => ack(Status::Failure),
                }
            }
            // Replies are never valid requests.
            ControlMessage::InitComplete { .. }
            | ControlMessage::RecvRegionComplete { .. }
            | ControlMessage::SubchannelComplete { .. }
            | ControlMessage::Ack { .. } => ack(Status::Unsupported),
        }
    }
}

/// The remote computed the checksums the sender asked for.
fn as_received(mut packet: PacketDescriptor) -> PacketDescriptor {
    if let Some(req) = packet.checksum.take() {
        packet.checksum_status = ChecksumStatus {
            ip: if req.ip_header {
                ChecksumState::Verified
            } else {
                ChecksumState::Unknown
            },
            l4: if req.l4 == L4Protocol::Other {
                ChecksumState::Unknown
            } else {
                ChecksumState::Verified
            },
        };
    }
    packet
}

impl ChannelTransport for LoopbackTransport {
    fn open(&self, index: u16, capacity: usize) -> Result<ChannelHandle, TransportError> {
        if index >= self.config.max_channels || self.config.fail_open_at == Some(index) {
            return Err(TransportError::Unavailable(index));
        }
        let mut inner = self.lock();
        if index > 0 && index > inner.granted_subchannels {
            return Err(TransportError::Unavailable(index));
        }
        if inner.channels.get(&index).is_some_and(|ch| ch.open) {
            return Err(TransportError::Rejected(format!("channel {index} already open")));
        }
        inner.channels.insert(
            index,
            LoopChannel {
                capacity,
                open: true,
                ..Default::default()
            },
        );
        debug!(channel = index, capacity, "loopback channel open");
        Ok(ChannelHandle(index))
    }

    fn send(
        &self,
        channel: ChannelHandle,
        message: &OutboundMessage,
        token: CompletionToken,
    ) -> Result<(), TransportBusy> {
        let refused = self
            .busy_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportBusy);
        }

        let packet = match message.mode {
            PayloadMode::Inline => self.codec.decode(&message.head),
            PayloadMode::Reference => self.codec.decode_scattered(&message.head, &message.regions),
        };

        let mut inner = self.lock();
        let ch = match inner.channels.get_mut(&channel.0) {
            Some(ch) if ch.open => ch,
            _ => return Err(TransportBusy),
        };
        if ch.deferred.len() >= ch.capacity {
            return Err(TransportBusy);
        }

        let status = if packet.is_ok() {
            CompletionStatus::Success
        } else {
            CompletionStatus::Failed
        };
        let echo = match (&packet, self.config.echo) {
            (Ok(p), true) => Some(as_received(p.clone())),
            _ => None,
        };
        if self.config.record_frames {
            ch.sent.push(SentFrame {
                token,
                mode: message.mode,
                wire_len: message.wire_len(),
                packet,
            });
        }
        if self.config.defer_completions && status == CompletionStatus::Success {
            ch.deferred.push_back(token);
        } else {
            ch.inbound.push_back(RawMessage::Completion { token, status });
        }

        if let Some(packet) = echo {
            let mut scratch = BytesMut::new();
            let view = self.codec.encode(&packet, PayloadMode::Inline, &mut scratch);
            if !inner.inject(channel.0, &view.head) {
                trace!(channel = channel.0, "echo dropped");
            }
        }
        Ok(())
    }

    fn try_recv(&self, channel: ChannelHandle) -> Option<RawMessage> {
        self.lock()
            .channels
            .get_mut(&channel.0)
            .and_then(|ch| ch.inbound.pop_front())
    }

    fn ack_receive(&self, channel: ChannelHandle, transactions: &[u64]) {
        let mut inner = self.lock();
        if let Some(ch) = inner.channels.get_mut(&channel.0) {
            ch.in_use.retain(|(t, _, _)| !transactions.contains(t));
            ch.ack_batches.push(transactions.to_vec());
        }
    }

    fn control(&self, channel: ChannelHandle, request: Bytes) -> Result<Bytes, TransportError> {
        let message = ControlMessage::decode(&request)
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        let mut inner = self.lock();
        if !inner.channels.get(&channel.0).is_some_and(|ch| ch.open) {
            return Err(TransportError::Closed(channel.0));
        }
        inner.control_log.push(message.kind());
        let reply = self.handle_control(&mut inner, message);
        Ok(reply.to_bytes())
    }

    fn share_region(
        &self,
        channel: ChannelHandle,
        region: Arc<ReceiveRegion>,
    ) -> Result<u32, TransportError> {
        let mut inner = self.lock();
        inner.next_region_id += 1;
        let id = inner.next_region_id;
        match inner.channels.get_mut(&channel.0) {
            Some(ch) if ch.open => {
                ch.region = Some((id, region));
                ch.cursor = 0;
                ch.in_use.clear();
                Ok(id)
            }
            _ => Err(TransportError::Closed(channel.0)),
        }
    }

    fn close(&self, channel: ChannelHandle) {
        let mut inner = self.lock();
        if let Some(ch) = inner.channels.get_mut(&channel.0) {
            ch.open = false;
            ch.inbound.clear();
            ch.deferred.clear();
            debug!(channel = channel.0, "loopback channel closed");
        }
    }
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("config", &self.config)
            .finish()
    }
}
