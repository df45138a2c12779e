//! # Receive Ring
//!
//! Consumes a channel's inbound notifications. Send completions are routed
//! to the paired transmit ring; receive segments are decoded out of the
//! shared [`ReceiveRegion`], stamped with hash and checksum state, and handed
//! to the [`PacketSink`] in arrival order.
//!
//! A bad message costs exactly one packet: it is counted, logged and skipped.
//! Consumed receive transactions are acknowledged in batches.

use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::{trace, warn};

use crate::channel::{ChannelHandle, ChannelTransport, RawMessage, ReceiveRegion, RxSegment};
use crate::codec::Codec;
use crate::error::{DecodeError, StateError};
use crate::packet::{FlowHash, HashType, PacketDescriptor, ETH_HEADER_LEN, VLAN_TAG_LEN};
use crate::state::{AtomicRingState, RingState};
use crate::stats::{add, bump, RxCounters, RxStats};
use crate::tx::TransmitRing;

// ─── Sink ───────────────────────────────────────────────────────────────────

/// Upstream consumer of decoded packets.
pub trait PacketSink: Send + Sync {
    fn deliver(&self, packet: PacketDescriptor);
}

impl PacketSink for Sender<PacketDescriptor> {
    fn deliver(&self, packet: PacketDescriptor) {
        if self.send(packet).is_err() {
            trace!("packet sink disconnected");
        }
    }
}

/// Adapts a closure into a [`PacketSink`].
pub struct FnSink<F>(pub F);

impl<F> PacketSink for FnSink<F>
where
    F: Fn(PacketDescriptor) + Send + Sync,
{
    fn deliver(&self, packet: PacketDescriptor) {
        (self.0)(packet)
    }
}

// ─── Ring ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxRingConfig {
    pub mtu: u32,
    /// Acknowledge after this many receive transactions.
    pub ack_batch: usize,
}

impl Default for RxRingConfig {
    fn default() -> Self {
        RxRingConfig {
            mtu: 1500,
            ack_batch: 64,
        }
    }
}

/// What one [`ReceiveRing::on_channel_notify`] pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NotifyReport {
    pub delivered: usize,
    pub dropped: usize,
    pub completions: usize,
    /// A completion cleared transmit backpressure.
    pub redrive: bool,
}

impl NotifyReport {
    pub fn did_work(&self) -> bool {
        self.delivered + self.dropped + self.completions > 0
    }
}

pub struct ReceiveRing {
    index: u16,
    channel: ChannelHandle,
    transport: Arc<dyn ChannelTransport>,
    codec: Codec,
    region: Arc<ReceiveRegion>,
    sink: Arc<dyn PacketSink>,
    state: AtomicRingState,
    mtu: u32,
    ack_batch: usize,
    pending_acks: Vec<u64>,
    counters: RxCounters,
}

impl ReceiveRing {
    pub fn new(
        index: u16,
        channel: ChannelHandle,
        transport: Arc<dyn ChannelTransport>,
        region: Arc<ReceiveRegion>,
        sink: Arc<dyn PacketSink>,
        config: &RxRingConfig,
    ) -> Self {
        let ack_batch = config.ack_batch.max(1);
        ReceiveRing {
            index,
            channel,
            transport,
            codec: Codec::default(),
            region,
            sink,
            state: AtomicRingState::new(RingState::Detached),
            mtu: config.mtu,
            ack_batch,
            pending_acks: Vec::with_capacity(ack_batch),
            counters: RxCounters::default(),
        }
    }

    /// Largest frame accepted: MTU plus the Ethernet header, plus a tag when
    /// the frame carries one.
    fn max_frame_len(&self, packet: &PacketDescriptor) -> usize {
        let vlan = if packet.vlan.is_some() { VLAN_TAG_LEN } else { 0 };
        self.mtu as usize + ETH_HEADER_LEN + vlan
    }

    /// Process everything the channel currently has queued.
    ///
    /// Completions go to `tx`; frames are decoded and delivered. Pending
    /// acknowledgements are always flushed before returning. A ring that is
    /// neither active nor suspended leaves the channel untouched.
    pub fn on_channel_notify(&mut self, tx: Option<&TransmitRing>) -> NotifyReport {
        let mut report = NotifyReport::default();
        if !matches!(self.state.load(), RingState::Active | RingState::Suspended) {
            return report;
        }
        while let Some(message) = self.transport.try_recv(self.channel) {
            match message {
                RawMessage::Completion { token, status } => {
                    report.completions += 1;
                    match tx {
                        Some(tx) => report.redrive |= tx.on_complete(token, status),
                        None => warn!(ring = self.index, "completion with no transmit ring bound"),
                    }
                }
                RawMessage::Receive {
                    transaction,
                    segments,
                } => {
                    for segment in segments {
                        if self.receive_segment(segment) {
                            report.delivered += 1;
                        } else {
                            report.dropped += 1;
                        }
                    }
                    self.pending_acks.push(transaction);
                    if self.pending_acks.len() >= self.ack_batch {
                        self.flush_acks();
                    }
                }
            }
        }
        self.flush_acks();
        report
    }

    /// Decode one segment and deliver it. Returns `false` if it was dropped.
    fn receive_segment(&mut self, segment: RxSegment) -> bool {
        let codec = self.codec;
        let decoded = self
            .region
            .with_slice(segment.offset as usize, segment.len as usize, |raw| codec.decode(raw))
            .unwrap_or(Err(DecodeError::OutOfBounds))
            .and_then(|packet| {
                if packet.len() > self.max_frame_len(&packet) {
                    Err(DecodeError::Malformed)
                } else {
                    Ok(packet)
                }
            });

        let mut packet = match decoded {
            Ok(packet) => packet,
            Err(e) => {
                self.count_drop(e);
                warn!(
                    ring = self.index,
                    offset = segment.offset,
                    len = segment.len,
                    error = %e,
                    "dropping inbound message"
                );
                return false;
            }
        };

        if packet.flow_hash.is_none() {
            packet.flow_hash = Some(FlowHash {
                value: self.index as u32,
                kind: HashType::Queue,
            });
            bump(&self.counters.hash_defaulted);
        }
        if packet.checksum_status.trusted() {
            bump(&self.counters.checksum_verified);
        }
        bump(&self.counters.packets_delivered);
        add(&self.counters.bytes_delivered, packet.len() as u64);
        self.sink.deliver(packet);
        true
    }

    fn count_drop(&self, error: DecodeError) {
        bump(&self.counters.decode_drops);
        match error {
            DecodeError::OutOfBounds => bump(&self.counters.out_of_bounds_drops),
            DecodeError::Malformed => bump(&self.counters.malformed_drops),
            DecodeError::UnsupportedVersion(_) => bump(&self.counters.version_drops),
        }
    }

    fn flush_acks(&mut self) {
        if self.pending_acks.is_empty() {
            return;
        }
        self.transport.ack_receive(self.channel, &self.pending_acks);
        bump(&self.counters.acks_sent);
        add(&self.counters.segments_acked, self.pending_acks.len() as u64);
        self.pending_acks.clear();
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    pub fn attach(&self) -> Result<(), StateError> {
        self.state.transition(self.index, RingState::Attached).map(|_| ())
    }

    pub fn activate(&self) -> Result<(), StateError> {
        self.state.transition(self.index, RingState::Active).map(|_| ())
    }

    pub fn suspend(&self) -> Result<(), StateError> {
        self.state.transition(self.index, RingState::Suspended).map(|_| ())
    }

    pub fn detach(&mut self) -> Result<(), StateError> {
        self.flush_acks();
        self.state.transition(self.index, RingState::Detached).map(|_| ())
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn state(&self) -> RingState {
        self.state.load()
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    pub fn stats(&self) -> RxStats {
        self.counters.snapshot()
    }
}

impl std::fmt::Debug for ReceiveRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveRing")
            .field("index", &self.index)
            .field("channel", &self.channel)
            .field("state", &self.state.load())
            .field("mtu", &self.mtu)
            .finish()
    }
}
