//! # Channel
//!
//! The transport seam ([`ChannelTransport`]) and the per-channel binding of
//! one transmit ring and one receive ring ([`Channel`]).
//!
//! A transport is a message-oriented duplex pipe per channel with a bounded
//! queue depth. Sends are asynchronous: the transport keeps its own
//! reference to the message bytes and later reports a
//! [`RawMessage::Completion`] carrying the token it was given. Inbound frames
//! are written by the remote into the channel's [`ReceiveRegion`] and
//! announced as [`RawMessage::Receive`] segment lists.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, TryLockError};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::{SubmitError, TransportBusy, TransportError};
use crate::pool::DescriptorHandle;
use crate::rx::{NotifyReport, ReceiveRing};
use crate::tx::{SubmitOutcome, TransmitRing};
use crate::wire::PayloadMode;

// ─── Transport types ────────────────────────────────────────────────────────

/// Transport-assigned channel identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelHandle(pub u16);

/// Opaque value echoed back in a send completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionToken(pub u64);

impl From<DescriptorHandle> for CompletionToken {
    fn from(h: DescriptorHandle) -> Self {
        CompletionToken(((h.slot as u64) << 32) | h.generation as u64)
    }
}

impl From<CompletionToken> for DescriptorHandle {
    fn from(t: CompletionToken) -> Self {
        DescriptorHandle {
            slot: (t.0 >> 32) as u32,
            generation: t.0 as u32,
        }
    }
}

/// One encoded packet handed to [`ChannelTransport::send`].
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub mode: PayloadMode,
    /// Complete message (inline) or header + reference descriptor.
    pub head: Bytes,
    /// Payload regions for by-reference delivery.
    pub regions: Vec<Bytes>,
}

impl OutboundMessage {
    /// Total bytes the transport moves for this message.
    pub fn wire_len(&self) -> usize {
        self.head.len() + self.regions.iter().map(Bytes::len).sum::<usize>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    Failed,
}

/// A message written by the remote into the receive region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxSegment {
    pub offset: u32,
    pub len: u32,
}

/// Inbound channel notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawMessage {
    /// The remote is done with a previously sent message.
    Completion {
        token: CompletionToken,
        status: CompletionStatus,
    },
    /// New frames in the receive region. `transaction` is acknowledged once
    /// every segment has been consumed.
    Receive {
        transaction: u64,
        segments: Vec<RxSegment>,
    },
}

/// Channel transport consumed by the rings and the manager.
pub trait ChannelTransport: Send + Sync {
    /// Open channel `index` with a queue depth of `capacity` messages.
    fn open(&self, index: u16, capacity: usize) -> Result<ChannelHandle, TransportError>;

    /// Best-effort asynchronous send.
    fn send(
        &self,
        channel: ChannelHandle,
        message: &OutboundMessage,
        token: CompletionToken,
    ) -> Result<(), TransportBusy>;

    /// Poll the next inbound notification.
    fn try_recv(&self, channel: ChannelHandle) -> Option<RawMessage>;

    /// Hand consumed receive transactions back to the remote.
    fn ack_receive(&self, channel: ChannelHandle, transactions: &[u64]);

    /// Synchronous request/reply control exchange.
    fn control(&self, channel: ChannelHandle, request: Bytes) -> Result<Bytes, TransportError>;

    /// Share a receive region with the remote. Returns the region id used in
    /// control messages.
    fn share_region(
        &self,
        channel: ChannelHandle,
        region: Arc<ReceiveRegion>,
    ) -> Result<u32, TransportError>;

    fn close(&self, channel: ChannelHandle);
}

// ─── Receive region ─────────────────────────────────────────────────────────

/// Memory the remote writes inbound messages into.
///
/// Readers copy out what they need inside [`ReceiveRegion::with_slice`] and
/// never keep a reference past acknowledgement.
pub struct ReceiveRegion {
    buf: RwLock<Box<[u8]>>,
}

impl ReceiveRegion {
    pub fn new(size: usize) -> Self {
        ReceiveRegion {
            buf: RwLock::new(vec![0u8; size].into_boxed_slice()),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `data` in at `offset`. Returns `false` if it does not fit.
    pub fn write(&self, offset: usize, data: &[u8]) -> bool {
        let mut buf = self.buf.write().unwrap_or_else(|e| e.into_inner());
        let Some(end) = offset.checked_add(data.len()) else {
            return false;
        };
        match buf.get_mut(offset..end) {
            Some(dst) => {
                dst.copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    /// Run `f` over `len` bytes at `offset`, or `None` if out of bounds.
    pub fn with_slice<R>(&self, offset: usize, len: usize, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let buf = self.buf.read().unwrap_or_else(|e| e.into_inner());
        let end = offset.checked_add(len)?;
        buf.get(offset..end).map(f)
    }
}

impl std::fmt::Debug for ReceiveRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveRegion").field("len", &self.len()).finish()
    }
}

// ─── Channel ────────────────────────────────────────────────────────────────

/// Result of one [`Channel::pump_transmit`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PumpReport {
    pub sent: usize,
    /// The pool ran dry; a packet is parked until a completion.
    pub stalled: bool,
    /// A send failed after retry and the packet was parked again.
    pub failed: bool,
}

/// One open channel with its bound rings.
///
/// Exactly one transmit ring and one receive ring are bound at construction
/// and stay bound until the channel is dropped.
pub struct Channel {
    index: u16,
    handle: ChannelHandle,
    capacity: usize,
    open: AtomicBool,
    region: Arc<ReceiveRegion>,
    region_id: u32,
    tx: Arc<TransmitRing>,
    rx: Mutex<ReceiveRing>,
}

impl Channel {
    pub fn new(
        index: u16,
        handle: ChannelHandle,
        capacity: usize,
        region: Arc<ReceiveRegion>,
        region_id: u32,
        tx: Arc<TransmitRing>,
        rx: ReceiveRing,
    ) -> Self {
        Channel {
            index,
            handle,
            capacity,
            open: AtomicBool::new(true),
            region,
            region_id,
            tx,
            rx: Mutex::new(rx),
        }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn handle(&self) -> ChannelHandle {
        self.handle
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn region(&self) -> &Arc<ReceiveRegion> {
        &self.region
    }

    pub fn region_id(&self) -> u32 {
        self.region_id
    }

    pub fn tx(&self) -> &Arc<TransmitRing> {
        &self.tx
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Run `f` with exclusive access to the receive ring.
    pub(crate) fn with_rx<R>(&self, f: impl FnOnce(&mut ReceiveRing) -> R) -> R {
        let mut rx = self.rx.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut rx)
    }

    /// Drain inbound notifications: completions for the transmit ring and
    /// received frames for the sink.
    ///
    /// Returns `None` if another context is already servicing this channel.
    pub fn poll_inbound(&self) -> Option<NotifyReport> {
        let mut rx = match self.rx.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        Some(rx.on_channel_notify(Some(&*self.tx)))
    }

    /// Submit up to `budget` packets from the transmit backlog.
    pub fn pump_transmit(&self, budget: usize) -> PumpReport {
        let mut report = PumpReport::default();
        for _ in 0..budget {
            match self.tx.submit_next() {
                Ok(SubmitOutcome::Sent(_)) => report.sent += 1,
                Ok(SubmitOutcome::Stalled) => {
                    report.stalled = true;
                    break;
                }
                Ok(SubmitOutcome::Idle) | Ok(SubmitOutcome::Contended) => break,
                Err(SubmitError::SendFailed { packet, source, .. }) => {
                    debug!(channel = self.index, error = %source, "send failed, parking packet");
                    self.tx.requeue(packet);
                    report.failed = true;
                    break;
                }
                Err(SubmitError::NotActive { .. }) => break,
            }
        }
        report
    }

    /// One worker iteration: inbound first so completions free descriptors
    /// before the backlog is pumped. Returns `true` if anything happened.
    pub fn service(&self, budget: usize) -> bool {
        if !self.is_open() {
            return false;
        }
        let inbound = self.poll_inbound().unwrap_or_default();
        let pump = self.pump_transmit(budget);
        if inbound.redrive && pump.stalled {
            warn!(channel = self.index, "backpressure persists after completion");
        }
        inbound.did_work() || pump.sent > 0
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("index", &self.index)
            .field("handle", &self.handle)
            .field("open", &self.is_open())
            .field("region_id", &self.region_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_roundtrip() {
        let h = DescriptorHandle {
            slot: 17,
            generation: 0xFFFF_FFFE,
        };
        let token = CompletionToken::from(h);
        assert_eq!(DescriptorHandle::from(token), h);
    }

    #[test]
    fn region_bounds() {
        let region = ReceiveRegion::new(64);
        assert!(region.write(60, &[1, 2, 3, 4]));
        assert!(!region.write(61, &[1, 2, 3, 4]));
        assert!(!region.write(usize::MAX, &[1]));
        assert_eq!(region.with_slice(60, 4, |s| s.to_vec()), Some(vec![1, 2, 3, 4]));
        assert_eq!(region.with_slice(60, 5, |s| s.len()), None);
        assert_eq!(region.with_slice(usize::MAX, 2, |s| s.len()), None);
    }

    #[test]
    fn outbound_wire_len() {
        let msg = OutboundMessage {
            mode: PayloadMode::Reference,
            head: Bytes::from_static(&[0; 24]),
            regions: vec![Bytes::from_static(&[0; 4096]), Bytes::from_static(&[0; 10])],
        };
        assert_eq!(msg.wire_len(), 24 + 4106);
    }
}
