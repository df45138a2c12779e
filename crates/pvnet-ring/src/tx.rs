//! # Transmit Ring
//!
//! One per queue. Any number of producers call [`TransmitRing::enqueue`]
//! concurrently; a single consumer (the channel's worker) calls
//! [`TransmitRing::submit_next`] to encode the next packet, pick its delivery
//! mode and hand it to the transport.
//!
//! ```text
//!  producers ──enqueue──▶ [bounded MPSC backlog] ──submit_next──▶ codec ──▶ transport
//!                                                     │                         │
//!                                           acquire descriptor        completion token
//!                                                     └──────on_complete◀───────┘
//! ```
//!
//! The consumer side is guarded by a `try_lock`: a second context calling
//! `submit_next` concurrently gets [`SubmitOutcome::Contended`] instead of
//! racing for the same backlog head.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use bytes::BytesMut;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use crate::channel::{
    ChannelHandle, ChannelTransport, CompletionStatus, CompletionToken, OutboundMessage,
};
use crate::codec::{Codec, MAX_PAYLOAD_LEN};
use crate::error::{EnqueueError, StateError, SubmitError};
use crate::packet::PacketDescriptor;
use crate::pool::{DescriptorHandle, DescriptorPayload, DescriptorPool, Release};
use crate::state::{AtomicRingState, RingState};
use crate::stats::{add, bump, TxCounters, TxStats};
use crate::wire::PayloadMode;

/// Sizing and encoding parameters for one transmit ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxRingConfig {
    pub pool_size: usize,
    pub backlog_capacity: usize,
    /// Messages strictly smaller than this are copied inline.
    pub inline_threshold: usize,
    pub hash_enabled: bool,
}

impl Default for TxRingConfig {
    fn default() -> Self {
        TxRingConfig {
            pool_size: 512,
            backlog_capacity: 1024,
            inline_threshold: 256,
            hash_enabled: true,
        }
    }
}

/// Inline below the threshold, by reference otherwise.
#[inline]
pub fn delivery_mode(encoded_len: usize, inline_threshold: usize) -> PayloadMode {
    if encoded_len < inline_threshold {
        PayloadMode::Inline
    } else {
        PayloadMode::Reference
    }
}

/// A packet accepted by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub handle: DescriptorHandle,
    pub mode: PayloadMode,
    pub encoded_len: usize,
}

/// Non-error outcomes of [`TransmitRing::submit_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Backlog empty.
    Idle,
    Sent(Delivery),
    /// No free descriptor. The head packet is parked until a completion.
    Stalled,
    /// Another context holds the consumer side.
    Contended,
}

struct ConsumerState {
    channel: Option<ChannelHandle>,
    /// Packets taken off the backlog but not yet sent. Always drained before
    /// the backlog so submission order is preserved.
    parked: VecDeque<PacketDescriptor>,
    scratch: BytesMut,
}

pub struct TransmitRing {
    index: u16,
    transport: Arc<dyn ChannelTransport>,
    codec: Codec,
    inline_threshold: usize,
    pool: DescriptorPool,
    backlog_tx: Sender<PacketDescriptor>,
    backlog_rx: Receiver<PacketDescriptor>,
    state: AtomicRingState,
    backpressured: AtomicBool,
    consumer: Mutex<ConsumerState>,
    counters: TxCounters,
}

impl TransmitRing {
    pub fn new(index: u16, transport: Arc<dyn ChannelTransport>, config: &TxRingConfig) -> Self {
        let (backlog_tx, backlog_rx) = crossbeam_channel::bounded(config.backlog_capacity);
        TransmitRing {
            index,
            transport,
            codec: Codec::new(config.hash_enabled),
            inline_threshold: config.inline_threshold,
            pool: DescriptorPool::new(config.pool_size),
            backlog_tx,
            backlog_rx,
            state: AtomicRingState::new(RingState::Detached),
            backpressured: AtomicBool::new(false),
            consumer: Mutex::new(ConsumerState {
                channel: None,
                parked: VecDeque::new(),
                scratch: BytesMut::with_capacity(config.inline_threshold.max(64)),
            }),
            counters: TxCounters::default(),
        }
    }

    // ─── Producer side ──────────────────────────────────────────────────

    /// Queue a packet for transmission. Never blocks.
    pub fn enqueue(&self, packet: PacketDescriptor) -> Result<(), EnqueueError> {
        if packet.len() > MAX_PAYLOAD_LEN {
            bump(&self.counters.oversize_rejections);
            return Err(EnqueueError::TooLarge(packet));
        }
        if self.state.load() != RingState::Active {
            bump(&self.counters.suspended_rejections);
            return Err(EnqueueError::RingSuspended(packet));
        }
        if self.pool.free_count() == 0 {
            self.signal_backpressure();
            bump(&self.counters.busy_rejections);
            return Err(EnqueueError::Busy(packet));
        }
        match self.backlog_tx.try_send(packet) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(packet)) => {
                self.signal_backpressure();
                bump(&self.counters.busy_rejections);
                Err(EnqueueError::Busy(packet))
            }
            Err(TrySendError::Disconnected(packet)) => Err(EnqueueError::RingSuspended(packet)),
        }
    }

    fn signal_backpressure(&self) {
        if !self.backpressured.swap(true, Ordering::AcqRel) {
            bump(&self.counters.backpressure_events);
            debug!(ring = self.index, "backpressure on");
        }
    }

    // ─── Consumer side ──────────────────────────────────────────────────

    fn lock_consumer(&self) -> MutexGuard<'_, ConsumerState> {
        self.consumer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Encode and send the next queued packet.
    pub fn submit_next(&self) -> Result<SubmitOutcome, SubmitError> {
        let mut consumer = match self.consumer.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return Ok(SubmitOutcome::Contended),
        };
        let ring = self.index;
        let channel = match (self.state.load(), consumer.channel) {
            (RingState::Active, Some(channel)) => channel,
            _ => return Err(SubmitError::NotActive { ring }),
        };

        let packet = match consumer.parked.pop_front() {
            Some(p) => p,
            None => match self.backlog_rx.try_recv() {
                Ok(p) => p,
                Err(_) => return Ok(SubmitOutcome::Idle),
            },
        };

        let Some(handle) = self.pool.acquire() else {
            consumer.parked.push_front(packet);
            self.signal_backpressure();
            return Ok(SubmitOutcome::Stalled);
        };

        let encoded_len = self.codec.encoded_len(&packet);
        let mode = delivery_mode(encoded_len, self.inline_threshold);
        let view = self.codec.encode(&packet, mode, &mut consumer.scratch);
        let message = OutboundMessage {
            mode,
            head: view.head,
            regions: view.regions,
        };
        let payload = match mode {
            PayloadMode::Inline => DescriptorPayload::Inline(message.head.clone()),
            PayloadMode::Reference => DescriptorPayload::Scattered {
                head: message.head.clone(),
                regions: message.regions.clone(),
            },
        };
        self.pool.set_payload(handle, payload, packet.len());

        // Second reference for the transport until the completion arrives.
        self.pool.hold(handle);
        let token = CompletionToken::from(handle);
        let sent = match self.transport.send(channel, &message, token) {
            Ok(()) => Ok(()),
            Err(_) => {
                bump(&self.counters.send_retries);
                self.transport.send(channel, &message, token)
            }
        };

        match sent {
            Ok(()) => {
                self.pool.release(handle);
                bump(&self.counters.packets_sent);
                add(&self.counters.bytes_sent, packet.len() as u64);
                match mode {
                    PayloadMode::Inline => bump(&self.counters.inline_sends),
                    PayloadMode::Reference => bump(&self.counters.scattered_sends),
                }
                Ok(SubmitOutcome::Sent(Delivery {
                    handle,
                    mode,
                    encoded_len,
                }))
            }
            Err(source) => {
                self.pool.release(handle);
                self.pool.release(handle);
                bump(&self.counters.send_failures);
                self.signal_backpressure();
                warn!(ring, slot = handle.slot, "send refused after retry, returning packet");
                Err(SubmitError::SendFailed {
                    ring,
                    packet,
                    source,
                })
            }
        }
    }

    /// Put a packet back at the head of the queue, ahead of the backlog.
    pub fn requeue(&self, packet: PacketDescriptor) {
        self.lock_consumer().parked.push_front(packet);
    }

    /// Retire the descriptor named by `token`.
    ///
    /// Returns `true` if the ring was backpressured, meaning producers should
    /// be re-driven.
    pub fn on_complete(&self, token: CompletionToken, status: CompletionStatus) -> bool {
        let handle = DescriptorHandle::from(token);
        if let Release::Stale = self.pool.release(handle) {
            warn!(ring = self.index, slot = handle.slot, "completion for unknown descriptor");
            return false;
        }
        bump(&self.counters.completions);
        if status == CompletionStatus::Failed {
            debug!(ring = self.index, slot = handle.slot, "remote reported send failure");
        }
        if self.backpressured.swap(false, Ordering::AcqRel) {
            debug!(ring = self.index, "backpressure cleared");
            return true;
        }
        false
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    /// Bind to an open channel.
    pub fn attach(&self, channel: ChannelHandle) -> Result<(), StateError> {
        self.state.transition(self.index, RingState::Attached)?;
        self.lock_consumer().channel = Some(channel);
        Ok(())
    }

    pub fn activate(&self) -> Result<(), StateError> {
        self.state.transition(self.index, RingState::Active).map(|_| ())
    }

    /// Stop accepting packets. In-flight sends still complete.
    ///
    /// Takes the consumer side, so a `submit_next` already past its state
    /// check finishes its send first and the next one sees `Suspended`. Once
    /// this returns, [`TransmitRing::in_flight`] can only go down.
    pub fn suspend(&self) -> Result<(), StateError> {
        let _consumer = self.lock_consumer();
        self.state.transition(self.index, RingState::Suspended).map(|_| ())
    }

    pub fn resume(&self) -> Result<(), StateError> {
        match self.state.load() {
            RingState::Suspended => self.state.transition(self.index, RingState::Active).map(|_| ()),
            found => Err(StateError {
                ring: self.index,
                found,
                to: RingState::Active,
            }),
        }
    }

    /// Unbind from the channel and hand back every packet never sent.
    ///
    /// The caller must have drained in-flight descriptors first.
    pub fn detach(&self) -> Result<Vec<PacketDescriptor>, StateError> {
        self.state.transition(self.index, RingState::Detached)?;
        let in_flight = self.pool.in_flight();
        if in_flight > 0 {
            warn!(ring = self.index, in_flight, "detaching with descriptors in flight");
        }
        let mut consumer = self.lock_consumer();
        consumer.channel = None;
        let mut returned: Vec<PacketDescriptor> = consumer.parked.drain(..).collect();
        returned.extend(self.backlog_rx.try_iter());
        Ok(returned)
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn state(&self) -> RingState {
        self.state.load()
    }

    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }

    /// Packets waiting to be submitted.
    pub fn backlog_len(&self) -> usize {
        self.backlog_rx.len() + self.lock_consumer().parked.len()
    }

    pub fn is_backpressured(&self) -> bool {
        self.backpressured.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> TxStats {
        self.counters.snapshot()
    }
}

impl std::fmt::Debug for TransmitRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransmitRing")
            .field("index", &self.index)
            .field("state", &self.state.load())
            .field("pool", &self.pool)
            .field("backpressured", &self.is_backpressured())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{RawMessage, ReceiveRegion};
    use crate::error::{TransportBusy, TransportError};
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    /// Records sends; refuses the next `refuse` attempts.
    #[derive(Default)]
    struct MockTransport {
        sent: Mutex<Vec<(OutboundMessage, CompletionToken)>>,
        refuse: AtomicUsize,
    }

    impl MockTransport {
        fn tokens(&self) -> Vec<CompletionToken> {
            self.sent.lock().unwrap().iter().map(|(_, t)| *t).collect()
        }
    }

    impl ChannelTransport for MockTransport {
        fn open(&self, index: u16, _capacity: usize) -> Result<ChannelHandle, TransportError> {
            Ok(ChannelHandle(index))
        }

        fn send(
            &self,
            _channel: ChannelHandle,
            message: &OutboundMessage,
            token: CompletionToken,
        ) -> Result<(), TransportBusy> {
            let refuse = self.refuse.load(Ordering::SeqCst);
            if refuse > 0 {
                self.refuse.store(refuse - 1, Ordering::SeqCst);
                return Err(TransportBusy);
            }
            self.sent.lock().unwrap().push((message.clone(), token));
            Ok(())
        }

        fn try_recv(&self, _channel: ChannelHandle) -> Option<RawMessage> {
            None
        }

        fn ack_receive(&self, _channel: ChannelHandle, _transactions: &[u64]) {}

        fn control(&self, _channel: ChannelHandle, _request: Bytes) -> Result<Bytes, TransportError> {
            Err(TransportError::Rejected("mock".into()))
        }

        fn share_region(
            &self,
            _channel: ChannelHandle,
            _region: Arc<ReceiveRegion>,
        ) -> Result<u32, TransportError> {
            Ok(0)
        }

        fn close(&self, _channel: ChannelHandle) {}
    }

    fn active_ring(pool_size: usize) -> (Arc<MockTransport>, TransmitRing) {
        let transport = Arc::new(MockTransport::default());
        let config = TxRingConfig {
            pool_size,
            backlog_capacity: 16,
            inline_threshold: 256,
            hash_enabled: true,
        };
        let ring = TransmitRing::new(0, transport.clone(), &config);
        ring.attach(ChannelHandle(0)).unwrap();
        ring.activate().unwrap();
        (transport, ring)
    }

    fn packet(len: usize) -> PacketDescriptor {
        PacketDescriptor::new(Bytes::from(vec![0xAB; len]))
    }

    fn sent(outcome: SubmitOutcome) -> Delivery {
        match outcome {
            SubmitOutcome::Sent(d) => d,
            other => panic!("expected Sent, got {other:?}"),
        }
    }

    #[test]
    fn delivery_mode_is_threshold_only() {
        assert_eq!(delivery_mode(255, 256), PayloadMode::Inline);
        assert_eq!(delivery_mode(256, 256), PayloadMode::Reference);
        assert_eq!(delivery_mode(0, 0), PayloadMode::Reference);
    }

    #[test]
    fn enqueue_rejected_unless_active() {
        let transport = Arc::new(MockTransport::default());
        let ring = TransmitRing::new(3, transport, &TxRingConfig::default());
        let err = ring.enqueue(packet(10)).unwrap_err();
        assert!(err.is_suspended());
        assert_eq!(err.into_packet().len(), 10);
        assert_eq!(ring.stats().suspended_rejections, 1);
    }

    #[test]
    fn small_inline_large_scattered() {
        let (transport, ring) = active_ring(4);
        ring.enqueue(packet(64)).unwrap();
        ring.enqueue(packet(4096)).unwrap();

        let small = sent(ring.submit_next().unwrap());
        assert_eq!(small.mode, PayloadMode::Inline);
        let large = sent(ring.submit_next().unwrap());
        assert_eq!(large.mode, PayloadMode::Reference);

        let sends = transport.sent.lock().unwrap();
        assert!(sends[0].0.regions.is_empty());
        assert_eq!(sends[1].0.regions.len(), 1);
        assert_eq!(ring.in_flight(), 2);
        let stats = ring.stats();
        assert_eq!((stats.inline_sends, stats.scattered_sends), (1, 1));
    }

    #[test]
    fn transient_busy_retried_once() {
        let (transport, ring) = active_ring(4);
        transport.refuse.store(1, Ordering::SeqCst);
        ring.enqueue(packet(64)).unwrap();
        sent(ring.submit_next().unwrap());
        assert_eq!(ring.stats().send_retries, 1);
        assert_eq!(ring.pool().refcount(transport.tokens()[0].into()), Some(1));
    }

    #[test]
    fn second_refusal_returns_packet_and_frees_descriptor() {
        let (transport, ring) = active_ring(4);
        transport.refuse.store(2, Ordering::SeqCst);
        ring.enqueue(packet(77)).unwrap();
        match ring.submit_next() {
            Err(SubmitError::SendFailed { packet, .. }) => assert_eq!(packet.len(), 77),
            other => panic!("expected SendFailed, got {other:?}"),
        }
        assert_eq!(ring.in_flight(), 0);
        assert!(ring.is_backpressured());
        assert_eq!(ring.stats().send_failures, 1);
    }

    #[test]
    fn exhaustion_stalls_then_completion_redrives() {
        let (transport, ring) = active_ring(2);
        for _ in 0..3 {
            ring.enqueue(packet(32)).unwrap();
        }
        sent(ring.submit_next().unwrap());
        sent(ring.submit_next().unwrap());
        assert_eq!(ring.submit_next().unwrap(), SubmitOutcome::Stalled);
        assert!(ring.enqueue(packet(1)).unwrap_err().is_busy());
        assert!(ring.is_backpressured());

        let first = transport.tokens()[0];
        assert!(ring.on_complete(first, CompletionStatus::Success));
        assert!(!ring.is_backpressured());
        sent(ring.submit_next().unwrap());
        assert_eq!(ring.submit_next().unwrap(), SubmitOutcome::Idle);
    }

    #[test]
    fn submission_preserves_backlog_order() {
        let (transport, ring) = active_ring(8);
        for len in 1..=5 {
            ring.enqueue(packet(len)).unwrap();
        }
        while let Ok(SubmitOutcome::Sent(_)) = ring.submit_next() {}
        let codec = Codec::new(true);
        let lens: Vec<usize> = transport
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|(m, _)| codec.decode(&m.head).unwrap().len())
            .collect();
        assert_eq!(lens, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn stale_completion_ignored() {
        let (transport, ring) = active_ring(1);
        ring.enqueue(packet(8)).unwrap();
        sent(ring.submit_next().unwrap());
        let token = transport.tokens()[0];
        ring.on_complete(token, CompletionStatus::Success);
        ring.on_complete(token, CompletionStatus::Success);
        assert_eq!(ring.stats().completions, 1);
        assert_eq!(ring.pool().free_count(), 1);
    }

    #[test]
    fn detach_returns_unsent_packets() {
        let (_transport, ring) = active_ring(4);
        ring.enqueue(packet(1)).unwrap();
        ring.enqueue(packet(2)).unwrap();
        ring.suspend().unwrap();
        assert!(ring.enqueue(packet(3)).unwrap_err().is_suspended());
        assert!(matches!(ring.submit_next(), Err(SubmitError::NotActive { ring: 0 })));
        let returned = ring.detach().unwrap();
        assert_eq!(returned.iter().map(|p| p.len()).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(ring.state(), RingState::Detached);
    }

    #[test]
    fn oversize_packet_rejected_at_enqueue() {
        let (transport, ring) = active_ring(4);
        let huge = PacketDescriptor::new(Bytes::from(vec![0u8; MAX_PAYLOAD_LEN + 1]));
        let err = ring.enqueue(huge).unwrap_err();
        assert!(matches!(err, EnqueueError::TooLarge(_)));
        assert_eq!(err.into_packet().len(), MAX_PAYLOAD_LEN + 1);
        assert_eq!(ring.stats().oversize_rejections, 1);
        assert_eq!(ring.backlog_len(), 0);
        assert!(transport.tokens().is_empty());
    }

    #[test]
    fn nothing_acquired_after_suspend_returns() {
        let config = TxRingConfig {
            pool_size: 4096,
            backlog_capacity: 4096,
            inline_threshold: 256,
            hash_enabled: true,
        };
        for _ in 0..200 {
            let transport = Arc::new(MockTransport::default());
            let ring = TransmitRing::new(0, transport.clone(), &config);
            ring.attach(ChannelHandle(0)).unwrap();
            ring.activate().unwrap();
            for _ in 0..2000 {
                ring.enqueue(packet(16)).unwrap();
            }

            let seen = std::thread::scope(|s| {
                let consumer = s.spawn(|| {
                    while let Ok(outcome) = ring.submit_next() {
                        if outcome == SubmitOutcome::Idle {
                            break;
                        }
                    }
                });
                std::thread::yield_now();
                ring.suspend().unwrap();
                let seen = ring.in_flight();
                consumer.join().unwrap();
                seen
            });
            assert_eq!(ring.in_flight(), seen);
            assert_eq!(transport.tokens().len(), seen);
        }
    }

    #[test]
    fn requeued_packet_goes_first() {
        let (transport, ring) = active_ring(4);
        ring.enqueue(packet(2)).unwrap();
        ring.requeue(packet(1));
        sent(ring.submit_next().unwrap());
        let first = &transport.sent.lock().unwrap()[0].0;
        assert_eq!(Codec::new(true).decode(&first.head).unwrap().len(), 1);
    }
}
