//! # Ring Statistics
//!
//! Per-ring counters bumped lock-free from the hot path, and serializable
//! snapshots for reporting.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Declares an atomic counter block and its plain snapshot type.
macro_rules! counters {
    (
        $(#[$meta:meta])*
        $counters:ident => $snapshot:ident {
            $( $(#[$fmeta:meta])* $field:ident ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
        pub struct $snapshot {
            $( $(#[$fmeta])* pub $field: u64, )*
        }

        #[derive(Debug, Default)]
        pub struct $counters {
            $( pub $field: AtomicU64, )*
        }

        impl $counters {
            pub fn snapshot(&self) -> $snapshot {
                $snapshot {
                    $( $field: self.$field.load(Ordering::Relaxed), )*
                }
            }
        }
    };
}

counters! {
    /// Transmit-side statistics.
    TxCounters => TxStats {
        /// Messages accepted by the transport.
        packets_sent,
        /// Frame bytes accepted by the transport.
        bytes_sent,
        inline_sends,
        scattered_sends,
        /// First send attempt refused, retried.
        send_retries,
        /// Refused twice; packet handed back.
        send_failures,
        /// `enqueue` rejected with `Busy`.
        busy_rejections,
        /// `enqueue` rejected while not active.
        suspended_rejections,
        /// `enqueue` rejected because the payload cannot be encoded.
        oversize_rejections,
        completions,
        /// Transitions into the backpressured state.
        backpressure_events,
    }
}

counters! {
    /// Receive-side statistics.
    RxCounters => RxStats {
        packets_delivered,
        bytes_delivered,
        /// All decode failures; the three counters below break it down.
        decode_drops,
        out_of_bounds_drops,
        malformed_drops,
        version_drops,
        /// Acknowledgement batches sent to the remote.
        acks_sent,
        /// Receive transactions covered by those batches.
        segments_acked,
        checksum_verified,
        /// Packets that arrived without a hash and got the ring default.
        hash_defaulted,
    }
}

/// Increment a counter by one.
#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

/// Snapshot of one queue (channel + its two rings).
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub queue: u16,
    pub state: &'static str,
    pub in_flight: usize,
    pub backlog: usize,
    pub backpressured: bool,
    pub tx: TxStats,
    pub rx: RxStats,
}

/// Device-wide snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceStats {
    pub active_queues: u16,
    pub protocol_version: u32,
    pub mtu: u32,
    pub queues: Vec<QueueStats>,
}

impl DeviceStats {
    pub fn packets_sent(&self) -> u64 {
        self.queues.iter().map(|q| q.tx.packets_sent).sum()
    }

    pub fn packets_delivered(&self) -> u64 {
        self.queues.iter().map(|q| q.rx.packets_delivered).sum()
    }

    pub fn decode_drops(&self) -> u64 {
        self.queues.iter().map(|q| q.rx.decode_drops).sum()
    }

    pub fn in_flight(&self) -> usize {
        self.queues.iter().map(|q| q.in_flight).sum()
    }
}
