//! Error types.
//!
//! Per-packet failures ([`DecodeError`], [`EnqueueError`]) are handled by the
//! ring that observes them. Only [`ManagerError`] crosses the device boundary.

use std::time::Duration;

use thiserror::Error;

use crate::packet::PacketDescriptor;
use crate::state::{DeviceState, RingState};

// ─── Producer side ──────────────────────────────────────────────────────────

/// Rejection from [`crate::tx::TransmitRing::enqueue`].
///
/// Ownership of the packet is always handed back so the caller can retry or
/// fall back to a software queue.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The ring is not in the `Active` state.
    #[error("transmit ring is not active")]
    RingSuspended(PacketDescriptor),
    /// No descriptor or backlog slot is available right now.
    #[error("transmit ring is busy")]
    Busy(PacketDescriptor),
    /// Payload longer than [`crate::codec::MAX_PAYLOAD_LEN`].
    #[error("packet exceeds the largest encodable payload")]
    TooLarge(PacketDescriptor),
}

impl EnqueueError {
    /// Recover the rejected packet.
    pub fn into_packet(self) -> PacketDescriptor {
        match self {
            EnqueueError::RingSuspended(p) | EnqueueError::Busy(p) | EnqueueError::TooLarge(p) => p,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, EnqueueError::Busy(_))
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, EnqueueError::RingSuspended(_))
    }
}

/// Failure from [`crate::tx::TransmitRing::submit_next`].
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("transmit ring {ring} is not active")]
    NotActive { ring: u16 },
    /// The transport refused the send twice. The packet is returned.
    #[error("transport refused send on ring {ring} after retry")]
    SendFailed {
        ring: u16,
        packet: PacketDescriptor,
        #[source]
        source: TransportBusy,
    },
}

impl SubmitError {
    /// Recover the packet if this error carries one.
    pub fn into_packet(self) -> Option<PacketDescriptor> {
        match self {
            SubmitError::SendFailed { packet, .. } => Some(packet),
            SubmitError::NotActive { .. } => None,
        }
    }
}

// ─── Codec ──────────────────────────────────────────────────────────────────

/// Failure decoding an encapsulated or control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// A declared region (metadata, payload, receive segment) lies outside
    /// the buffer it must be contained in.
    #[error("declared region exceeds buffer bounds")]
    OutOfBounds,
    /// Structurally invalid message: truncated header, unknown message kind,
    /// inconsistent lengths, or a bad metadata item.
    #[error("malformed message")]
    Malformed,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
}

// ─── Transport ──────────────────────────────────────────────────────────────

/// The channel cannot accept a send right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("channel transport is busy")]
pub struct TransportBusy;

/// Failure of a channel transport setup or control operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error(transparent)]
    Busy(#[from] TransportBusy),
    #[error("channel {0} is closed")]
    Closed(u16),
    #[error("channel {0} is not available")]
    Unavailable(u16),
    #[error("request rejected: {0}")]
    Rejected(String),
}

// ─── Ring lifecycle ─────────────────────────────────────────────────────────

/// An illegal ring state transition was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("ring {ring}: cannot move to {to:?} from {found:?}")]
pub struct StateError {
    pub ring: u16,
    pub found: RingState,
    pub to: RingState,
}

// ─── Manager ────────────────────────────────────────────────────────────────

/// Device-level failure surfaced by [`crate::manager::ChannelManager`].
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The remote refused the primary channel setup, or the granted queue
    /// count fell below the configured floor.
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),
    /// In-flight transmit descriptors did not retire before the deadline.
    #[error("transmit drain timed out after {waited:?} with {pending} descriptors in flight")]
    DrainTimeout { pending: usize, waited: Duration },
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("control protocol: {0}")]
    Protocol(#[from] DecodeError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("device is {found:?}, expected {expected:?}")]
    InvalidState {
        expected: DeviceState,
        found: DeviceState,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
}
