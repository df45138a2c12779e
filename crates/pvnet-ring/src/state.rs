//! Ring and device lifecycle state.
//!
//! ```text
//!   Detached ──attach──▶ Attached ──activate──▶ Active ──suspend──▶ Suspended
//!      ▲                    │                     ▲                    │
//!      └────────────────────┴──────detach─────────┼────────────────────┘
//!                                                 └──────resume────────┘
//! ```

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::StateError;

/// Lifecycle of a transmit or receive ring.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RingState {
    #[default]
    Detached = 0,
    Attached = 1,
    Active = 2,
    Suspended = 3,
}

impl RingState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => RingState::Attached,
            2 => RingState::Active,
            3 => RingState::Suspended,
            _ => RingState::Detached,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RingState::Detached => "detached",
            RingState::Attached => "attached",
            RingState::Active => "active",
            RingState::Suspended => "suspended",
        }
    }

    /// Whether `self → to` is a legal transition.
    pub fn can_move_to(self, to: RingState) -> bool {
        matches!(
            (self, to),
            (RingState::Detached, RingState::Attached)
                | (RingState::Attached, RingState::Active)
                | (RingState::Attached, RingState::Detached)
                | (RingState::Active, RingState::Suspended)
                | (RingState::Suspended, RingState::Active)
                | (RingState::Suspended, RingState::Detached)
        )
    }
}

/// Ring state shared between producers, the consumer and the manager.
#[derive(Debug, Default)]
pub struct AtomicRingState(AtomicU8);

impl AtomicRingState {
    pub fn new(state: RingState) -> Self {
        AtomicRingState(AtomicU8::new(state as u8))
    }

    #[inline]
    pub fn load(&self) -> RingState {
        RingState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `to`, failing if the current state does not allow it.
    pub fn transition(&self, ring: u16, to: RingState) -> Result<RingState, StateError> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let found = RingState::from_u8(current);
            if !found.can_move_to(to) {
                return Err(StateError { ring, found, to });
            }
            match self
                .0
                .compare_exchange(current, to as u8, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(found),
                Err(actual) => current = actual,
            }
        }
    }
}

/// Device-wide state held by the channel manager.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    #[default]
    Detached,
    Active,
    /// TX quiesced and RX stopped; channels still open.
    Suspended,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        let s = AtomicRingState::new(RingState::Detached);
        assert_eq!(s.transition(0, RingState::Attached).unwrap(), RingState::Detached);
        s.transition(0, RingState::Active).unwrap();
        s.transition(0, RingState::Suspended).unwrap();
        s.transition(0, RingState::Detached).unwrap();
        assert_eq!(s.load(), RingState::Detached);
    }

    #[test]
    fn illegal_transition_rejected() {
        let s = AtomicRingState::new(RingState::Detached);
        let err = s.transition(3, RingState::Active).unwrap_err();
        assert_eq!(err.ring, 3);
        assert_eq!(err.found, RingState::Detached);
        assert_eq!(err.to, RingState::Active);
        assert_eq!(s.load(), RingState::Detached);
    }

    #[test]
    fn active_cannot_detach_directly() {
        assert!(!RingState::Active.can_move_to(RingState::Detached));
        assert!(RingState::Suspended.can_move_to(RingState::Active));
    }
}
