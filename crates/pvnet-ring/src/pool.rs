//! # Transmit Descriptor Pool
//!
//! Fixed-size, slab-backed arena of [`TransmitDescriptor`]s owned by one
//! transmit ring. The slab is pre-allocated to the pool size at ring
//! construction and never grows: slots are recycled through the slab's free
//! list.
//!
//! Each descriptor carries a reference count. During a send there are two
//! owners, the ring (until the submit call returns) and the transport (until
//! the completion arrives). The slot returns to the free list only when the
//! count reaches zero.
//!
//! Handles carry a generation tag so a late or duplicated completion for a
//! recycled slot is detected instead of releasing someone else's descriptor.

use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use quanta::Instant;
use slab::Slab;

// ─── Handle ─────────────────────────────────────────────────────────────────

/// Reference to an acquired descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorHandle {
    pub slot: u32,
    pub generation: u32,
}

// ─── Descriptor ─────────────────────────────────────────────────────────────

/// How the frame bytes of an in-flight descriptor travel.
#[derive(Debug, Clone, Default)]
pub enum DescriptorPayload {
    /// Acquired but not yet encoded.
    #[default]
    Empty,
    /// Complete message copied into one buffer.
    Inline(Bytes),
    /// Message head plus references to the caller's payload regions.
    Scattered { head: Bytes, regions: Vec<Bytes> },
}

/// Bookkeeping attached to a descriptor for the completion path.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorContext {
    /// Frame length, for byte accounting on completion.
    pub len: usize,
    pub acquired_at: Instant,
}

/// One in-flight outbound packet.
#[derive(Debug)]
pub struct TransmitDescriptor {
    pub slot: u32,
    pub generation: u32,
    refcount: u32,
    pub payload: DescriptorPayload,
    pub context: DescriptorContext,
}

impl TransmitDescriptor {
    pub fn handle(&self) -> DescriptorHandle {
        DescriptorHandle {
            slot: self.slot,
            generation: self.generation,
        }
    }

    pub fn refcount(&self) -> u32 {
        self.refcount
    }
}

/// Outcome of [`DescriptorPool::release`].
#[derive(Debug)]
pub enum Release {
    /// Last reference dropped; the slot is free again.
    Freed(TransmitDescriptor),
    /// Other references remain.
    Held(u32),
    /// The handle does not name a live descriptor.
    Stale,
}

// ─── Pool ───────────────────────────────────────────────────────────────────

struct PoolInner {
    slots: Slab<TransmitDescriptor>,
    next_generation: u32,
}

/// Per-ring descriptor arena.
pub struct DescriptorPool {
    inner: Mutex<PoolInner>,
    capacity: usize,
}

impl DescriptorPool {
    /// Create a pool of `capacity` descriptors. The slab pre-allocates.
    pub fn new(capacity: usize) -> Self {
        DescriptorPool {
            inner: Mutex::new(PoolInner {
                slots: Slab::with_capacity(capacity),
                next_generation: 0,
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take a free descriptor with reference count 1.
    ///
    /// Returns `None` when every slot is in flight. That is backpressure, not
    /// an error: retry after a completion.
    pub fn acquire(&self) -> Option<DescriptorHandle> {
        let mut inner = self.lock();
        if inner.slots.len() >= self.capacity {
            return None;
        }
        let generation = inner.next_generation;
        inner.next_generation = generation.wrapping_add(1);
        let entry = inner.slots.vacant_entry();
        let slot = entry.key() as u32;
        entry.insert(TransmitDescriptor {
            slot,
            generation,
            refcount: 1,
            payload: DescriptorPayload::Empty,
            context: DescriptorContext {
                len: 0,
                acquired_at: Instant::now(),
            },
        });
        Some(DescriptorHandle { slot, generation })
    }

    /// Add a reference. Returns `false` for a stale handle.
    pub fn hold(&self, handle: DescriptorHandle) -> bool {
        let mut inner = self.lock();
        match live_mut(&mut inner.slots, handle) {
            Some(desc) => {
                desc.refcount += 1;
                true
            }
            None => false,
        }
    }

    /// Drop a reference, freeing the slot when it was the last one.
    pub fn release(&self, handle: DescriptorHandle) -> Release {
        let mut inner = self.lock();
        let Some(desc) = live_mut(&mut inner.slots, handle) else {
            return Release::Stale;
        };
        desc.refcount -= 1;
        if desc.refcount > 0 {
            return Release::Held(desc.refcount);
        }
        Release::Freed(inner.slots.remove(handle.slot as usize))
    }

    /// Attach the encoded message to an acquired descriptor.
    pub fn set_payload(&self, handle: DescriptorHandle, payload: DescriptorPayload, len: usize) -> bool {
        let mut inner = self.lock();
        match live_mut(&mut inner.slots, handle) {
            Some(desc) => {
                desc.payload = payload;
                desc.context.len = len;
                true
            }
            None => false,
        }
    }

    /// Current reference count, or `None` if the handle is stale.
    pub fn refcount(&self, handle: DescriptorHandle) -> Option<u32> {
        let mut inner = self.lock();
        live_mut(&mut inner.slots, handle).map(|d| d.refcount)
    }

    /// Descriptors currently owned by a packet.
    pub fn in_flight(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.capacity - self.in_flight()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

fn live_mut(
    slots: &mut Slab<TransmitDescriptor>,
    handle: DescriptorHandle,
) -> Option<&mut TransmitDescriptor> {
    slots
        .get_mut(handle.slot as usize)
        .filter(|d| d.generation == handle.generation && d.refcount > 0)
}

impl std::fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("capacity", &self.capacity)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_until_exhausted() {
        let pool = DescriptorPool::new(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.slot, b.slot);
        assert!(pool.acquire().is_none());
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.refcount(a), Some(1));
    }

    #[test]
    fn slot_freed_only_at_zero() {
        let pool = DescriptorPool::new(1);
        let h = pool.acquire().unwrap();
        assert!(pool.hold(h));
        assert_eq!(pool.refcount(h), Some(2));

        assert!(matches!(pool.release(h), Release::Held(1)));
        assert_eq!(pool.free_count(), 0);

        match pool.release(h) {
            Release::Freed(desc) => assert_eq!(desc.handle(), h),
            other => panic!("expected Freed, got {other:?}"),
        }
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn stale_handle_after_recycle() {
        let pool = DescriptorPool::new(1);
        let first = pool.acquire().unwrap();
        assert!(matches!(pool.release(first), Release::Freed(_)));

        let second = pool.acquire().unwrap();
        assert_eq!(first.slot, second.slot);
        assert_ne!(first.generation, second.generation);

        // A duplicated completion for the old handle must not touch the new owner.
        assert!(matches!(pool.release(first), Release::Stale));
        assert!(!pool.hold(first));
        assert_eq!(pool.refcount(second), Some(1));
    }

    #[test]
    fn payload_attached() {
        let pool = DescriptorPool::new(4);
        let h = pool.acquire().unwrap();
        assert!(pool.set_payload(h, DescriptorPayload::Inline(Bytes::from_static(b"msg")), 3));
        match pool.release(h) {
            Release::Freed(desc) => {
                assert_eq!(desc.context.len, 3);
                assert!(matches!(desc.payload, DescriptorPayload::Inline(_)));
            }
            other => panic!("expected Freed, got {other:?}"),
        }
    }

    #[test]
    fn conservation_over_many_cycles() {
        let pool = DescriptorPool::new(8);
        for round in 0..100 {
            let handles: Vec<_> = (0..1 + round % 8).map(|_| pool.acquire().unwrap()).collect();
            for h in &handles {
                pool.hold(*h);
            }
            for h in handles.iter().rev() {
                pool.release(*h);
                pool.release(*h);
            }
            assert_eq!(pool.free_count(), 8);
        }
    }
}
