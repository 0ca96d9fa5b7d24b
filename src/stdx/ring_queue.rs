//! Bounded MPMC ring of single-word slots.
//!
//! Producers and consumers each claim an index with one `fetch_add` on their
//! cursor and then run the slot protocol from [`super::slot`] on that index.
//! There is no CAS retry loop on the cursors, so contention never turns into
//! a retry storm; the only waiting happens per slot.
//!
//! # Invariants
//! - Slot count is a power of two; cursors are unbounded and masked on use.
//! - Cursors advance by [`RING_STRIDE`], which is odd, so the k-th push and the
//!   k-th pop land on the same slot while neighbouring claims sit on different
//!   cache lines.
//! - The ring does not track occupancy. Callers must keep outstanding values
//!   at or below [`RingQueue::capacity`]; a push past that blocks until a
//!   reader frees the target slot.
//!
//! # Non-blocking pop
//!
//! `pop(false)` may return `None` even though a value is about to land: the
//! claimed slot gets a skip obligation and the value moves to a later index.
//! A reader that keeps polling non-blockingly faster than writers publish can
//! therefore starve itself. Callers only use non-blocking pops when they have
//! other work to do and fall back to blocking pops when idle.

#[cfg(loom)]
use loom::sync::atomic::{AtomicU64, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicU64, Ordering};

use std::sync::Arc;

use crossbeam_utils::CachePadded;

use super::monitor::MonitorPool;
use super::slot::{Slot, VALUE_MAX};

/// Bytes assumed to share a cache line (destructive interference size).
const FALSE_SHARING_SIZE: u64 = 128;

/// Cursor increment: one slot past a cache line worth of slots.
pub const RING_STRIDE: u64 = FALSE_SHARING_SIZE / std::mem::size_of::<u64>() as u64 + 1;

const _: () = assert!(RING_STRIDE % 2 == 1, "stride must be odd");

/// Lock-free MPMC ring carrying non-zero `u64` payloads.
#[derive(Debug)]
pub struct RingQueue {
    slots: Box<[Slot]>,
    mask: u64,
    write: CachePadded<AtomicU64>,
    read: CachePadded<AtomicU64>,
    monitors: Arc<MonitorPool>,
}

impl RingQueue {
    /// Creates a ring with at least `min_capacity` slots.
    pub fn new(min_capacity: usize, monitors: Arc<MonitorPool>) -> Self {
        assert!(min_capacity > 0, "ring capacity must be > 0");
        let size = min_capacity
            .checked_next_power_of_two()
            .expect("ring capacity overflow");
        let slots = (0..size)
            .map(|_| Slot::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            mask: size as u64 - 1,
            write: CachePadded::new(AtomicU64::new(0)),
            read: CachePadded::new(AtomicU64::new(0)),
            monitors,
        }
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Publishes `value`. Never returns before the value is installed.
    pub fn push(&self, value: u64) {
        assert!(value != 0 && value <= VALUE_MAX, "ring value out of range");
        loop {
            let index = self.claim(&self.write);
            let monitor = self.monitors.for_index(index);
            if self.slots[index].push(monitor, value) {
                return;
            }
        }
    }

    /// Takes the next value.
    ///
    /// A blocking pop always returns `Some`. A non-blocking pop returns `None`
    /// when its claimed slot has not been written yet.
    pub fn pop(&self, block: bool) -> Option<u64> {
        let index = self.claim(&self.read);
        let monitor = self.monitors.for_index(index);
        self.slots[index].pop(monitor, block)
    }

    #[inline]
    fn claim(&self, cursor: &AtomicU64) -> usize {
        let ticket = cursor.fetch_add(RING_STRIDE, Ordering::Relaxed);
        (ticket & self.mask) as usize
    }
}
