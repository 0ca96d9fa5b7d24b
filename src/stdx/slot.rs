//! Single-word slot protocol for the MPMC ring.
//!
//! Each slot is one `AtomicU64`. Every transition is a single
//! compare-and-swap; the monitor pool is only touched on the rare path where a
//! thread has to sleep.
//!
//! # Word layout
//!
//! ```text
//! bit 63      bits 62..1                    bit 0
//! [ SKIP ] [ value (token word or count) ] [ BLOCKED ]
//! ```
//!
//! | State          | SKIP | value          |
//! |----------------|------|----------------|
//! | empty          | 0    | 0              |
//! | occupied(v)    | 0    | v (non-zero)   |
//! | skip(n)        | 1    | n (non-zero)   |
//!
//! `BLOCKED` is orthogonal: a thread about to sleep sets it while holding the
//! slot's monitor. Every successful transition writes a word with `BLOCKED`
//! clear, and the thread that cleared it broadcasts the monitor.
//!
//! # Skips
//!
//! A non-blocking reader that finds its slot not yet written leaves a skip
//! obligation instead of waiting. The next writer to claim that slot consumes
//! one obligation and retries on a fresh index, so the value is never lost and
//! the reader never waits for it.

#[cfg(loom)]
use loom::sync::atomic::{AtomicU64, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicU64, Ordering};

use super::monitor::Monitor;

/// Set by a thread sleeping on the slot.
pub const BLOCKED: u64 = 1;
/// Tag bit marking a skip count.
pub const SKIP: u64 = 1 << 63;
/// Largest payload a slot can carry.
pub const VALUE_MAX: u64 = (1 << 62) - 1;

const EMPTY: u64 = 0;
const VALUE_SHIFT: u32 = 1;

/// Decoded view of a slot word, ignoring `BLOCKED`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlotState {
    Empty,
    Occupied(u64),
    Skip(u64),
}

impl SlotState {
    #[inline]
    pub fn decode(word: u64) -> Self {
        let value = (word & !SKIP) >> VALUE_SHIFT;
        if word & SKIP != 0 {
            Self::Skip(value)
        } else if value == 0 {
            Self::Empty
        } else {
            Self::Occupied(value)
        }
    }

    #[inline]
    fn encode(self) -> u64 {
        match self {
            Self::Empty => EMPTY,
            Self::Occupied(value) => {
                debug_assert!(value != 0 && value <= VALUE_MAX);
                value << VALUE_SHIFT
            }
            Self::Skip(count) => {
                debug_assert!(count != 0 && count <= VALUE_MAX);
                SKIP | (count << VALUE_SHIFT)
            }
        }
    }
}

/// One ring cell.
#[derive(Debug)]
pub struct Slot {
    word: AtomicU64,
}

impl Default for Slot {
    fn default() -> Self {
        Self::new()
    }
}

impl Slot {
    pub fn new() -> Self {
        Self {
            word: AtomicU64::new(EMPTY),
        }
    }

    /// Current state, for diagnostics and tests.
    #[inline]
    pub fn state(&self) -> SlotState {
        SlotState::decode(self.word.load(Ordering::Acquire))
    }

    /// Whether a sleeper has flagged this slot.
    #[inline]
    pub fn is_blocked(&self) -> bool {
        self.word.load(Ordering::Acquire) & BLOCKED != 0
    }

    /// Installs `value`, or consumes one skip obligation.
    ///
    /// Returns `true` if the value was installed and `false` if the slot was
    /// owed a skip; the caller must then retry on another index. Blocks while
    /// the slot still holds a previous value.
    pub fn push(&self, monitor: &Monitor, value: u64) -> bool {
        assert!(value != 0 && value <= VALUE_MAX, "slot value out of range");

        let mut cur = self.word.load(Ordering::Acquire);
        loop {
            let (next, installed) = match SlotState::decode(cur) {
                SlotState::Skip(count) if count > 1 => (SlotState::Skip(count - 1), false),
                SlotState::Skip(_) => (SlotState::Empty, false),
                SlotState::Occupied(_) => {
                    self.wait(monitor, cur);
                    cur = self.word.load(Ordering::Acquire);
                    continue;
                }
                SlotState::Empty => (SlotState::Occupied(value), true),
            };

            match self.word.compare_exchange_weak(
                cur,
                next.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(prev) => {
                    if prev & BLOCKED != 0 {
                        monitor.broadcast();
                    }
                    return installed;
                }
                Err(actual) => cur = actual,
            }
        }
    }

    /// Takes the slot's value.
    ///
    /// With `block` set this waits until a value arrives. Without it, a slot
    /// that is not yet written gets one more skip obligation and `None` is
    /// returned.
    pub fn pop(&self, monitor: &Monitor, block: bool) -> Option<u64> {
        let mut cur = self.word.load(Ordering::Acquire);
        loop {
            let (next, value) = match SlotState::decode(cur) {
                SlotState::Occupied(value) => (SlotState::Empty, Some(value)),
                SlotState::Skip(count) => (SlotState::Skip(count + 1), None),
                SlotState::Empty => (SlotState::Skip(1), None),
            };

            if value.is_none() && block {
                self.wait(monitor, cur);
                cur = self.word.load(Ordering::Acquire);
                continue;
            }

            match self.word.compare_exchange_weak(
                cur,
                next.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(prev) => {
                    if prev & BLOCKED != 0 {
                        monitor.broadcast();
                    }
                    return value;
                }
                Err(actual) => cur = actual,
            }
        }
    }

    /// Sleeps until the slot word differs from `seen`.
    ///
    /// The blocked bit is published while holding the monitor, and wakers
    /// take the same monitor before broadcasting, so the wakeup cannot slip
    /// between the check and the sleep. Returns early if the word already
    /// moved on.
    fn wait(&self, monitor: &Monitor, seen: u64) {
        let blocked = seen | BLOCKED;
        let mut guard = monitor.lock();

        if seen & BLOCKED == 0
            && self
                .word
                .compare_exchange(seen, blocked, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return;
        }

        while self.word.load(Ordering::Acquire) == blocked {
            guard = monitor.wait(guard);
        }
    }
}
