//! Fixed pool of mutex/condvar pairs backing the slot wait protocol.
//!
//! Slots never own synchronization objects. A thread that has to sleep on a
//! slot hashes the slot index onto one of these monitors, so many slots share
//! one monitor and wakeups are always broadcasts. Sleepers re-check their
//! slot after every wakeup; spurious wakeups only cost a retry.

#[cfg(loom)]
use loom::sync::{Condvar, Mutex, MutexGuard};
#[cfg(not(loom))]
use std::sync::{Condvar, Mutex, MutexGuard};

use crossbeam_utils::CachePadded;

use crate::error::fatal;

/// Upper bound on pool size; beyond this the hash spreads well enough.
pub const MONITOR_COUNT_MAX: usize = 64;

/// One (mutex, condition variable) pair.
pub struct Monitor {
    mutex: Mutex<()>,
    cond: Condvar,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor").finish_non_exhaustive()
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor {
    pub fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Locks the monitor. A poisoned mutex aborts the process.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutex
            .lock()
            .unwrap_or_else(|_| fatal("ring monitor mutex poisoned"))
    }

    /// Releases `guard`, sleeps, and re-acquires it.
    #[inline]
    pub fn wait<'a>(&self, guard: MutexGuard<'a, ()>) -> MutexGuard<'a, ()> {
        self.cond
            .wait(guard)
            .unwrap_or_else(|_| fatal("ring monitor condvar wait failed"))
    }

    /// Wakes every sleeper on this monitor.
    ///
    /// The lock is taken first so a sleeper that has published its blocked
    /// bit but not yet parked cannot miss the broadcast.
    #[inline]
    pub fn broadcast(&self) {
        let _guard = self.lock();
        self.cond.notify_all();
    }
}

/// Power-of-two array of monitors shared by every slot of a ring.
#[derive(Debug)]
pub struct MonitorPool {
    monitors: Box<[CachePadded<Monitor>]>,
    mask: usize,
}

impl MonitorPool {
    /// Creates a pool sized for `slot_count` slots.
    ///
    /// The pool never has more monitors than slots and never more than
    /// [`MONITOR_COUNT_MAX`].
    pub fn for_slots(slot_count: usize) -> Self {
        assert!(slot_count > 0, "slot_count must be > 0");
        let count = slot_count
            .min(MONITOR_COUNT_MAX)
            .next_power_of_two()
            .min(MONITOR_COUNT_MAX);
        let monitors = (0..count)
            .map(|_| CachePadded::new(Monitor::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            monitors,
            mask: count - 1,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }

    /// Monitor responsible for the slot at `index`.
    #[inline]
    pub fn for_index(&self, index: usize) -> &Monitor {
        &self.monitors[index & self.mask]
    }
}
