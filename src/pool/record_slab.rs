//! Fixed-capacity arena for in-flight request records.
//!
//! The arena is split in two halves with different owners:
//!
//! - [`RecordSlab`] is the allocator: free list, generations, liveness. Only
//!   the orchestrating thread touches it, so it needs no synchronization.
//! - [`RecordCells`] is the storage, shared with worker threads through an
//!   `Arc`. A cell is accessed by exactly one thread at a time; ownership
//!   moves with the [`RecordId`] as it travels through the ring queues.
//!
//! Ring payloads are [`RecordId`] words rather than addresses. Each release
//! bumps the entry's generation, so a stale id is caught by an assertion
//! instead of silently aliasing a recycled record.

use std::cell::UnsafeCell;

/// Generations wrap within this many bits so an encoded id stays well below
/// the ring's payload limit.
const GENERATION_BITS: u32 = 29;
const GENERATION_MASK: u32 = (1 << GENERATION_BITS) - 1;

/// Largest arena the id encoding supports.
pub const SLAB_CAPACITY_MAX: usize = 1 << 24;

/// Handle to one arena entry: slot index plus generation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct RecordId {
    index: u32,
    generation: u32,
}

impl RecordId {
    /// Word reserved for the worker shutdown sentinel. Its index field is
    /// `u32::MAX`, which no arena entry can encode to.
    pub const STOP_WORD: u64 = u32::MAX as u64;

    #[inline]
    pub fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }

    /// Encodes as a non-zero ring payload.
    #[inline]
    pub fn to_word(self) -> u64 {
        (u64::from(self.generation) << 32) | (u64::from(self.index) + 1)
    }

    /// Decodes a ring payload produced by [`RecordId::to_word`].
    #[inline]
    pub fn from_word(word: u64) -> Self {
        let low = word as u32;
        debug_assert!(low != 0 && word != Self::STOP_WORD, "not a record word");
        Self {
            index: low - 1,
            generation: (word >> 32) as u32,
        }
    }
}

/// Orchestrator-side allocator state.
#[derive(Debug)]
pub struct RecordSlab {
    free: Vec<u32>,
    generations: Box<[u32]>,
    live: Box<[bool]>,
}

impl RecordSlab {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "slab capacity must be > 0");
        assert!(
            capacity <= SLAB_CAPACITY_MAX,
            "slab capacity {capacity} exceeds {SLAB_CAPACITY_MAX}"
        );

        // Lowest indices are handed out first.
        let free = (0..capacity as u32).rev().collect();
        Self {
            free,
            generations: vec![0; capacity].into_boxed_slice(),
            live: vec![false; capacity].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.live.len()
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Claims a free entry, or `None` when the arena is exhausted.
    pub fn alloc(&mut self) -> Option<RecordId> {
        let index = self.free.pop()?;
        let slot = index as usize;
        debug_assert!(!self.live[slot]);
        self.live[slot] = true;
        Some(RecordId {
            index,
            generation: self.generations[slot],
        })
    }

    /// Returns an entry to the free list.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not currently allocated (double release or a stale
    /// id from an earlier generation).
    pub fn free(&mut self, id: RecordId) {
        assert!(self.is_live(id), "releasing record {id:?} that is not live");
        let slot = id.index();
        self.live[slot] = false;
        self.generations[slot] = (self.generations[slot] + 1) & GENERATION_MASK;
        self.free.push(id.index);
    }

    /// Whether `id` names a currently allocated entry of the current
    /// generation.
    #[inline]
    pub fn is_live(&self, id: RecordId) -> bool {
        let slot = id.index();
        slot < self.live.len() && self.live[slot] && self.generations[slot] == id.generation
    }
}

/// Shared record storage.
pub struct RecordCells<R> {
    cells: Box<[UnsafeCell<Option<R>>]>,
}

// SAFETY: a cell is only reached through a `RecordId` that exactly one
// thread holds at a time: the orchestrator between alloc and push, a worker
// between its pending pop and ready push, and the orchestrator again after
// the ready pop. The ring slot CAS (AcqRel) orders the hand-offs.
unsafe impl<R: Send> Sync for RecordCells<R> {}
unsafe impl<R: Send> Send for RecordCells<R> {}

impl<R> RecordCells<R> {
    pub fn with_capacity(capacity: usize) -> Self {
        let cells = (0..capacity)
            .map(|_| UnsafeCell::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { cells }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Exclusive access to the cell behind `id`.
    ///
    /// # Safety
    ///
    /// The caller must be the current holder of `id` (see the type-level
    /// ownership rules) and must not keep the reference past handing `id` on.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self, id: RecordId) -> &mut Option<R> {
        &mut *self.cells[id.index()].get()
    }
}

impl<R> std::fmt::Debug for RecordCells<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCells")
            .field("capacity", &self.cells.len())
            .finish()
    }
}
