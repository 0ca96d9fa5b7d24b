//! Queue configuration.

use std::io;

use crate::pool::SLAB_CAPACITY_MAX;

/// Default maximum number of in-flight requests.
pub const DEFAULT_DEPTH: usize = 128;
/// Default worker thread count.
pub const DEFAULT_WORKERS: usize = 2;
/// Upper bound on per-worker io_uring entries when sized automatically.
pub const RING_ENTRIES_MAX: u32 = 4096;

/// Which worker loop to run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum BackendMode {
    /// Default: batch through io_uring when the kernel ring can be set up,
    /// otherwise fall back to the synchronous loop per worker.
    #[default]
    UringPreferred,
    /// Always run the synchronous loop (parity/debug).
    SyncOnly,
    /// Require io_uring; queue creation fails if any worker cannot get a ring.
    UringRequired,
}

/// Loop a worker actually ended up running.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum Backend {
    #[default]
    Sync,
    Uring,
}

/// Configuration for [`crate::IoQueue`].
#[derive(Clone, Debug)]
pub struct IoQueueConfig {
    /// Maximum in-flight requests. Submissions beyond this fail with
    /// `WouldBlock`. Ring sizes round this up to a power of two.
    pub depth: usize,

    /// Number of worker threads.
    pub workers: usize,

    /// Worker backend selection.
    pub backend: BackendMode,

    /// SQ entries per io_uring worker (0 = auto: the worker's share of
    /// `depth`, rounded up to a power of two and capped at
    /// [`RING_ENTRIES_MAX`]).
    pub ring_entries: u32,
}

impl Default for IoQueueConfig {
    fn default() -> Self {
        Self {
            depth: DEFAULT_DEPTH,
            workers: DEFAULT_WORKERS,
            backend: BackendMode::default(),
            ring_entries: 0,
        }
    }
}

impl IoQueueConfig {
    pub fn new(depth: usize, workers: usize) -> Self {
        Self {
            depth,
            workers,
            ..Self::default()
        }
    }

    /// Checks the configuration before any thread or ring is created.
    pub fn validate(&self) -> io::Result<()> {
        if self.depth == 0 {
            return Err(io::Error::other("depth must be > 0"));
        }
        if self.depth > SLAB_CAPACITY_MAX {
            return Err(io::Error::other(format!(
                "depth ({}) must be <= {}",
                self.depth, SLAB_CAPACITY_MAX
            )));
        }
        if self.workers == 0 {
            return Err(io::Error::other("workers must be > 0"));
        }
        if self.ring_entries > RING_ENTRIES_MAX {
            return Err(io::Error::other(format!(
                "ring_entries ({}) must be <= {}",
                self.ring_entries, RING_ENTRIES_MAX
            )));
        }
        Ok(())
    }

    /// Per-worker io_uring size after resolving `0 = auto`.
    pub fn resolved_ring_entries(&self) -> u32 {
        if self.ring_entries > 0 {
            return self.ring_entries;
        }
        let share = self.depth.div_ceil(self.workers.max(1)).max(2);
        (share.next_power_of_two() as u64).min(u64::from(RING_ENTRIES_MAX)) as u32
    }

    /// Slots in the pending ring: every request plus one stop sentinel per
    /// worker fits without a writer ever waiting on a full slot.
    pub(crate) fn pending_capacity(&self) -> usize {
        self.depth.saturating_add(self.workers)
    }
}
