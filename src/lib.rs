//! Bounded asynchronous filesystem request queue.
//!
//! ## Scope
//! One orchestrator thread submits directory opens, closes and stats; a pool
//! of worker threads executes them, either one blocking syscall at a time or
//! batched through io_uring; the orchestrator collects completions in any
//! order, each carrying the caller's tag.
//!
//! ## Key invariants
//! - At most `depth` requests are in flight; further submits fail with
//!   `WouldBlock` instead of blocking.
//! - Every submitted request comes back through `collect` exactly once, and
//!   `release` consumes it.
//! - After `cancel`, closes still run so descriptors are never leaked;
//!   everything else not yet started completes with `EINTR`.
//!
//! ## Flow
//! `submit_* -> slab record -> pending ring -> worker -> ready ring -> collect -> release`
//!
//! Both rings are lock-free MPMC rings of tagged words ([`stdx::ring_queue`]);
//! only an empty ring makes a reader sleep, on one of a small pool of
//! monitors shared by all slots.
//!
//! ## Notable entry points
//! - [`IoQueue`] / [`IoQueueConfig`]: the queue and its configuration.
//! - [`Completion`]: a finished request.
//! - [`Dir`]: a directory handle with prefetched entries.
//! - [`stdx::RingQueue`]: the underlying ring, usable on its own.

pub mod config;
pub mod dir;
pub mod error;
pub mod ioq;
pub mod perf_stats;
pub mod pool;
pub mod stdx;

pub use config::{Backend, BackendMode, IoQueueConfig};
pub use dir::{stat_at, Dir, DirEntry, FileKind, FileStat};
pub use error::{Returned, SubmitError, SubmitErrorKind};
pub use ioq::{Completion, IoQueue, OpKind, Output, QueueStats, WorkerStats};
pub use pool::RecordId;
