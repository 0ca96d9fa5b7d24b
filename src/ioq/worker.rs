//! State shared with worker threads, and the synchronous worker loop.
//!
//! # Ownership hand-off
//!
//! ```text
//! orchestrator ──push(id)──▶ pending ──pop──▶ worker ──push(id)──▶ ready ──pop──▶ orchestrator
//! ```
//!
//! Whoever last popped an id owns its record cell until it pushes the id on.
//! Workers never allocate or free records; they only fill in the result.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::Backend;
use crate::dir::{close_fd, stat_at, Dir};
use crate::error::fatal;
use crate::perf_stats;
use crate::pool::{RecordCells, RecordId};
use crate::stdx::monitor::MonitorPool;
use crate::stdx::ring_queue::RingQueue;

use super::request::{Op, Output, Request};

/// Structures touched by both the orchestrator and the workers.
pub(crate) struct Shared<T> {
    pub(crate) pending: RingQueue,
    pub(crate) ready: RingQueue,
    pub(crate) records: RecordCells<Request<T>>,
    cancelled: AtomicBool,
}

impl<T> Shared<T> {
    pub(crate) fn new(depth: usize, pending_capacity: usize) -> Self {
        let monitors = Arc::new(MonitorPool::for_slots(pending_capacity.max(depth)));
        Self {
            pending: RingQueue::new(pending_capacity, Arc::clone(&monitors)),
            ready: RingQueue::new(depth, monitors),
            records: RecordCells::with_capacity(depth),
            cancelled: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Sets the cancel flag. Returns `true` only for the first caller.
    #[inline]
    pub(crate) fn set_cancelled(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    /// The record behind `id`.
    ///
    /// # Safety
    ///
    /// The caller must currently own `id` per the hand-off rules above and
    /// must drop the reference before pushing `id` to the next ring.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn request_mut(&self, id: RecordId) -> &mut Request<T> {
        self.records
            .get_mut(id)
            .as_mut()
            .unwrap_or_else(|| fatal("worker popped an empty request record"))
    }
}

/// Per-worker counters, returned when the worker exits.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkerStats {
    /// Loop the worker ran.
    pub backend: Backend,
    /// Requests popped from the pending ring.
    pub requests: u64,
    /// Requests completed with `EINTR` because the queue was cancelled.
    pub cancelled: u64,
    /// Requests executed with blocking syscalls on the worker thread.
    pub executed_inline: u64,
    /// Submission entries handed to the kernel ring.
    pub sqes_submitted: u64,
    /// Completion entries reaped from the kernel ring.
    pub cqes_reaped: u64,
    /// Submit calls retried after `EINTR`/`EAGAIN`/`EBUSY`.
    pub submit_retries: u64,
    /// Descriptors opened by the ring after cancellation and closed unused.
    pub fds_closed_after_cancel: u64,
    /// Largest number of operations in the kernel ring at once.
    pub peak_in_ring: u64,
}

impl WorkerStats {
    pub(crate) fn for_backend(backend: Backend) -> Self {
        Self {
            backend,
            ..Self::default()
        }
    }

    pub fn merge(&mut self, other: &WorkerStats) {
        perf_stats::sat_add_u64(&mut self.requests, other.requests);
        perf_stats::sat_add_u64(&mut self.cancelled, other.cancelled);
        perf_stats::sat_add_u64(&mut self.executed_inline, other.executed_inline);
        perf_stats::sat_add_u64(&mut self.sqes_submitted, other.sqes_submitted);
        perf_stats::sat_add_u64(&mut self.cqes_reaped, other.cqes_reaped);
        perf_stats::sat_add_u64(&mut self.submit_retries, other.submit_retries);
        perf_stats::sat_add_u64(
            &mut self.fds_closed_after_cancel,
            other.fds_closed_after_cancel,
        );
        perf_stats::max_u64(&mut self.peak_in_ring, other.peak_in_ring);
    }
}

/// Counters of every worker, returned by [`crate::IoQueue::destroy`].
#[derive(Clone, Debug, Default)]
pub struct QueueStats {
    pub workers: Vec<WorkerStats>,
}

impl QueueStats {
    /// Sum over all workers (`backend` is left at its default).
    pub fn total(&self) -> WorkerStats {
        let mut total = WorkerStats::default();
        for w in &self.workers {
            total.merge(w);
        }
        total
    }

    /// Number of workers that ran the given backend.
    pub fn count_backend(&self, backend: Backend) -> usize {
        self.workers.iter().filter(|w| w.backend == backend).count()
    }
}

/// Runs `op` with blocking syscalls.
pub(crate) fn execute(op: &mut Op) -> io::Result<Output> {
    match op {
        Op::Nop => Ok(Output::Nop),
        Op::Close { fd } => {
            let fd = fd.take().ok_or_else(bad_descriptor)?;
            close_fd(fd).map(|()| Output::Closed)
        }
        Op::OpenDir { base, path, flags } => {
            let mut dir = Dir::open_at(*base, path, *flags)?;
            dir.populate()?;
            Ok(Output::Dir(dir))
        }
        Op::CloseDir { dir } => {
            let dir = dir.take().ok_or_else(bad_descriptor)?;
            dir.close().map(|()| Output::ClosedDir)
        }
        Op::Stat { base, path, follow } => stat_at(*base, path, *follow).map(Output::Stat),
    }
}

fn bad_descriptor() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}

/// Fills in `req` without the kernel ring: short-circuits cancelled
/// non-releasing work, executes everything else.
pub(crate) fn run_blocking<T>(shared: &Shared<T>, req: &mut Request<T>, stats: &mut WorkerStats) {
    if shared.is_cancelled() && !req.op.kind().releases_resource() {
        req.interrupt();
        perf_stats::sat_add_u64(&mut stats.cancelled, 1);
        return;
    }
    req.result = Some(execute(&mut req.op));
    perf_stats::sat_add_u64(&mut stats.executed_inline, 1);
}

/// Synchronous worker loop: one blocking pop, one syscall, one push.
pub(crate) fn sync_loop<T>(shared: &Shared<T>, stats: &mut WorkerStats) {
    loop {
        let Some(word) = shared.pending.pop(true) else {
            continue;
        };
        if word == RecordId::STOP_WORD {
            break;
        }

        let id = RecordId::from_word(word);
        {
            // SAFETY: popping `id` from pending made this worker its owner.
            let req = unsafe { shared.request_mut(id) };
            run_blocking(shared, req, stats);
        }
        perf_stats::sat_add_u64(&mut stats.requests, 1);
        shared.ready.push(word);
    }
}

/// Entry point of every worker thread.
pub(crate) fn run<T>(wid: usize, shared: Arc<Shared<T>>, plan: WorkerPlan) -> WorkerStats {
    match plan {
        WorkerPlan::Sync => {
            log::debug!("ioqueue worker {wid}: synchronous backend");
            let mut stats = WorkerStats::for_backend(Backend::Sync);
            sync_loop(&shared, &mut stats);
            log::debug!("ioqueue worker {wid}: exit after {} requests", stats.requests);
            stats
        }
        #[cfg(all(target_os = "linux", feature = "io-uring"))]
        WorkerPlan::Uring(ring) => {
            log::debug!(
                "ioqueue worker {wid}: io_uring backend ({} entries)",
                ring.entries()
            );
            let mut stats = WorkerStats::for_backend(Backend::Uring);
            ring.run(&shared, &mut stats);
            log::debug!(
                "ioqueue worker {wid}: exit after {} requests ({} sqes)",
                stats.requests,
                stats.sqes_submitted
            );
            stats
        }
    }
}

/// Backend chosen for a worker at queue creation.
pub(crate) enum WorkerPlan {
    Sync,
    #[cfg(all(target_os = "linux", feature = "io-uring"))]
    Uring(super::uring::UringWorker),
}
