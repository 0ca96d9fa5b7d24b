//! The public queue: depth accounting, submission, collection, shutdown.

use std::ffi::CString;
use std::fmt;
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::config::{BackendMode, IoQueueConfig};
use crate::dir::Dir;
use crate::error::{fatal, SubmitError, SubmitErrorKind};
use crate::pool::{RecordId, RecordSlab};

use super::request::{Completion, Op, Request};
use super::worker::{self, QueueStats, Shared, WorkerPlan, WorkerStats};

/// Bounded asynchronous queue of filesystem requests.
///
/// One thread (the orchestrator) submits and collects; `workers` threads
/// execute. Every request carries a caller tag `T` that comes back with its
/// [`Completion`]. Completions arrive in no particular order.
///
/// Capacity is held from submit until [`IoQueue::release`], not until
/// collect, so a caller that keeps completions around keeps the slots.
pub struct IoQueue<T: Send + 'static> {
    depth: usize,
    /// Submitted and not yet released.
    in_flight: usize,
    /// Submitted and not yet collected.
    uncollected: usize,
    shared: Arc<Shared<T>>,
    slab: RecordSlab,
    workers: Vec<JoinHandle<WorkerStats>>,
}

impl<T: Send + 'static> IoQueue<T> {
    /// Validates `cfg`, picks a backend per worker and starts the threads.
    ///
    /// Every io_uring instance is set up before the first thread spawns, so
    /// a `UringRequired` failure leaves nothing running.
    pub fn new(cfg: IoQueueConfig) -> io::Result<Self> {
        cfg.validate()?;

        let plans = (0..cfg.workers)
            .map(|wid| plan_worker(wid, &cfg))
            .collect::<io::Result<Vec<_>>>()?;

        let mut queue = Self {
            depth: cfg.depth,
            in_flight: 0,
            uncollected: 0,
            shared: Arc::new(Shared::new(cfg.depth, cfg.pending_capacity())),
            slab: RecordSlab::with_capacity(cfg.depth),
            workers: Vec::with_capacity(cfg.workers),
        };

        for (wid, plan) in plans.into_iter().enumerate() {
            let shared = Arc::clone(&queue.shared);
            let handle = thread::Builder::new()
                .name(format!("ioq-worker-{wid}"))
                .spawn(move || worker::run(wid, shared, plan))?;
            queue.workers.push(handle);
        }

        log::debug!(
            "ioqueue: depth {} with {} workers ({:?})",
            cfg.depth,
            cfg.workers,
            cfg.backend
        );
        Ok(queue)
    }

    /// Queue with default backend selection.
    pub fn with_depth(depth: usize, workers: usize) -> io::Result<Self> {
        Self::new(IoQueueConfig::new(depth, workers))
    }

    /// Maximum number of in-flight requests.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    #[inline]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Requests that can be submitted before one fails with `WouldBlock`.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.depth - self.in_flight
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Closes `fd` on a worker. Still runs after [`IoQueue::cancel`].
    pub fn submit_close(&mut self, fd: OwnedFd, tag: T) -> Result<(), SubmitError<T>> {
        self.submit(Op::Close { fd: Some(fd) }, tag)
    }

    /// Opens and reads the directory `path` relative to `base`
    /// (`libc::AT_FDCWD` for the working directory).
    ///
    /// `flags` is added to `O_RDONLY | O_DIRECTORY | O_CLOEXEC`. The
    /// completion carries a populated [`Dir`]; take it with
    /// [`Completion::take_dir`].
    ///
    /// `Cancelled` and `WouldBlock` take precedence over `InvalidPath`, so
    /// a full queue always reports `WouldBlock`.
    pub fn submit_open_dir<P: AsRef<Path>>(
        &mut self,
        base: RawFd,
        path: P,
        flags: libc::c_int,
        tag: T,
    ) -> Result<(), SubmitError<T>> {
        let path = match self.admit().and_then(|()| c_path(path.as_ref())) {
            Ok(path) => path,
            Err(kind) => return Err(SubmitError::new(kind, tag, None)),
        };
        self.submit(Op::OpenDir { base, path, flags }, tag)
    }

    /// Closes a directory on a worker. Still runs after [`IoQueue::cancel`].
    pub fn submit_close_dir(&mut self, dir: Dir, tag: T) -> Result<(), SubmitError<T>> {
        self.submit(Op::CloseDir { dir: Some(dir) }, tag)
    }

    /// Stats `path` relative to `base`. An empty path stats `base` itself.
    pub fn submit_stat<P: AsRef<Path>>(
        &mut self,
        base: RawFd,
        path: P,
        follow: bool,
        tag: T,
    ) -> Result<(), SubmitError<T>> {
        let path = match self.admit().and_then(|()| c_path(path.as_ref())) {
            Ok(path) => path,
            Err(kind) => return Err(SubmitError::new(kind, tag, None)),
        };
        self.submit(Op::Stat { base, path, follow }, tag)
    }

    /// Round trip through a worker without a syscall.
    pub fn submit_nop(&mut self, tag: T) -> Result<(), SubmitError<T>> {
        self.submit(Op::Nop, tag)
    }

    /// Queue-side checks every submission passes before anything else.
    fn admit(&self) -> Result<(), SubmitErrorKind> {
        if self.is_cancelled() {
            return Err(SubmitErrorKind::Cancelled);
        }
        if self.in_flight >= self.depth {
            return Err(SubmitErrorKind::WouldBlock);
        }
        if self.slab.available() == 0 {
            return Err(SubmitErrorKind::OutOfMemory);
        }
        Ok(())
    }

    fn submit(&mut self, op: Op, tag: T) -> Result<(), SubmitError<T>> {
        let refuse = |kind: SubmitErrorKind, op: Op, tag: T| -> Result<(), SubmitError<T>> {
            Err(SubmitError::new(kind, tag, op.into_returned()))
        };

        if let Err(kind) = self.admit() {
            return refuse(kind, op, tag);
        }
        let Some(id) = self.slab.alloc() else {
            return refuse(SubmitErrorKind::OutOfMemory, op, tag);
        };

        // SAFETY: `id` was just allocated; no worker can reach it before the
        // push below.
        unsafe { *self.shared.records.get_mut(id) = Some(Request::new(op, tag)) };
        self.in_flight += 1;
        self.uncollected += 1;
        self.shared.pending.push(id.to_word());
        Ok(())
    }

    /// Next finished request.
    ///
    /// Returns `None` at once when nothing submitted is left to collect. A
    /// blocking collect otherwise waits for a completion; a non-blocking one
    /// may return `None` while requests are still running. Do not spin on
    /// non-blocking collects: fall back to a blocking one when idle.
    pub fn collect(&mut self, block: bool) -> Option<Completion<T>> {
        if self.uncollected == 0 {
            return None;
        }
        let id = RecordId::from_word(self.shared.ready.pop(block)?);
        assert!(self.slab.is_live(id), "ready ring returned a stale record {id:?}");

        // SAFETY: popping `id` from ready hands the record back to us.
        let req = unsafe { self.shared.records.get_mut(id).take() }
            .unwrap_or_else(|| fatal("ready ring returned an empty record"));
        self.uncollected -= 1;

        let kind = req.op.kind();
        let result = req
            .result
            .unwrap_or_else(|| fatal("worker completed a request without a result"));
        Some(Completion::new(id, kind, req.tag, result))
    }

    /// Returns the completion's slot to the queue and hands back its tag.
    ///
    /// # Panics
    ///
    /// If `completion` was not collected from this queue.
    pub fn release(&mut self, completion: Completion<T>) -> T {
        let id = completion.id();
        assert!(
            self.slab.is_live(id),
            "released completion {id:?} does not belong to this queue"
        );
        self.slab.free(id);
        self.in_flight -= 1;
        completion.into_tag()
    }

    /// Requests shutdown. Idempotent.
    ///
    /// Later submissions fail with `Cancelled`. Queued opens, stats and
    /// no-ops complete with `EINTR`; queued closes still run. Completions
    /// remain collectable until the queue is destroyed.
    pub fn cancel(&self) {
        if !self.shared.set_cancelled() {
            return;
        }
        log::debug!("ioqueue: cancelled, stopping {} workers", self.workers.len());
        for _ in 0..self.workers.len() {
            self.shared.pending.push(RecordId::STOP_WORD);
        }
    }

    /// Cancels, joins every worker and returns their counters.
    ///
    /// Uncollected and unreleased completions are dropped; directories and
    /// descriptors they own are closed.
    pub fn destroy(mut self) -> QueueStats {
        self.shutdown()
    }

    fn shutdown(&mut self) -> QueueStats {
        self.cancel();
        let mut stats = QueueStats::default();
        for handle in self.workers.drain(..) {
            match handle.join() {
                Ok(worker) => stats.workers.push(worker),
                Err(payload) if !thread::panicking() => std::panic::resume_unwind(payload),
                Err(_) => log::error!("ioqueue: worker panicked during shutdown"),
            }
        }
        let total = stats.total();
        log::debug!(
            "ioqueue: shut down after {} requests ({} cancelled, {} inline)",
            total.requests,
            total.cancelled,
            total.executed_inline
        );
        stats
    }
}

impl<T: Send + 'static> Drop for IoQueue<T> {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown();
        }
    }
}

impl<T: Send + 'static> fmt::Debug for IoQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoQueue")
            .field("depth", &self.depth)
            .field("in_flight", &self.in_flight)
            .field("uncollected", &self.uncollected)
            .field("workers", &self.workers.len())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

fn c_path(path: &Path) -> Result<CString, SubmitErrorKind> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| SubmitErrorKind::InvalidPath)
}

/// Decides the loop for worker `wid` before any thread exists.
fn plan_worker(wid: usize, cfg: &IoQueueConfig) -> io::Result<WorkerPlan> {
    match cfg.backend {
        BackendMode::SyncOnly => Ok(WorkerPlan::Sync),
        mode => plan_uring(wid, cfg, mode == BackendMode::UringRequired),
    }
}

#[cfg(all(target_os = "linux", feature = "io-uring"))]
fn plan_uring(wid: usize, cfg: &IoQueueConfig, required: bool) -> io::Result<WorkerPlan> {
    match super::uring::UringWorker::new(cfg.resolved_ring_entries()) {
        Ok(ring) => {
            log::debug!("ioqueue worker {wid}: io_uring caps {:?}", ring.caps());
            Ok(WorkerPlan::Uring(ring))
        }
        Err(err) if required => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("worker {wid}: io_uring setup failed: {err}"),
        )),
        Err(err) => {
            log::warn!("ioqueue worker {wid}: io_uring unavailable ({err}), using synchronous loop");
            Ok(WorkerPlan::Sync)
        }
    }
}

#[cfg(not(all(target_os = "linux", feature = "io-uring")))]
fn plan_uring(wid: usize, _cfg: &IoQueueConfig, required: bool) -> io::Result<WorkerPlan> {
    if required {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("worker {wid}: io_uring backend not available on this build"),
        ));
    }
    Ok(WorkerPlan::Sync)
}
