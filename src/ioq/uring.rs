//! Batched worker loop on top of io_uring.
//!
//! Each worker owns one ring. Requests popped from the pending ring become
//! SQEs whose `user_data` is a slot in a per-worker op table; the slot maps
//! the CQE back to its [`RecordId`] and keeps any kernel-written buffer
//! (the `statx` output) alive until the completion is reaped.
//!
//! # Loop
//!
//! 1. Prepare: pop while the ring has room. The pop blocks only when nothing
//!    is prepared or in flight. `STOP` ends preparation for good.
//! 2. Submit the prepared batch, retrying transient errors.
//! 3. Reap: wait for at least one CQE when the batch is fully submitted,
//!    then translate every available CQE into a result.
//!
//! The loop exits once `STOP` was seen and nothing is prepared or in flight,
//! so no kernel write can target a buffer after the ring is dropped.

use std::io;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
use std::thread;

use io_uring::{opcode, squeue, types, IoUring, Probe};

use crate::dir::{close_fd, stat_flags, Dir, FileStat, OPEN_DIR_FLAGS};
use crate::error::fatal;
use crate::perf_stats;
use crate::pool::RecordId;

use super::request::{interrupted, Op, OpKind, Output};
use super::worker::{run_blocking, Shared, WorkerStats};

/// Opcodes the running kernel accepts, from `IORING_REGISTER_PROBE`.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct OpCaps {
    pub(crate) nop: bool,
    pub(crate) openat: bool,
    pub(crate) close: bool,
    pub(crate) statx: bool,
}

impl OpCaps {
    pub(crate) fn supports(self, kind: OpKind) -> bool {
        match kind {
            OpKind::Nop => self.nop,
            OpKind::OpenDir => self.openat,
            OpKind::Close | OpKind::CloseDir => self.close,
            OpKind::Stat => self.statx,
        }
    }
}

fn probe_caps(ring: &IoUring) -> io::Result<OpCaps> {
    let mut probe = Probe::new();
    ring.submitter().register_probe(&mut probe)?;
    Ok(OpCaps {
        nop: probe.is_supported(opcode::Nop::CODE),
        openat: probe.is_supported(opcode::OpenAt::CODE),
        close: probe.is_supported(opcode::Close::CODE),
        statx: probe.is_supported(opcode::Statx::CODE),
    })
}

/// An operation owned by the kernel until its CQE is reaped.
struct InFlight {
    id: RecordId,
    statx: Option<Box<libc::statx>>,
}

/// Errors from `io_uring_enter` that clear up on their own.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::EBUSY)
    )
}

fn cqe_result(res: i32) -> io::Result<i32> {
    if res < 0 {
        Err(io::Error::from_raw_os_error(-res))
    } else {
        Ok(res)
    }
}

/// Per-worker io_uring context, created before the worker thread starts.
pub(crate) struct UringWorker {
    ring: IoUring,
    caps: OpCaps,
    entries: usize,
    ops: Vec<Option<InFlight>>,
    free_ops: Vec<usize>,
}

impl UringWorker {
    /// Sets up a ring with `entries` SQEs and probes its opcodes.
    pub(crate) fn new(entries: u32) -> io::Result<Self> {
        let ring = IoUring::new(entries)?;
        let caps = probe_caps(&ring)?;
        let entries = ring.params().sq_entries() as usize;

        let mut ops = Vec::with_capacity(entries);
        ops.resize_with(entries, || None);
        let free_ops = (0..entries).rev().collect();

        Ok(Self {
            ring,
            caps,
            entries,
            ops,
            free_ops,
        })
    }

    #[inline]
    pub(crate) fn entries(&self) -> usize {
        self.entries
    }

    #[inline]
    pub(crate) fn caps(&self) -> OpCaps {
        self.caps
    }

    pub(crate) fn run<T>(mut self, shared: &Shared<T>, stats: &mut WorkerStats) {
        let mut prepared = 0usize;
        let mut submitted = 0usize;
        let mut stop = false;

        while prepared > 0 || submitted > 0 || !stop {
            if !stop {
                stop = self.fill(shared, &mut prepared, submitted, stats);
            }
            self.submit(&mut prepared, &mut submitted, stats);
            perf_stats::max_u64(&mut stats.peak_in_ring, submitted as u64);
            if submitted > 0 {
                self.reap(shared, &mut submitted, prepared == 0, stats);
            }
        }
    }

    /// Prepare phase. Returns `true` once `STOP` was popped.
    fn fill<T>(
        &mut self,
        shared: &Shared<T>,
        prepared: &mut usize,
        submitted: usize,
        stats: &mut WorkerStats,
    ) -> bool {
        while *prepared + submitted < self.entries {
            let idle = *prepared == 0 && submitted == 0;
            let Some(word) = shared.pending.pop(idle) else {
                return false;
            };
            if word == RecordId::STOP_WORD {
                return true;
            }

            perf_stats::sat_add_u64(&mut stats.requests, 1);
            if self.prepare(shared, RecordId::from_word(word), stats) {
                *prepared += 1;
            } else {
                shared.ready.push(word);
            }
        }
        false
    }

    /// Queues an SQE for `id`, or completes it on the spot. Returns `true`
    /// when the request now belongs to the ring.
    fn prepare<T>(&mut self, shared: &Shared<T>, id: RecordId, stats: &mut WorkerStats) -> bool {
        // SAFETY: the caller popped `id` from pending and has not pushed it on.
        let req = unsafe { shared.request_mut(id) };

        let kind = req.op.kind();
        let missing_resource = matches!(
            req.op,
            Op::Close { fd: None } | Op::CloseDir { dir: None }
        );
        if (shared.is_cancelled() && !kind.releases_resource())
            || !self.caps.supports(kind)
            || missing_resource
        {
            run_blocking(shared, req, stats);
            return false;
        }

        let Some(slot) = self.free_ops.pop() else {
            fatal("io_uring op table exhausted");
        };

        let mut statx = None;
        let entry: squeue::Entry = match &mut req.op {
            Op::Nop => opcode::Nop::new().build(),
            Op::Close { fd } => {
                let raw = fd.take().map_or(-1, IntoRawFd::into_raw_fd);
                opcode::Close::new(types::Fd(raw)).build()
            }
            Op::CloseDir { dir } => {
                let raw = dir.take().map_or(-1, |d| d.into_fd().into_raw_fd());
                opcode::Close::new(types::Fd(raw)).build()
            }
            Op::OpenDir { base, path, flags } => {
                opcode::OpenAt::new(types::Fd(*base), path.as_ptr())
                    .flags(OPEN_DIR_FLAGS | *flags)
                    .build()
            }
            Op::Stat { base, path, follow } => {
                // SAFETY: all-zeros is a valid `statx`; the kernel overwrites it.
                let mut buf = Box::new(unsafe { std::mem::zeroed::<libc::statx>() });
                let ptr = buf.as_mut() as *mut libc::statx as *mut types::statx;
                let entry = opcode::Statx::new(types::Fd(*base), path.as_ptr(), ptr)
                    .flags(stat_flags(path, *follow))
                    .mask(libc::STATX_BASIC_STATS)
                    .build();
                statx = Some(buf);
                entry
            }
        };
        let entry = entry.user_data(slot as u64);

        // SAFETY: the path and statx buffers live in the request record and
        // the op table until the CQE for `slot` is reaped.
        if unsafe { self.ring.submission().push(&entry) }.is_err() {
            fatal("io_uring submission queue full");
        }
        self.ops[slot] = Some(InFlight { id, statx });
        true
    }

    /// Hands prepared SQEs to the kernel. Gives up early on a transient
    /// error when completions are pending, so reaping can make room.
    fn submit(&mut self, prepared: &mut usize, submitted: &mut usize, stats: &mut WorkerStats) {
        while *prepared > 0 {
            match self.ring.submit() {
                Ok(n) if n > 0 => {
                    let n = n.min(*prepared);
                    *prepared -= n;
                    *submitted += n;
                    perf_stats::sat_add_usize(&mut stats.sqes_submitted, n);
                }
                Ok(_) => {
                    perf_stats::sat_add_u64(&mut stats.submit_retries, 1);
                    if *submitted > 0 {
                        return;
                    }
                    thread::yield_now();
                }
                Err(err) if is_transient(&err) => {
                    perf_stats::sat_add_u64(&mut stats.submit_retries, 1);
                    if *submitted > 0 {
                        return;
                    }
                    thread::yield_now();
                }
                Err(err) => fatal(&format!("io_uring submit failed: {err}")),
            }
        }
    }

    /// Reap phase.
    fn reap<T>(
        &mut self,
        shared: &Shared<T>,
        submitted: &mut usize,
        may_wait: bool,
        stats: &mut WorkerStats,
    ) {
        if may_wait && self.ring.completion().is_empty() {
            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(err) if is_transient(&err) => {
                    perf_stats::sat_add_u64(&mut stats.submit_retries, 1);
                }
                Err(err) => fatal(&format!("io_uring wait failed: {err}")),
            }
        }

        let Self {
            ring,
            ops,
            free_ops,
            entries,
            ..
        } = self;
        for cqe in ring.completion() {
            let slot = cqe.user_data() as usize;
            let Some(op) = ops.get_mut(slot).and_then(Option::take) else {
                fatal(&format!(
                    "io_uring CQE with unknown user_data {slot} (op table size {entries})"
                ));
            };
            free_ops.push(slot);
            *submitted = submitted.saturating_sub(1);
            perf_stats::sat_add_u64(&mut stats.cqes_reaped, 1);
            complete(shared, op, cqe.result(), stats);
        }
    }
}

/// Writes the result for a reaped operation and hands the record to ready.
fn complete<T>(shared: &Shared<T>, op: InFlight, res: i32, stats: &mut WorkerStats) {
    let word = op.id.to_word();
    {
        // SAFETY: the worker owns the record from pop until the push below.
        let req = unsafe { shared.request_mut(op.id) };
        let res = cqe_result(res);
        req.result = Some(match req.op.kind() {
            OpKind::Nop => res.map(|_| Output::Nop),
            OpKind::Close => res.map(|_| Output::Closed),
            OpKind::CloseDir => res.map(|_| Output::ClosedDir),
            OpKind::OpenDir => res.and_then(|raw| {
                // SAFETY: a non-negative openat result is a fresh descriptor.
                let fd = unsafe { OwnedFd::from_raw_fd(raw) };
                open_dir_result(shared, fd, stats)
            }),
            OpKind::Stat => res.and_then(|_| match &op.statx {
                Some(buf) => Ok(Output::Stat(FileStat::from_statx(buf))),
                None => fatal("io_uring statx completion without a buffer"),
            }),
        });
    }
    shared.ready.push(word);
}

/// Turns a raw descriptor from the ring into a populated directory, unless
/// the queue was cancelled while the open was in flight.
fn open_dir_result<T>(shared: &Shared<T>, fd: OwnedFd, stats: &mut WorkerStats) -> io::Result<Output> {
    if shared.is_cancelled() {
        if let Err(err) = close_fd(fd) {
            log::debug!("ioqueue: close after cancelled open failed: {err}");
        }
        perf_stats::sat_add_u64(&mut stats.fds_closed_after_cancel, 1);
        perf_stats::sat_add_u64(&mut stats.cancelled, 1);
        return Err(interrupted());
    }
    let mut dir = Dir::from_fd(fd);
    dir.populate()?;
    Ok(Output::Dir(dir))
}
