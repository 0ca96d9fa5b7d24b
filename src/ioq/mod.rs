//! The request queue and its worker backends.
//!
//! - [`queue`]: public [`IoQueue`] (submit, collect, release, cancel).
//! - [`request`]: request records and [`Completion`].
//! - `worker`: shared state, counters, the synchronous loop.
//! - `uring`: the batched io_uring loop (Linux, `io-uring` feature).

pub mod queue;
pub mod request;
mod worker;

#[cfg(all(target_os = "linux", feature = "io-uring"))]
mod uring;

pub use queue::IoQueue;
pub use request::{Completion, OpKind, Output};
pub use worker::{QueueStats, WorkerStats};
