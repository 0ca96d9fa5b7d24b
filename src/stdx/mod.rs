//! Low-level concurrency building blocks for the request queue.

pub mod monitor;
pub mod ring_queue;
pub mod slot;

pub use monitor::{Monitor, MonitorPool};
pub use ring_queue::RingQueue;
