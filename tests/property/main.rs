//! Property-based tests for queue accounting and ring conservation.
//!
//! Run with: `cargo test --test property`

mod capacity_invariant;
mod ring_conservation;
