//! Small arithmetic helpers for worker counters.
//!
//! Worker loops bump plain `u64` fields on their own stack and hand the whole
//! struct back on join, so these helpers only need to be cheap and never
//! wrap.
//!
//! * **`sat_add_*`**: event counters; clamping at `MAX` beats silent
//!   wrap-around for values shown to operators.
//! * **`max_*`**: high-water marks (largest batch, deepest ring).

/// Saturating add for a `u64` counter.
#[inline(always)]
pub fn sat_add_u64(counter: &mut u64, delta: u64) {
    *counter = counter.saturating_add(delta);
}

/// Saturating add of a `usize` delta into a `u64` counter.
#[inline(always)]
pub fn sat_add_usize(counter: &mut u64, delta: usize) {
    *counter = counter.saturating_add(delta as u64);
}

/// High-water-mark update for a `u64` counter.
#[inline(always)]
pub fn max_u64(counter: &mut u64, value: u64) {
    *counter = (*counter).max(value);
}
