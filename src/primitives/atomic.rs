//! Atomic read-modify-write helpers used by vertex-centric callbacks.
//!
//! Slot callbacks for the same destination vertex may run concurrently on
//! different threads, so per-vertex state lives in atomics and updates go
//! through these compare-exchange loops.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Adds `delta` to an `f64` stored as bits in an `AtomicU64`.
pub fn add_f64(cell: &AtomicU64, delta: f64) {
    let mut cur = cell.load(Ordering::Relaxed);
    loop {
        let next = f64::from_bits(cur) + delta;
        match cell.compare_exchange_weak(
            cur,
            next.to_bits(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(seen) => cur = seen,
        }
    }
}

/// Lowers an `f64` cell to `val` if smaller. Returns true on success.
pub fn min_f64(cell: &AtomicU64, val: f64) -> bool {
    let mut cur = cell.load(Ordering::Relaxed);
    loop {
        if f64::from_bits(cur) <= val {
            return false;
        }
        match cell.compare_exchange_weak(
            cur,
            val.to_bits(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return true,
            Err(seen) => cur = seen,
        }
    }
}

/// Lowers a `u32` cell to `val` if smaller. Returns true on success.
pub fn min_u32(cell: &AtomicU32, val: u32) -> bool {
    let mut cur = cell.load(Ordering::Relaxed);
    loop {
        if cur <= val {
            return false;
        }
        match cell.compare_exchange_weak(cur, val, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return true,
            Err(seen) => cur = seen,
        }
    }
}

/// One-shot claim: swaps `expected` for `val`. Returns true if this call
/// performed the swap.
pub fn claim_u32(cell: &AtomicU32, expected: u32, val: u32) -> bool {
    cell.compare_exchange(expected, val, Ordering::Relaxed, Ordering::Relaxed)
        .is_ok()
}
