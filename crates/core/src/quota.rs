//! Block memory quota accounting
//!
//! Every component that changes resident byte counts reports through one
//! `BlockMemoryQuotaController`. Accounting only; enforcement is the
//! caller's policy.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative resident-byte accounting shared across a storage instance
#[derive(Debug, Default)]
pub struct BlockMemoryQuotaController {
    used: AtomicU64,
    total_allocated: AtomicU64,
    total_freed: AtomicU64,
}

impl BlockMemoryQuotaController {
    /// Create a controller with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `n` newly resident bytes.
    pub fn allocate(&self, n: u64) {
        self.used.fetch_add(n, Ordering::Relaxed);
        self.total_allocated.fetch_add(n, Ordering::Relaxed);
    }

    /// Record `n` bytes leaving residency. Saturates at zero so a double
    /// free is visible in `total_freed` rather than wrapping.
    pub fn free(&self, n: u64) {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(n);
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.total_freed.fetch_add(n, Ordering::Relaxed);
    }

    /// Currently resident bytes.
    pub fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    /// Lifetime bytes ever allocated.
    pub fn total_allocated(&self) -> u64 {
        self.total_allocated.load(Ordering::Relaxed)
    }

    /// Lifetime bytes ever freed.
    pub fn total_freed(&self) -> u64 {
        self.total_freed.load(Ordering::Relaxed)
    }
}
