//! Operation counters shared by the pool families.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Running counters of a pool's activity.
///
/// Counters are atomics so the lock-based pools can be inspected without
/// taking the pool lock; all loads and stores are relaxed, the numbers are
/// advisory.
#[derive(Debug, Default)]
pub struct PoolStats {
    allocations: AtomicU64,
    frees: AtomicU64,
    reallocations: AtomicU64,
    /// Allocations served from a free list instead of the bump offset.
    free_list_hits: AtomicU64,
    blocks_created: AtomicUsize,
    blocks_released: AtomicUsize,
    scopes_opened: AtomicU64,
    scopes_closed: AtomicU64,
}

impl PoolStats {
    pub(crate) fn record_allocation(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_free(&self) {
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reallocation(&self) {
        self.reallocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_free_list_hit(&self) {
        self.free_list_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_block_created(&self) {
        self.blocks_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_block_released(&self) {
        self.blocks_released.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_scope_opened(&self) {
        self.scopes_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_scope_closed(&self) {
        self.scopes_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Allocations handed out.
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Units returned to the pool.
    pub fn frees(&self) -> u64 {
        self.frees.load(Ordering::Relaxed)
    }

    /// Reallocation calls.
    pub fn reallocations(&self) -> u64 {
        self.reallocations.load(Ordering::Relaxed)
    }

    /// Allocations served from a free list.
    pub fn free_list_hits(&self) -> u64 {
        self.free_list_hits.load(Ordering::Relaxed)
    }

    /// Blocks allocated over the pool's lifetime, the first one included.
    pub fn blocks_created(&self) -> usize {
        self.blocks_created.load(Ordering::Relaxed)
    }

    /// Blocks given back to the operating system.
    pub fn blocks_released(&self) -> usize {
        self.blocks_released.load(Ordering::Relaxed)
    }

    /// Scopes opened.
    pub fn scopes_opened(&self) -> u64 {
        self.scopes_opened.load(Ordering::Relaxed)
    }

    /// Scopes closed.
    pub fn scopes_closed(&self) -> u64 {
        self.scopes_closed.load(Ordering::Relaxed)
    }

    /// Fraction of allocations served from a free list, in `0..=1`.
    pub fn reuse_ratio(&self) -> f64 {
        let allocations = self.allocations() as f64;
        if allocations == 0.0 {
            0.0
        } else {
            self.free_list_hits() as f64 / allocations
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = PoolStats::default();
        stats.record_allocation();
        stats.record_allocation();
        stats.record_free_list_hit();
        stats.record_free();

        assert_eq!(stats.allocations(), 2);
        assert_eq!(stats.frees(), 1);
        assert_eq!(stats.free_list_hits(), 1);
        assert!((stats.reuse_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_stats_have_zero_ratio() {
        let stats = PoolStats::default();
        assert_eq!(stats.reuse_ratio(), 0.0);
    }
}
