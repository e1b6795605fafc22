//! Single-threaded segregated pool.

use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::Arc;

use super::core::{SegregatedCore, SegregatedPoolReport};
use super::{RawPool, SegregatedPoolConfig};
use crate::error::{MemoryError, MemoryResult};
use crate::stats::PoolStats;

/// Same-size object pool without synchronization.
///
/// # Example
/// ```
/// use strata_memory::segregated::{SegregatedPool, SegregatedPoolConfig};
///
/// let pool = SegregatedPool::with_config(
///     SegregatedPoolConfig::new(16).with_items_per_block(64),
/// )?;
///
/// let a = pool.allocate()?;
/// let b = pool.allocate()?;
/// unsafe {
///     pool.free(a)?;
///     // Freed slots come back most-recent-first.
///     assert_eq!(pool.allocate()?, a);
///     pool.free(b)?;
/// }
/// # Ok::<(), strata_memory::MemoryError>(())
/// ```
pub struct SegregatedPool {
    core: RefCell<SegregatedCore>,
    stats: Arc<PoolStats>,
}

impl SegregatedPool {
    /// Creates a pool of `item_size`-byte slots.
    pub fn new(item_size: usize) -> MemoryResult<Self> {
        Self::with_config(SegregatedPoolConfig::new(item_size))
    }

    /// Creates a pool from a full configuration.
    pub fn with_config(config: SegregatedPoolConfig) -> MemoryResult<Self> {
        let core = SegregatedCore::new(config, 0)?;
        let stats = core.stats_handle();
        Ok(Self {
            core: RefCell::new(core),
            stats,
        })
    }

    /// Hands out one slot.
    pub fn allocate(&self) -> MemoryResult<NonNull<u8>> {
        self.core.borrow_mut().allocate_slot()
    }

    /// Returns a slot to the pool.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live slot of this pool and must not be used
    /// afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        let mut core = self.core.borrow_mut();
        if !core.contains_slot(ptr) {
            return Err(MemoryError::OutOfPool);
        }
        core.free_slot(ptr);
        Ok(())
    }

    /// Diagnostic snapshot of the pool.
    pub fn report(&self) -> SegregatedPoolReport {
        self.core.borrow().report()
    }

    /// Running operation counters.
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
}

impl RawPool for SegregatedPool {
    fn item_size(&self) -> usize {
        self.core.borrow().config().item_size
    }

    fn allocate(&self) -> MemoryResult<NonNull<u8>> {
        SegregatedPool::allocate(self)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        SegregatedPool::free(self, ptr)
    }
}

impl std::fmt::Debug for SegregatedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegregatedPool")
            .field("item_size", &self.item_size())
            .field("blocks", &self.report().block_count())
            .finish_non_exhaustive()
    }
}
