//! Single-threaded stack pool.

use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::Arc;

use super::core::StackCore;
use super::report::StackPoolReport;
use super::StackPoolConfig;
use crate::error::MemoryResult;
use crate::stats::PoolStats;

/// Stack memory pool without synchronization.
///
/// The fastest shape; the type is neither `Send` nor `Sync`, so the
/// compiler keeps it on one thread. See [`super::ThreadSafeStackPool`] and
/// [`super::ThreadLocalStackPool`] for the concurrent shapes.
///
/// # Example
/// ```
/// use strata_memory::stack::StackPool;
///
/// let pool = StackPool::new(4096)?;
/// let ptr = pool.allocate(128)?;
/// unsafe {
///     std::ptr::write_bytes(ptr.as_ptr(), 0xAB, 128);
///     pool.free(ptr)?;
/// }
/// # Ok::<(), strata_memory::MemoryError>(())
/// ```
pub struct StackPool {
    core: RefCell<StackCore>,
    stats: Arc<PoolStats>,
}

impl StackPool {
    /// Creates a pool whose standard blocks hold `block_size` payload bytes.
    pub fn new(block_size: usize) -> MemoryResult<Self> {
        Self::with_config(StackPoolConfig::new(block_size))
    }

    /// Creates a pool from a full configuration.
    pub fn with_config(config: StackPoolConfig) -> MemoryResult<Self> {
        let core = StackCore::new(config)?;
        let stats = core.stats_handle();
        Ok(Self {
            core: RefCell::new(core),
            stats,
        })
    }

    /// Hands out `size` writable bytes, stable until freed, reallocated or
    /// rolled back by an enclosing scope.
    pub fn allocate(&self, size: usize) -> MemoryResult<NonNull<u8>> {
        self.core.borrow_mut().allocate(size)
    }

    /// Resizes the allocation behind `ptr`, relocating it if it cannot grow
    /// in place. Shrinking returns the same pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this pool. On success the old
    /// pointer must no longer be used unless it was returned back.
    pub unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> MemoryResult<NonNull<u8>> {
        self.core.borrow_mut().reallocate(ptr, new_size)
    }

    /// Releases the allocation behind `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this pool and must not be used
    /// afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        self.core.borrow_mut().free(ptr)
    }

    /// Opens a scope; every allocation made until the matching
    /// [`end_scope`](Self::end_scope) is rolled back at once.
    ///
    /// While a scope is open, allocations made before it must not be freed:
    /// the rollback would resurrect them.
    pub fn start_scope(&self) -> MemoryResult<()> {
        self.core.borrow_mut().start_scope()
    }

    /// Closes the innermost scope, restoring the pool to its state just
    /// before the matching [`start_scope`](Self::start_scope).
    pub fn end_scope(&self) -> MemoryResult<()> {
        self.core.borrow_mut().end_scope()
    }

    /// Diagnostic snapshot of the pool's blocks.
    pub fn report(&self) -> StackPoolReport {
        self.core.borrow().report()
    }

    /// Running operation counters.
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
}

impl std::fmt::Debug for StackPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackPool")
            .field("blocks", &self.report().block_count())
            .finish_non_exhaustive()
    }
}
