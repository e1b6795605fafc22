//! Lock-based thread-safe stack pool.

use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use super::core::StackCore;
use super::report::StackPoolReport;
use super::StackPoolConfig;
use crate::error::MemoryResult;
use crate::stats::PoolStats;

/// Stack memory pool guarded by a single mutex.
///
/// Every public operation locks the pool end to end, so operations
/// linearize at the mutex and pointers may be handed between threads (with
/// the usual happens-before established by the caller). Re-entering the
/// pool from within an operation on the same thread deadlocks; don't.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use strata_memory::stack::ThreadSafeStackPool;
///
/// let pool = Arc::new(ThreadSafeStackPool::new(4096)?);
/// let handles: Vec<_> = (0..4)
///     .map(|_| {
///         let pool = Arc::clone(&pool);
///         thread::spawn(move || {
///             let ptr = pool.allocate(64).unwrap();
///             unsafe { pool.free(ptr).unwrap() };
///         })
///     })
///     .collect();
/// for h in handles {
///     h.join().unwrap();
/// }
/// # Ok::<(), strata_memory::MemoryError>(())
/// ```
pub struct ThreadSafeStackPool {
    core: Mutex<StackCore>,
    stats: Arc<PoolStats>,
}

// SAFETY: the core exclusively owns its block chain, and every access to it
// goes through the mutex; the raw pointers inside are never shared outside
// a critical section.
unsafe impl Send for ThreadSafeStackPool {}
// SAFETY: as above; `&self` operations serialize on the mutex.
unsafe impl Sync for ThreadSafeStackPool {}

impl ThreadSafeStackPool {
    /// Creates a pool whose standard blocks hold `block_size` payload bytes.
    pub fn new(block_size: usize) -> MemoryResult<Self> {
        Self::with_config(StackPoolConfig::new(block_size))
    }

    /// Creates a pool from a full configuration.
    pub fn with_config(config: StackPoolConfig) -> MemoryResult<Self> {
        let core = StackCore::new(config)?;
        let stats = core.stats_handle();
        Ok(Self {
            core: Mutex::new(core),
            stats,
        })
    }

    /// Hands out `size` writable bytes.
    pub fn allocate(&self, size: usize) -> MemoryResult<NonNull<u8>> {
        self.core.lock().allocate(size)
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
        self.core.lock().reallocate(ptr, new_size)
    }

    /// Releases the allocation behind `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this pool and must not be used
    /// afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        self.core.lock().free(ptr)
    }

    /// Opens a scope. Scope pairs are pool-global: with several threads
    /// allocating, the rollback covers their allocations too, so scopes on
    /// a shared pool want external coordination.
    pub fn start_scope(&self) -> MemoryResult<()> {
        self.core.lock().start_scope()
    }

    /// Closes the innermost scope.
    pub fn end_scope(&self) -> MemoryResult<()> {
        self.core.lock().end_scope()
    }

    /// Diagnostic snapshot of the pool's blocks.
    pub fn report(&self) -> StackPoolReport {
        self.core.lock().report()
    }

    /// Running operation counters; readable without taking the pool lock.
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
}

impl std::fmt::Debug for ThreadSafeStackPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadSafeStackPool")
            .field("blocks", &self.report().block_count())
            .finish_non_exhaustive()
    }
}
