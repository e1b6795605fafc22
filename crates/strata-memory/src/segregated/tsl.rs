//! Lock-based thread-safe segregated pool.

use std::mem;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use super::core::{SegregatedCore, SegregatedPoolReport};
use super::{RawPool, SegregatedPoolConfig};
use crate::error::{MemoryError, MemoryResult};
use crate::stats::PoolStats;

/// Per-slot header of the lock-based shape: a pointer back to the state the
/// slot came from, so a freed pointer finds its owning free list no matter
/// which handle (or thread) performs the free.
#[repr(C)]
struct OwnerHeader {
    owner: *const SegShared,
}

const OWNER_OVERHEAD: usize = mem::size_of::<OwnerHeader>();

struct SegShared {
    core: Mutex<SegregatedCore>,
}

// SAFETY: the core exclusively owns its block chain, and every access to it
// goes through the mutex.
unsafe impl Send for SegShared {}
// SAFETY: as above; `&self` operations serialize on the mutex.
unsafe impl Sync for SegShared {}

/// Same-size object pool guarded by a mutex.
///
/// Cloning a pool yields another handle to the same storage. Each slot
/// carries an owner header, so a pointer allocated from one pool may be
/// freed through a different pool of the same shape and still lands in its
/// owner's free list.
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use strata_memory::segregated::ThreadSafeSegregatedPool;
///
/// let pool = Arc::new(ThreadSafeSegregatedPool::new(32)?);
/// let handles: Vec<_> = (0..4)
///     .map(|_| {
///         let pool = Arc::clone(&pool);
///         thread::spawn(move || {
///             let ptr = pool.allocate().unwrap();
///             unsafe { pool.free(ptr).unwrap() };
///         })
///     })
///     .collect();
/// for h in handles {
///     h.join().unwrap();
/// }
/// # Ok::<(), strata_memory::MemoryError>(())
/// ```
#[derive(Clone)]
pub struct ThreadSafeSegregatedPool {
    shared: Arc<SegShared>,
    stats: Arc<PoolStats>,
}

impl ThreadSafeSegregatedPool {
    /// Creates a pool of `item_size`-byte slots.
    pub fn new(item_size: usize) -> MemoryResult<Self> {
        Self::with_config(SegregatedPoolConfig::new(item_size))
    }

    /// Creates a pool from a full configuration.
    pub fn with_config(config: SegregatedPoolConfig) -> MemoryResult<Self> {
        let core = SegregatedCore::new(config, OWNER_OVERHEAD)?;
        let stats = core.stats_handle();
        Ok(Self {
            shared: Arc::new(SegShared {
                core: Mutex::new(core),
            }),
            stats,
        })
    }

    /// Hands out one slot.
    pub fn allocate(&self) -> MemoryResult<NonNull<u8>> {
        let base = self.shared.core.lock().allocate_slot()?;

        // SAFETY: the slot base is ours and at least a stride long; the
        // owner header occupies its first bytes.
        unsafe {
            base.cast::<OwnerHeader>().as_ptr().write(OwnerHeader {
                owner: Arc::as_ptr(&self.shared),
            });
            Ok(NonNull::new_unchecked(base.as_ptr().add(OWNER_OVERHEAD)))
        }
    }

    /// Returns a slot to its owning pool.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live slot of a still-live pool of this shape (not
    /// necessarily this handle's), and must not be used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        let base = NonNull::new_unchecked(ptr.as_ptr().sub(OWNER_OVERHEAD));
        let owner = base.cast::<OwnerHeader>().as_ptr().read().owner;
        if owner.is_null() {
            return Err(MemoryError::OutOfPool);
        }

        // SAFETY: the caller guarantees the owning pool is still alive.
        let mut core = (*owner).core.lock();
        if !core.contains_slot(base) {
            return Err(MemoryError::OutOfPool);
        }
        core.free_slot(base);
        Ok(())
    }

    /// Diagnostic snapshot of the pool.
    pub fn report(&self) -> SegregatedPoolReport {
        self.shared.core.lock().report()
    }

    /// Running operation counters; readable without taking the pool lock.
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }
}

impl RawPool for ThreadSafeSegregatedPool {
    fn item_size(&self) -> usize {
        self.shared.core.lock().config().item_size
    }

    fn allocate(&self) -> MemoryResult<NonNull<u8>> {
        ThreadSafeSegregatedPool::allocate(self)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        ThreadSafeSegregatedPool::free(self, ptr)
    }
}

impl std::fmt::Debug for ThreadSafeSegregatedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadSafeSegregatedPool")
            .field("item_size", &self.item_size())
            .field("blocks", &self.report().block_count())
            .finish_non_exhaustive()
    }
}
