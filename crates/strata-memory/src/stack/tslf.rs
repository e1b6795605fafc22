//! Lock-free thread-safe stack pool backed by thread-local state.
//!
//! Thread locality here is a correctness mechanism, not an optimization:
//! each thread owns its chain outright, so no operation ever needs a lock.
//! Pools constructed with the same configuration on the same thread share
//! one chain through a handle count; the chain is released when the last
//! such pool on the thread goes away.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::ptr::NonNull;

use super::core::StackCore;
use super::report::StackPoolReport;
use super::StackPoolConfig;
use crate::error::MemoryResult;

struct ChainSlot {
    config: StackPoolConfig,
    handles: usize,
    core: StackCore,
}

thread_local! {
    /// Chains of all lock-free stack pools on this thread, keyed by
    /// configuration.
    static STACK_CHAINS: RefCell<Vec<ChainSlot>> = const { RefCell::new(Vec::new()) };
}

/// Stack memory pool with lock-free, thread-local state.
///
/// Handles are `!Send`: the thread that creates a handle is the thread the
/// state lives on, and pointers handed out here must never cross threads.
/// Two handles with the same configuration on one thread allocate from the
/// same blocks.
///
/// # Example
/// ```
/// use strata_memory::stack::ThreadLocalStackPool;
///
/// let a = ThreadLocalStackPool::new(4096)?;
/// let b = ThreadLocalStackPool::new(4096)?;
///
/// // Same configuration, same thread: one shared chain.
/// let ptr = a.allocate(64)?;
/// assert_eq!(b.report().live_units(), 1);
/// unsafe { b.free(ptr)? };
/// # Ok::<(), strata_memory::MemoryError>(())
/// ```
pub struct ThreadLocalStackPool {
    config: StackPoolConfig,
    _not_send: PhantomData<*const ()>,
}

impl ThreadLocalStackPool {
    /// Creates (or joins) this thread's pool with the given block size.
    pub fn new(block_size: usize) -> MemoryResult<Self> {
        Self::with_config(StackPoolConfig::new(block_size))
    }

    /// Creates (or joins) this thread's pool with the given configuration.
    pub fn with_config(config: StackPoolConfig) -> MemoryResult<Self> {
        STACK_CHAINS.with(|chains| {
            let mut chains = chains.borrow_mut();
            if let Some(slot) = chains.iter_mut().find(|slot| slot.config == config) {
                slot.handles += 1;
            } else {
                chains.push(ChainSlot {
                    config: config.clone(),
                    handles: 1,
                    core: StackCore::new(config.clone())?,
                });
            }
            Ok(())
        })?;

        Ok(Self {
            config,
            _not_send: PhantomData,
        })
    }

    fn with_core<R>(&self, op: impl FnOnce(&mut StackCore) -> R) -> R {
        STACK_CHAINS.with(|chains| {
            let mut chains = chains.borrow_mut();
            let slot = chains
                .iter_mut()
                .find(|slot| slot.config == self.config)
                .expect("chain registered at construction on this thread");
            op(&mut slot.core)
        })
    }

    /// Hands out `size` writable bytes. The pointer must stay on this
    /// thread.
    pub fn allocate(&self, size: usize) -> MemoryResult<NonNull<u8>> {
        self.with_core(|core| core.allocate(size))
    }

    /// Resizes the allocation behind `ptr`, relocating it if it cannot grow
    /// in place. Shrinking returns the same pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this thread's chain. On success
    /// the old pointer must no longer be used unless it was returned back.
    pub unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> MemoryResult<NonNull<u8>> {
        // SAFETY: forwarded caller contract.
        self.with_core(|core| unsafe { core.reallocate(ptr, new_size) })
    }

    /// Releases the allocation behind `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this thread's chain and must not
    /// be used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        // SAFETY: forwarded caller contract.
        self.with_core(|core| unsafe { core.free(ptr) })
    }

    /// Opens a scope on this thread's chain.
    ///
    /// While a scope is open, allocations made before it must not be freed:
    /// the rollback would resurrect them.
    pub fn start_scope(&self) -> MemoryResult<()> {
        self.with_core(StackCore::start_scope)
    }

    /// Closes the innermost scope on this thread's chain.
    pub fn end_scope(&self) -> MemoryResult<()> {
        self.with_core(StackCore::end_scope)
    }

    /// Diagnostic snapshot of this thread's chain.
    pub fn report(&self) -> StackPoolReport {
        self.with_core(|core| core.report())
    }

    /// Running operation counters of this thread's chain (shared with
    /// every same-configuration pool on the thread).
    pub fn stats(&self) -> std::sync::Arc<crate::stats::PoolStats> {
        self.with_core(|core| core.stats_handle())
    }
}

impl Drop for ThreadLocalStackPool {
    fn drop(&mut self) {
        // During thread teardown the registry may already be gone; its own
        // drop released the chain in that case.
        let _ = STACK_CHAINS.try_with(|chains| {
            let mut chains = chains.borrow_mut();
            if let Some(index) = chains.iter().position(|slot| slot.config == self.config) {
                chains[index].handles -= 1;
                if chains[index].handles == 0 {
                    chains.swap_remove(index);
                }
            }
        });
    }
}

impl std::fmt::Debug for ThreadLocalStackPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadLocalStackPool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_config_shares_chain() {
        let a = ThreadLocalStackPool::new(2048).unwrap();
        let b = ThreadLocalStackPool::new(2048).unwrap();

        let ptr = a.allocate(64).unwrap();
        assert_eq!(b.report().live_units(), 1);
        unsafe { b.free(ptr).unwrap() };
        assert_eq!(a.report().live_units(), 0);
    }

    #[test]
    fn different_config_is_isolated() {
        let a = ThreadLocalStackPool::new(2048).unwrap();
        let b = ThreadLocalStackPool::new(4096).unwrap();

        let ptr = a.allocate(64).unwrap();
        assert_eq!(b.report().live_units(), 0);
        unsafe { a.free(ptr).unwrap() };
    }

    #[test]
    fn chain_released_with_last_handle() {
        let a = ThreadLocalStackPool::new(1024).unwrap();
        let _p = a.allocate(64).unwrap();
        drop(a);

        // The previous chain died with its last handle; this one is fresh.
        let b = ThreadLocalStackPool::new(1024).unwrap();
        assert_eq!(b.report().live_units(), 0);
    }

    #[test]
    fn threads_do_not_share() {
        let a = ThreadLocalStackPool::new(2048).unwrap();
        let _p = a.allocate(64).unwrap();

        std::thread::spawn(|| {
            let b = ThreadLocalStackPool::new(2048).unwrap();
            assert_eq!(b.report().live_units(), 0);
        })
        .join()
        .unwrap();

        assert_eq!(a.report().live_units(), 1);
    }
}
