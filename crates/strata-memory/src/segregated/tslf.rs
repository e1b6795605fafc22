//! Lock-free thread-safe segregated pool backed by thread-local state.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::ptr::NonNull;

use super::core::{SegregatedCore, SegregatedPoolReport};
use super::{RawPool, SegregatedPoolConfig};
use crate::error::{MemoryError, MemoryResult};

struct ChainSlot {
    config: SegregatedPoolConfig,
    handles: usize,
    core: SegregatedCore,
}

thread_local! {
    /// Storage of all lock-free segregated pools on this thread, keyed by
    /// configuration.
    static SEG_CHAINS: RefCell<Vec<ChainSlot>> = const { RefCell::new(Vec::new()) };
}

/// Same-size object pool with lock-free, thread-local state.
///
/// Handles are `!Send`; pools with identical configuration on one thread
/// share their storage, released when the last of them is dropped.
/// Pointers handed out here must never cross threads.
pub struct ThreadLocalSegregatedPool {
    config: SegregatedPoolConfig,
    _not_send: PhantomData<*const ()>,
}

impl ThreadLocalSegregatedPool {
    /// Creates (or joins) this thread's pool of `item_size`-byte slots.
    pub fn new(item_size: usize) -> MemoryResult<Self> {
        Self::with_config(SegregatedPoolConfig::new(item_size))
    }

    /// Creates (or joins) this thread's pool with the given configuration.
    pub fn with_config(config: SegregatedPoolConfig) -> MemoryResult<Self> {
        SEG_CHAINS.with(|chains| {
            let mut chains = chains.borrow_mut();
            if let Some(slot) = chains.iter_mut().find(|slot| slot.config == config) {
                slot.handles += 1;
            } else {
                chains.push(ChainSlot {
                    config: config.clone(),
                    handles: 1,
                    core: SegregatedCore::new(config.clone(), 0)?,
                });
            }
            Ok(())
        })?;

        Ok(Self {
            config,
            _not_send: PhantomData,
        })
    }

    fn with_core<R>(&self, op: impl FnOnce(&mut SegregatedCore) -> R) -> R {
        SEG_CHAINS.with(|chains| {
            let mut chains = chains.borrow_mut();
            let slot = chains
                .iter_mut()
                .find(|slot| slot.config == self.config)
                .expect("storage registered at construction on this thread");
            op(&mut slot.core)
        })
    }

    /// Hands out one slot. The pointer must stay on this thread.
    pub fn allocate(&self) -> MemoryResult<NonNull<u8>> {
        self.with_core(SegregatedCore::allocate_slot)
    }

    /// Returns a slot to this thread's storage.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live slot of this thread's storage and must not be
    /// used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        self.with_core(|core| {
            if !core.contains_slot(ptr) {
                return Err(MemoryError::OutOfPool);
            }
            // SAFETY: membership was just checked; the caller guarantees
            // liveness.
            unsafe { core.free_slot(ptr) };
            Ok(())
        })
    }

    /// Diagnostic snapshot of this thread's storage.
    pub fn report(&self) -> SegregatedPoolReport {
        self.with_core(|core| core.report())
    }

    /// Running operation counters of this thread's storage (shared with
    /// every same-configuration pool on the thread).
    pub fn stats(&self) -> std::sync::Arc<crate::stats::PoolStats> {
        self.with_core(|core| core.stats_handle())
    }
}

impl Drop for ThreadLocalSegregatedPool {
    fn drop(&mut self) {
        // During thread teardown the registry may already be gone; its own
        // drop released the storage in that case.
        let _ = SEG_CHAINS.try_with(|chains| {
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

impl RawPool for ThreadLocalSegregatedPool {
    fn item_size(&self) -> usize {
        self.config.item_size
    }

    fn allocate(&self) -> MemoryResult<NonNull<u8>> {
        ThreadLocalSegregatedPool::allocate(self)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) -> MemoryResult<()> {
        ThreadLocalSegregatedPool::free(self, ptr)
    }
}

impl std::fmt::Debug for ThreadLocalSegregatedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadLocalSegregatedPool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
