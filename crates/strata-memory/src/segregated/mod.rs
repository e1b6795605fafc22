//! Segregated pools: same-size object storage with a LIFO free list.
//!
//! A segregated pool hands out fixed-size slots from a chain of equally
//! sized blocks. Freed slots go onto one pool-wide singly-linked stack and
//! are reused most-recent-first; slots never move, and blocks are only
//! released when the pool is dropped.
//!
//! Three shapes share one engine:
//! - [`SegregatedPool`] - single-threaded, no synchronization.
//! - [`ThreadSafeSegregatedPool`] - one mutex; each slot carries an owner
//!   header so pointers can be freed through any handle, from any thread.
//! - [`ThreadLocalSegregatedPool`] - no locks; state lives in thread-local
//!   storage, shared between same-configuration pools on the same thread.
//!
//! For a typed facade over any of these, see [`crate::object::ObjectPool`].

mod core;
mod nts;
mod tsl;
mod tslf;

use std::ptr::NonNull;

pub use self::core::{SegregatedBlockReport, SegregatedPoolReport};
pub use nts::SegregatedPool;
pub use tsl::ThreadSafeSegregatedPool;
pub use tslf::ThreadLocalSegregatedPool;

use crate::error::MemoryResult;

/// Default slot count per block.
pub const DEFAULT_ITEMS_PER_BLOCK: usize = 128;

/// Sizing configuration of a segregated pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegregatedPoolConfig {
    /// Usable bytes of every slot.
    pub item_size: usize,
    /// Slots per block.
    pub items_per_block: usize,
}

impl SegregatedPoolConfig {
    /// Configuration for `item_size`-byte slots with the default block
    /// capacity.
    pub fn new(item_size: usize) -> Self {
        Self {
            item_size,
            items_per_block: DEFAULT_ITEMS_PER_BLOCK,
        }
    }

    /// Configuration sized for values of type `T`.
    pub fn for_type<T>() -> Self {
        Self::new(std::mem::size_of::<T>())
    }

    /// Overrides the slot count per block.
    #[must_use]
    pub fn with_items_per_block(mut self, items_per_block: usize) -> Self {
        self.items_per_block = items_per_block;
        self
    }
}

/// Fixed-size allocation seam shared by the segregated pool shapes.
///
/// [`crate::object::ObjectPool`] is generic over this trait, so a typed
/// pool can sit on whichever concurrency shape fits the call site.
pub trait RawPool {
    /// Usable bytes of every slot.
    fn item_size(&self) -> usize;

    /// Hands out one slot of exactly [`item_size`](Self::item_size) usable
    /// bytes. The slot's contents are unspecified.
    fn allocate(&self) -> MemoryResult<NonNull<u8>>;

    /// Returns a slot to the pool.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on
    /// this pool (for the lock-based shape: on any handle of a still-live
    /// pool), must not already be free, and must not be used afterwards.
    unsafe fn free(&self, ptr: NonNull<u8>) -> MemoryResult<()>;
}
