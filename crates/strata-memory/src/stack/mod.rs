//! Stack pools: bump arenas of linked blocks with in-block reuse, nested
//! scopes and in-place reallocation.
//!
//! A stack pool serves variable-size allocations from the tail of its
//! current block. Freed interior units go to a per-block LIFO free list
//! (with adjacency merging); freed trailing units are given straight back
//! to the bump offset. Blocks that empty out are released eagerly, and
//! scopes roll whole allocation ranges back in one step.
//!
//! Three shapes share one engine:
//! - [`StackPool`] - single-threaded, no synchronization.
//! - [`ThreadSafeStackPool`] - one mutex around every operation.
//! - [`ThreadLocalStackPool`] - no locks; state lives in thread-local
//!   storage, shared between same-configuration pools on the same thread.

mod block;
mod core;
mod nts;
mod report;
mod tsl;
mod tslf;

pub use block::UNIT_OVERHEAD;
pub use nts::StackPool;
pub use report::{StackBlockReport, StackPoolReport};
pub use tsl::ThreadSafeStackPool;
pub use tslf::ThreadLocalStackPool;

/// Default payload size of a stack pool block: 1 MiB.
pub const DEFAULT_BLOCK_SIZE: usize = 1 << 20;

/// Sizing configuration of a stack pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackPoolConfig {
    /// Payload size of a standard block. Requests that do not fit get a
    /// block of their own size instead.
    pub block_size: usize,
    /// Hard cap on a single allocation, off by default.
    pub max_allocation: Option<usize>,
}

impl Default for StackPoolConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_allocation: None,
        }
    }
}

impl StackPoolConfig {
    /// Configuration with the given block size.
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            ..Default::default()
        }
    }

    /// Installs a hard cap on single allocations.
    #[must_use]
    pub fn with_max_allocation(mut self, max: usize) -> Self {
        self.max_allocation = Some(max);
        self
    }
}
