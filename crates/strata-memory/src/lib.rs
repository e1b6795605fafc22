//! # strata-memory
//!
//! User-space memory pools for workloads with strong lifetime patterns.
//!
//! The crate sits between an application and the operating-system allocator
//! and trades generality for latency and fragmentation control:
//! - [`stack`] - bump arenas of linked blocks with in-block reuse, nested
//!   scopes and in-place reallocation, for variable-size allocations whose
//!   lifetimes roughly nest.
//! - [`segregated`] - same-size slot pools with a LIFO free list, for
//!   high-churn fixed-size objects.
//! - [`object`] - a typed facade over the segregated pools.
//!
//! Each pool family comes in three concurrency shapes: plain
//! (single-threaded), lock-based (one mutex, shareable), and lock-free
//! (thread-local state, no synchronization at all).
//!
//! ## Quick start
//!
//! ```
//! use strata_memory::prelude::*;
//!
//! let pool = StackPool::new(64 * 1024)?;
//!
//! pool.start_scope()?;
//! let scratch = pool.allocate(1024)?;
//! unsafe { std::ptr::write_bytes(scratch.as_ptr(), 0, 1024) };
//! pool.end_scope()?; // everything since start_scope is gone
//! # Ok::<(), strata_memory::MemoryError>(())
//! ```
//!
//! ## Safety model
//!
//! Pools hand out raw `NonNull<u8>` (or `NonNull<T>`) pointers; freeing and
//! reallocating are `unsafe` because the pool cannot prove the pointer is
//! still live. Out-of-pool pointers are detected on a best-effort basis and
//! reported as [`MemoryError::OutOfPool`] - do not rely on it.

#![warn(rust_2018_idioms)]
#![warn(clippy::all)]

pub mod error;
pub mod object;
pub mod segregated;
pub mod stack;
pub mod stats;
pub mod utils;

pub use error::{MemoryError, MemoryResult};

/// Convenient re-exports of the commonly used types.
pub mod prelude {
    pub use crate::error::{MemoryError, MemoryResult};
    pub use crate::object::{ObjectPool, PooledBox};
    pub use crate::segregated::{
        RawPool, SegregatedPool, SegregatedPoolConfig, ThreadLocalSegregatedPool,
        ThreadSafeSegregatedPool,
    };
    pub use crate::stack::{
        StackPool, StackPoolConfig, ThreadLocalStackPool, ThreadSafeStackPool,
    };
    pub use crate::stats::PoolStats;
}
