//! Error types for pool operations.

use thiserror::Error;

/// Result type for pool operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Errors surfaced by the pools.
///
/// Every operation either succeeds or leaves the pool unchanged; none of
/// these errors poison the pool they came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// The operating system refused the pool's initial bookkeeping
    /// allocation. The pool was never constructed.
    #[error("cannot create pool: backing allocation refused")]
    CannotCreatePool,

    /// The operating system refused a block allocation. The triggering
    /// call fails; existing allocations are untouched.
    #[error("cannot create block of {size} bytes")]
    CannotCreateBlock {
        /// Requested payload size of the block.
        size: usize,
    },

    /// The request is larger than the configured hard cap.
    #[error("requested {requested} bytes exceeds the configured cap of {max}")]
    ExceedsMaxSize {
        /// Size the caller asked for.
        requested: usize,
        /// Installed cap.
        max: usize,
    },

    /// The pointer does not belong to this pool. Detection is best-effort:
    /// the pool scans its blocks, but callers must not rely on a foreign
    /// pointer being caught.
    #[error("pointer does not belong to this pool")]
    OutOfPool,

    /// `end_scope` was called with no scope open.
    #[error("no scope is open")]
    NoOpenScope,

    /// The type's alignment exceeds what the pool can guarantee.
    #[error("alignment {required} exceeds the pool alignment {supported}")]
    UnsupportedAlignment {
        /// Alignment the type needs.
        required: usize,
        /// Alignment the pool hands out.
        supported: usize,
    },
}
