//! # strata-execution
//!
//! Worker coordination built around a block-chained queue of callables:
//! - [`queue::ExecutionQueue`] - a lock-based FIFO whose ring blocks are
//!   reference counted, so consumers take whole batches without copying.
//! - [`ThreadPool`] - N OS threads draining the queue until the pool drops;
//!   the drop is a full drain-and-join.
//! - [`BusyPromise`] / [`BusyFuture`] - completion signalling whose `wait`
//!   helps drain the queue, so a worker can await work it scheduled itself
//!   without deadlocking.
//!
//! ## Quick start
//!
//! ```
//! use strata_execution::ThreadPool;
//!
//! let pool = ThreadPool::new(4, 256);
//!
//! let future = pool.add_promise(|| 2 + 2);
//! assert_eq!(future.get(), 4);
//! ```
//!
//! The recursive case is the point: a callable may itself call
//! `add_promise` and `get` the result while running on a worker thread.

#![warn(rust_2018_idioms)]
#![warn(clippy::all)]

pub mod future;
pub mod queue;
pub mod thread_pool;

pub use future::{BusyFuture, BusyPromise};
pub use queue::{Event, ExecutionQueue, PopResult, DEFAULT_QUEUE_CAPACITY};
pub use thread_pool::{ThreadPool, ThreadPoolConfig, DEFAULT_MAX_EVENTS_PER_POP};
