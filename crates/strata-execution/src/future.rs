//! Busy futures: awaiting that drains the queue instead of blocking.
//!
//! A worker thread that blocked on a condition variable while awaiting a
//! result whose producing callable is still queued would deadlock against
//! itself. A [`BusyFuture`] never blocks: while the shared flag is unset it
//! pops a bounded batch from the execution queue and runs it, so the
//! awaited callable always gets its turn eventually, even when the awaiter
//! is the only worker left.

use std::cell::UnsafeCell;
use std::hint;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::queue::ExecutionQueue;

/// State shared between one promise and any number of futures.
///
/// The value slot and the flag live in one allocation. The slot is written
/// exactly once, before the flag's release store; readers only touch it
/// after observing the flag with acquire, so the publication is ordered.
struct SharedBusyState<T> {
    value: UnsafeCell<MaybeUninit<T>>,
    is_ready: AtomicBool,
}

// SAFETY: the value moves to whichever thread drops or reads the state;
// publication is ordered by the release/acquire flag.
unsafe impl<T: Send> Send for SharedBusyState<T> {}
// SAFETY: after the acquire load of `is_ready`, readers only take shared
// references to the value, which `T: Sync` allows.
unsafe impl<T: Send + Sync> Sync for SharedBusyState<T> {}

impl<T> SharedBusyState<T> {
    fn new() -> Self {
        Self {
            value: UnsafeCell::new(MaybeUninit::uninit()),
            is_ready: AtomicBool::new(false),
        }
    }
}

impl<T> Drop for SharedBusyState<T> {
    fn drop(&mut self) {
        if *self.is_ready.get_mut() {
            // SAFETY: the flag says the slot was initialized, and drop has
            // exclusive access.
            unsafe { (*self.value.get()).assume_init_drop() };
        }
    }
}

/// Write end of a busy future/promise pair.
///
/// Created by [`crate::ThreadPool::add_promise`] or [`BusyPromise::new`].
/// Dropping a promise without setting a value leaves its futures waiting
/// forever.
pub struct BusyPromise<T> {
    state: Arc<SharedBusyState<T>>,
    queue: Arc<ExecutionQueue>,
}

impl<T> BusyPromise<T> {
    /// Creates a promise whose futures drain `queue` while they wait.
    pub fn new(queue: Arc<ExecutionQueue>) -> Self {
        Self {
            state: Arc::new(SharedBusyState::new()),
            queue,
        }
    }

    /// Stores the value and flips the shared flag. Consumes the promise:
    /// readiness is one-way and single-writer.
    pub fn set_value(self, value: T) {
        // SAFETY: `set_value` consumes the only writer, so the slot is
        // written at most once, strictly before the release store below.
        unsafe { (*self.state.value.get()).write(value) };
        self.state.is_ready.store(true, Ordering::Release);
    }

    /// A future observing this promise.
    pub fn get_future(&self) -> BusyFuture<T> {
        BusyFuture {
            state: Arc::clone(&self.state),
            queue: Arc::clone(&self.queue),
            max_events_per_wait: 1,
        }
    }
}

/// Read end of a busy future/promise pair.
pub struct BusyFuture<T> {
    state: Arc<SharedBusyState<T>>,
    queue: Arc<ExecutionQueue>,
    max_events_per_wait: usize,
}

impl<T> Clone for BusyFuture<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            queue: Arc::clone(&self.queue),
            max_events_per_wait: self.max_events_per_wait,
        }
    }
}

impl<T> BusyFuture<T> {
    /// Overrides how many queued callables each wait iteration may run
    /// (default 1).
    #[must_use]
    pub fn with_max_events_per_wait(mut self, max_events: usize) -> Self {
        self.max_events_per_wait = max_events.max(1);
        self
    }

    /// Runs queued callables until the promise is fulfilled.
    pub fn wait(&self) {
        while !self.state.is_ready.load(Ordering::Acquire) {
            let events = self.queue.pop(self.max_events_per_wait, true);
            if events.is_empty() {
                // Nothing to help with right now; another worker holds the
                // producing callable.
                hint::spin_loop();
                continue;
            }
            for event in events {
                event();
            }
        }
    }

    /// Whether the value has been set.
    pub fn is_ready(&self) -> bool {
        self.state.is_ready.load(Ordering::Acquire)
    }
}

impl<T: Clone> BusyFuture<T> {
    /// Waits for the value and returns a copy of it.
    pub fn get(&self) -> T {
        self.wait();
        // SAFETY: `wait` returned, so the acquire load saw the flag and the
        // slot is initialized; it is never written again.
        unsafe { (*self.state.value.get()).assume_init_ref().clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_is_monotonic() {
        let queue = Arc::new(ExecutionQueue::new(8));
        let promise = BusyPromise::new(queue);
        let future = promise.get_future();

        assert!(!future.is_ready());
        promise.set_value(42);
        assert!(future.is_ready());
        assert_eq!(future.get(), 42);
        assert_eq!(future.get(), 42);
        assert!(future.is_ready());
    }

    #[test]
    fn wait_drains_the_queue() {
        let queue = Arc::new(ExecutionQueue::new(8));
        let promise = BusyPromise::new(Arc::clone(&queue));
        let future = promise.get_future();

        // The fulfilling callable sits in the queue; wait() must run it
        // itself.
        queue.push(Box::new(move || promise.set_value("done")));
        assert_eq!(future.get(), "done");
    }

    #[test]
    fn futures_share_one_state() {
        let queue = Arc::new(ExecutionQueue::new(8));
        let promise = BusyPromise::new(queue);
        let one = promise.get_future();
        let two = one.clone();

        promise.set_value(7u64);
        assert_eq!(one.get(), 7);
        assert_eq!(two.get(), 7);
    }

    #[test]
    fn cross_thread_fulfilment() {
        let queue = Arc::new(ExecutionQueue::new(8));
        let promise = BusyPromise::new(Arc::clone(&queue));
        let future = promise.get_future();

        let producer = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            promise.set_value(1234u32);
        });

        assert_eq!(future.get(), 1234);
        producer.join().unwrap();
    }
}
