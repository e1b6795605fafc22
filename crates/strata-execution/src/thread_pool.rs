//! Worker pool draining the execution queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::future::{BusyFuture, BusyPromise};
use crate::queue::{ExecutionQueue, DEFAULT_QUEUE_CAPACITY};

/// Default number of callables a worker takes per pop.
pub const DEFAULT_MAX_EVENTS_PER_POP: usize = 256;

/// Configuration of a [`ThreadPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadPoolConfig {
    /// Worker threads to start.
    pub workers: usize,
    /// Callables a worker takes per pop.
    pub max_events_per_pop: usize,
    /// Slot count of each queue block.
    pub queue_capacity: usize,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            max_events_per_pop: DEFAULT_MAX_EVENTS_PER_POP,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// An event loop over OS threads: `workers` threads drain one
/// [`ExecutionQueue`] until the pool is dropped.
///
/// Dropping the pool is a full drain: it stops accepting the workers'
/// blocking waits, helps run whatever is still queued, and joins every
/// worker. Every callable pushed before the drop has run exactly once by
/// the time `drop` returns.
///
/// # Example
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// use strata_execution::ThreadPool;
///
/// let pool = ThreadPool::new(4, 32);
/// let counter = Arc::new(AtomicUsize::new(0));
///
/// for _ in 0..100 {
///     let counter = Arc::clone(&counter);
///     pool.add_event(move || {
///         counter.fetch_add(1, Ordering::Relaxed);
///     });
/// }
///
/// drop(pool); // drains and joins
/// assert_eq!(counter.load(Ordering::Relaxed), 100);
/// ```
pub struct ThreadPool {
    queue: Arc<ExecutionQueue>,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    max_events_per_pop: usize,
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::with_config(ThreadPoolConfig::default())
    }
}

impl ThreadPool {
    /// Starts `workers` threads, each executing up to `max_events_per_pop`
    /// callables per queue pop.
    pub fn new(workers: usize, max_events_per_pop: usize) -> Self {
        Self::with_config(ThreadPoolConfig {
            workers,
            max_events_per_pop,
            ..Default::default()
        })
    }

    /// Starts a pool from a full configuration.
    pub fn with_config(config: ThreadPoolConfig) -> Self {
        let queue = Arc::new(ExecutionQueue::new(config.queue_capacity));
        let stop = Arc::new(AtomicBool::new(false));

        let workers = (0..config.workers)
            .map(|index| {
                let queue = Arc::clone(&queue);
                let stop = Arc::clone(&stop);
                let max_events = config.max_events_per_pop;

                std::thread::Builder::new()
                    .name(format!("strata-worker-{index}"))
                    .spawn(move || {
                        while !stop.load(Ordering::Acquire) || !queue.is_empty() {
                            for event in queue.pop(max_events, false) {
                                event();
                            }
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        tracing::debug!(
            workers = config.workers,
            max_events_per_pop = config.max_events_per_pop,
            "started thread pool"
        );

        Self {
            queue,
            stop,
            workers,
            max_events_per_pop: config.max_events_per_pop,
        }
    }

    /// Enqueues a callable for some worker to run.
    pub fn add_event(&self, event: impl FnOnce() + Send + 'static) {
        self.queue.push(Box::new(event));
    }

    /// Enqueues `f` and returns a [`BusyFuture`] observing its result.
    ///
    /// The future may be awaited from a worker thread: its `wait` drains
    /// this pool's queue instead of blocking, so a callable can safely
    /// await work it scheduled itself.
    pub fn add_promise<R, F>(&self, f: F) -> BusyFuture<R>
    where
        R: Send + Sync + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let promise = BusyPromise::new(Arc::clone(&self.queue));
        let future = promise.get_future();

        self.queue.push(Box::new(move || {
            promise.set_value(f());
        }));

        future
    }

    /// Runs queued callables until `condition` holds.
    ///
    /// Pops in non-blocking mode: when the queue is momentarily empty the
    /// loop just rechecks the condition, so it cannot wedge against a
    /// worker that drained the last callable first.
    pub fn wait(&self, condition: impl Fn() -> bool) {
        while !condition() {
            let events = self.queue.pop(self.max_events_per_pop, true);
            if events.is_empty() {
                std::hint::spin_loop();
                continue;
            }
            for event in events {
                event();
            }
        }
    }

    /// Runs queued callables until the queue is empty.
    pub fn wait_all(&self) {
        self.wait(|| self.queue.is_empty());
    }

    /// The queue this pool drains. Futures and external producers may push
    /// to it directly.
    pub fn queue(&self) -> &Arc<ExecutionQueue> {
        &self.queue
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.queue.set_drain_on_empty(true);

        // Help the workers finish the backlog before joining them.
        self.wait(|| self.queue.is_empty());

        for worker in self.workers.drain(..) {
            if let Err(panic) = worker.join() {
                tracing::error!(?panic, "worker thread panicked");
            }
        }

        tracing::debug!("thread pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn events_run_exactly_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(2, 8);
            for _ in 0..100 {
                let counter = Arc::clone(&counter);
                pool.add_event(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
            }
        }
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn promise_roundtrip() {
        let pool = ThreadPool::new(2, 8);
        let future = pool.add_promise(|| 6 * 7);
        assert_eq!(future.get(), 42);
    }

    #[test]
    fn unit_promises_work() {
        let pool = ThreadPool::new(1, 8);
        let ran = Arc::new(AtomicUsize::new(0));
        let future = {
            let ran = Arc::clone(&ran);
            pool.add_promise(move || {
                ran.fetch_add(1, Ordering::Relaxed);
            })
        };
        future.wait();
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn wait_all_drains() {
        let pool = ThreadPool::new(1, 4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            pool.add_event(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.wait_all();
        assert_eq!(counter.load(Ordering::Relaxed), 50);
    }
}
