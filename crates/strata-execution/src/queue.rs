//! Block-chained FIFO queue of callables.
//!
//! # Safety
//!
//! The queue stores boxed callables in a ring of heap blocks, each one a
//! `QueueBlock` header followed by `capacity` slots. The producer cursor
//! (`current`/`rear`) and the consumer cursor (`first`/`front`) chase each
//! other around the ring; when the producer would run into the consumer's
//! block, or into a block a `PopResult` still references, it splices a
//! fresh block into the ring instead.
//!
//! ## Invariants
//!
//! - Slots in `[front, rear)` order (across the ring from `first` to
//!   `current`) hold initialized callables; every other slot is vacant.
//! - Each callable is read out exactly once, by the `PopResult` that covers
//!   its slot.
//! - A block is only deallocated when the queue itself drops, after every
//!   `PopResult` is gone (their lifetimes enforce this).

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

/// A queued callable.
pub type Event = Box<dyn FnOnce() + Send + 'static>;

/// Default slot count of a queue block.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1 << 20;

/// Header of one ring block; `capacity` callable slots follow it.
#[repr(C)]
struct QueueBlock {
    /// Next block in ring order; self-referential in a ring of one.
    next: *mut QueueBlock,
    capacity: usize,
    /// Outstanding `PopResult`s over this block.
    ref_count: AtomicUsize,
}

impl QueueBlock {
    fn layout(capacity: usize) -> Layout {
        let (layout, _) = Layout::new::<QueueBlock>()
            .extend(
                Layout::array::<MaybeUninit<Event>>(capacity)
                    .expect("queue capacity overflows a Layout"),
            )
            .expect("queue capacity overflows a Layout");
        layout
    }

    /// Allocates a detached block; aborts on allocation failure like the
    /// global allocator does, so `push` stays infallible.
    fn create(capacity: usize) -> *mut QueueBlock {
        let layout = Self::layout(capacity);

        // SAFETY: the layout is non-zero sized (it includes the header).
        let raw = unsafe { alloc(layout) }.cast::<QueueBlock>();
        if raw.is_null() {
            handle_alloc_error(layout);
        }

        // SAFETY: freshly allocated with the right layout.
        unsafe {
            raw.write(QueueBlock {
                next: raw,
                capacity,
                ref_count: AtomicUsize::new(0),
            });
        }
        raw
    }

    /// # Safety
    ///
    /// `block` must come from [`create`](Self::create), be unreferenced and
    /// hold no initialized slots.
    unsafe fn destroy(block: *mut QueueBlock) {
        debug_assert_eq!((*block).ref_count.load(Ordering::Acquire), 0);
        let layout = Self::layout((*block).capacity);
        dealloc(block.cast(), layout);
    }
}

/// First slot of `block`.
///
/// # Safety
///
/// `block` must point to a live block.
#[inline]
unsafe fn slots(block: *mut QueueBlock) -> *mut MaybeUninit<Event> {
    block.add(1).cast()
}

struct QueueState {
    /// Consumer block.
    first: *mut QueueBlock,
    /// Producer block.
    current: *mut QueueBlock,
    /// Consumer index into `first`.
    front: usize,
    /// Producer index into `current`.
    rear: usize,
}

impl QueueState {
    fn is_empty(&self) -> bool {
        self.front == self.rear && ptr::eq(self.first, self.current)
    }
}

/// Lock-based FIFO queue of callables with block-granular, reference-counted
/// consumption.
///
/// `push` appends under a mutex; `pop` hands back a contiguous range of
/// callables from the front block as a [`PopResult`], which executes (or
/// drops) them without further locking. Within one producer the order is
/// FIFO; across producers it is the order of mutex acquisition.
pub struct ExecutionQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    /// When set, empty pops return immediately instead of waiting.
    drain_on_empty: AtomicBool,
    capacity: usize,
}

// SAFETY: the ring is owned by the queue and only touched under the mutex;
// the callables are `Send`; refcounts are atomic.
unsafe impl Send for ExecutionQueue {}
// SAFETY: as above.
unsafe impl Sync for ExecutionQueue {}

impl Default for ExecutionQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl ExecutionQueue {
    /// Creates a queue whose ring blocks hold `capacity` callables each.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        let block = QueueBlock::create(capacity);

        Self {
            state: Mutex::new(QueueState {
                first: block,
                current: block,
                front: 0,
                rear: 0,
            }),
            not_empty: Condvar::new(),
            drain_on_empty: AtomicBool::new(false),
            capacity,
        }
    }

    /// Appends a callable at the rear of the queue and wakes one waiter.
    pub fn push(&self, event: Event) {
        {
            let mut state = self.state.lock();

            // SAFETY: `current` is a live ring block; the cursor invariants
            // hold under the mutex.
            unsafe {
                if state.rear == (*state.current).capacity {
                    state.rear = 0;
                    let next = (*state.current).next;

                    // The next ring block is off limits while it is the
                    // consumer's block or an outstanding PopResult holds it:
                    // splice a fresh block in between.
                    if ptr::eq(next, state.first)
                        || (*next).ref_count.load(Ordering::Acquire) != 0
                    {
                        let fresh = QueueBlock::create(self.capacity);
                        (*fresh).next = next;
                        (*state.current).next = fresh;
                        state.current = fresh;
                        tracing::trace!(capacity = self.capacity, "spliced queue block");
                    } else {
                        state.current = next;
                    }
                }

                slots(state.current)
                    .add(state.rear)
                    .write(MaybeUninit::new(event));
                state.rear += 1;
            }
        }
        self.not_empty.notify_one();
    }

    /// Takes up to `max_count` callables from the front of the queue.
    ///
    /// Blocks on the internal condition variable until the queue is
    /// non-empty, unless `continue_if_empty` is set or
    /// [`set_drain_on_empty`](Self::set_drain_on_empty) was enabled, in
    /// which case an empty result comes back immediately.
    ///
    /// The result covers a contiguous range of one block, at most up to the
    /// block's end; drain loops simply pop again.
    pub fn pop(&self, max_count: usize, continue_if_empty: bool) -> PopResult<'_> {
        let mut state = self.state.lock();

        self.not_empty.wait_while(&mut state, |state| {
            state.is_empty()
                && !continue_if_empty
                && !self.drain_on_empty.load(Ordering::Acquire)
        });

        if state.is_empty() || max_count == 0 {
            return PopResult::empty();
        }

        // SAFETY: cursor invariants hold under the mutex; blocks are live.
        unsafe {
            // A fully consumed front block parks the cursor at its end;
            // step over it now that the producer has moved on.
            if state.front == (*state.first).capacity && !ptr::eq(state.first, state.current)
            {
                state.first = (*state.first).next;
                state.front = 0;
            }

            let block = state.first;
            let start = state.front;
            let available = if ptr::eq(state.first, state.current) {
                state.rear - state.front
            } else {
                (*block).capacity - state.front
            };
            let count = max_count.min(available);

            state.front += count;
            (*block).ref_count.fetch_add(1, Ordering::Relaxed);

            PopResult {
                block,
                index: start,
                remaining: count,
                _queue: PhantomData,
            }
        }
    }

    /// Whether the queue currently holds no callables.
    pub fn is_empty(&self) -> bool {
        self.state.lock().is_empty()
    }

    /// When enabled, empty pops stop waiting and return empty results.
    /// Used to unblock consumers during shutdown; wakes every waiter.
    pub fn set_drain_on_empty(&self, drain: bool) {
        self.drain_on_empty.store(drain, Ordering::Release);
        if drain {
            self.not_empty.notify_all();
        }
    }
}

impl Drop for ExecutionQueue {
    fn drop(&mut self) {
        // Drop whatever was never consumed. PopResult lifetimes guarantee
        // no consumer still holds a range here.
        loop {
            let leftovers = self.pop(usize::MAX, true);
            if leftovers.is_empty() {
                break;
            }
            drop(leftovers);
        }

        let state = self.state.get_mut();
        // SAFETY: the ring is fully owned and every slot is vacant now.
        unsafe {
            let anchor = state.first;
            let mut block = anchor;
            loop {
                let next = (*block).next;
                QueueBlock::destroy(block);
                if ptr::eq(next, anchor) {
                    break;
                }
                block = next;
            }
        }
    }
}

/// A popped range of callables: a half-open window into one queue block.
///
/// Iterating yields the callables in push order. Dropping the result drops
/// any callables that were not consumed and releases the block reference.
pub struct PopResult<'queue> {
    /// Null for an empty result.
    block: *mut QueueBlock,
    index: usize,
    remaining: usize,
    _queue: PhantomData<&'queue ExecutionQueue>,
}

impl PopResult<'_> {
    fn empty() -> Self {
        Self {
            block: ptr::null_mut(),
            index: 0,
            remaining: 0,
            _queue: PhantomData,
        }
    }

    /// Callables left in this range.
    pub fn len(&self) -> usize {
        self.remaining
    }

    /// Whether the range is exhausted (or was empty to begin with).
    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }
}

impl Iterator for PopResult<'_> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        if self.remaining == 0 {
            return None;
        }

        // SAFETY: the range [index, index + remaining) covers slots this
        // result exclusively owns; each is read exactly once.
        let event = unsafe { slots(self.block).add(self.index).read().assume_init() };
        self.index += 1;
        self.remaining -= 1;
        Some(event)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for PopResult<'_> {}

impl Drop for PopResult<'_> {
    fn drop(&mut self) {
        if self.block.is_null() {
            return;
        }

        // Unconsumed callables are dropped, not executed.
        while self.next().is_some() {}

        // SAFETY: the block outlives this result (queue lifetime).
        unsafe {
            (*self.block).ref_count.fetch_sub(1, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    fn event(counter: &Arc<AtomicUsize>, value: usize) -> Event {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.store(value, Ordering::SeqCst);
        })
    }

    #[test]
    fn fifo_within_one_producer() {
        let queue = ExecutionQueue::new(4);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for value in 0..10usize {
            let seen = Arc::clone(&seen);
            queue.push(Box::new(move || seen.lock().push(value)));
        }

        while !queue.is_empty() {
            for event in queue.pop(3, true) {
                event();
            }
        }

        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn pop_ranges_stay_within_one_block() {
        let queue = ExecutionQueue::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        for value in 0..6usize {
            queue.push(event(&counter, value));
        }

        // 4 slots in the first block, even though 16 were requested.
        let first = queue.pop(16, true);
        assert_eq!(first.len(), 4);
        for event in first {
            event();
        }

        let second = queue.pop(16, true);
        assert_eq!(second.len(), 2);
        drop(second);
    }

    #[test]
    fn empty_pop_returns_immediately_when_asked() {
        let queue = ExecutionQueue::new(4);
        let result = queue.pop(8, true);
        assert_eq!(result.len(), 0);
    }

    #[test]
    fn drain_on_empty_unblocks_waiters() {
        let queue = Arc::new(ExecutionQueue::new(4));

        let waiter = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.pop(1, false).len())
        };

        std::thread::sleep(std::time::Duration::from_millis(50));
        queue.set_drain_on_empty(true);
        assert_eq!(waiter.join().unwrap(), 0);
    }

    #[test]
    fn ring_reuses_and_splices_blocks() {
        let queue = ExecutionQueue::new(2);
        let seen = Arc::new(Mutex::new(Vec::new()));

        // Cycle enough values through a tiny ring to force both block
        // reuse and splicing while a PopResult is held.
        let mut pushed = 0usize;
        let mut held = None;
        for round in 0..50usize {
            for _ in 0..3 {
                let seen = Arc::clone(&seen);
                let value = pushed;
                queue.push(Box::new(move || seen.lock().push(value)));
                pushed += 1;
            }

            // Hold one result across the next round on odd rounds.
            if round % 2 == 0 {
                held = Some(queue.pop(1, true));
            } else {
                if let Some(result) = held.take() {
                    for event in result {
                        event();
                    }
                }
                while !queue.is_empty() {
                    for event in queue.pop(8, true) {
                        event();
                    }
                }
            }
        }
        if let Some(result) = held.take() {
            for event in result {
                event();
            }
        }
        while !queue.is_empty() {
            for event in queue.pop(8, true) {
                event();
            }
        }

        let mut seen = seen.lock().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..pushed).collect::<Vec<_>>());
    }

    #[test]
    fn unconsumed_events_are_dropped_not_run() {
        let executed = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicUsize::new(0));

        struct DropProbe(Arc<AtomicUsize>);
        impl Drop for DropProbe {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        {
            let queue = ExecutionQueue::new(8);
            for _ in 0..5 {
                let executed = Arc::clone(&executed);
                let probe = DropProbe(Arc::clone(&dropped));
                queue.push(Box::new(move || {
                    let _probe = &probe;
                    executed.fetch_add(1, Ordering::SeqCst);
                }));
            }
            // Queue dropped with everything still inside.
        }

        assert_eq!(executed.load(Ordering::SeqCst), 0);
        assert_eq!(dropped.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn interleaved_producers_lose_no_events() {
        let queue = Arc::new(ExecutionQueue::new(16));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let producers: Vec<_> = (0..4usize)
            .map(|producer| {
                let queue = Arc::clone(&queue);
                let seen = Arc::clone(&seen);
                std::thread::spawn(move || {
                    for i in 0..250usize {
                        let seen = Arc::clone(&seen);
                        let value = producer * 1000 + i;
                        queue.push(Box::new(move || seen.lock().push(value)));
                    }
                })
            })
            .collect();

        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                let mut run = 0usize;
                while run < 1000 {
                    for event in queue.pop(32, true) {
                        event();
                        run += 1;
                    }
                }
            })
        };

        for p in producers {
            p.join().unwrap();
        }
        consumer.join().unwrap();

        let mut seen = seen.lock().clone();
        seen.sort_unstable();
        let mut expected: Vec<_> = (0..4)
            .flat_map(|p| (0..250).map(move |i| p * 1000 + i))
            .collect();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }
}
