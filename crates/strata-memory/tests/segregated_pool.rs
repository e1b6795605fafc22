//! Integration tests for the segregated pools and the typed facade.

use std::sync::mpsc;
use std::sync::Arc;

use strata_memory::object::ObjectPool;
use strata_memory::segregated::{
    SegregatedPool, SegregatedPoolConfig, ThreadSafeSegregatedPool,
};

// Fill a block, spill into a second, and reclaim LIFO.
#[test]
fn stack_reuse_across_blocks() {
    let pool = SegregatedPool::with_config(
        SegregatedPoolConfig::new(16).with_items_per_block(4),
    )
    .unwrap();

    let p1 = pool.allocate().unwrap();
    let p2 = pool.allocate().unwrap();
    let p3 = pool.allocate().unwrap();
    let p4 = pool.allocate().unwrap();
    assert_eq!(pool.report().block_count(), 1);

    let p5 = pool.allocate().unwrap();
    assert_eq!(pool.report().block_count(), 2);

    unsafe {
        pool.free(p3).unwrap();
        let p6 = pool.allocate().unwrap();
        assert_eq!(p6, p3);

        pool.free(p6).unwrap();
        pool.free(p2).unwrap();
        pool.free(p1).unwrap();
        pool.free(p4).unwrap();
        pool.free(p5).unwrap();
    }

    // Blocks are kept; nothing is live.
    let report = pool.report();
    assert_eq!(report.block_count(), 2);
    assert_eq!(report.live_slots(), 0);
    assert_eq!(report.free_slots, 5);
}

// Pointers never move: a slot's contents survive unrelated churn.
#[test]
fn slots_are_stable() {
    let pool = SegregatedPool::with_config(
        SegregatedPoolConfig::new(8).with_items_per_block(2),
    )
    .unwrap();

    let keeper = pool.allocate().unwrap();
    unsafe {
        keeper.cast::<u64>().write(0xDEAD_BEEF_u64);

        for _ in 0..100 {
            let scratch = pool.allocate().unwrap();
            scratch.cast::<u64>().write(0);
            pool.free(scratch).unwrap();
        }

        assert_eq!(keeper.cast::<u64>().read(), 0xDEAD_BEEF);
        pool.free(keeper).unwrap();
    }
}

// A pointer allocated on one thread may be freed from another through the
// lock-based pool.
#[test]
fn cross_thread_free() {
    let pool = Arc::new(ThreadSafeSegregatedPool::new(32).unwrap());
    let (tx, rx) = mpsc::channel::<usize>();

    let producer = {
        let pool = Arc::clone(&pool);
        std::thread::spawn(move || {
            for _ in 0..64 {
                tx.send(pool.allocate().unwrap().as_ptr() as usize).unwrap();
            }
        })
    };

    let consumer = {
        let pool = Arc::clone(&pool);
        std::thread::spawn(move || {
            for raw in rx {
                let ptr = std::ptr::NonNull::new(raw as *mut u8).unwrap();
                unsafe { pool.free(ptr).unwrap() };
            }
        })
    };

    producer.join().unwrap();
    consumer.join().unwrap();
    assert_eq!(pool.report().live_slots(), 0);
}

// An intrusive singly-linked stack living entirely in an object pool.
#[test]
fn object_pool_backed_list() {
    struct Node {
        value: u64,
        next: Option<std::ptr::NonNull<Node>>,
    }

    let pool: ObjectPool<Node> = ObjectPool::with_items_per_block(16).unwrap();

    let mut head: Option<std::ptr::NonNull<Node>> = None;
    for value in 0..100u64 {
        let node = pool.allocate_with(Node { value, next: head }).unwrap();
        head = Some(node);
    }

    let mut expected = 100u64;
    while let Some(node) = head {
        expected -= 1;
        unsafe {
            assert_eq!(node.as_ref().value, expected);
            head = node.as_ref().next;
            pool.free_value(node).unwrap();
        }
    }
    assert_eq!(expected, 0);
}
