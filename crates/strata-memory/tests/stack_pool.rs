//! Integration tests for the stack pools.

use std::ptr::NonNull;
use std::sync::Arc;

use strata_memory::stack::{
    StackPool, StackPoolConfig, ThreadSafeStackPool, UNIT_OVERHEAD,
};
use strata_memory::MemoryError;

fn addr(ptr: NonNull<u8>) -> usize {
    ptr.as_ptr() as usize
}

unsafe fn fill(ptr: NonNull<u8>, byte: u8, len: usize) {
    std::ptr::write_bytes(ptr.as_ptr(), byte, len);
}

unsafe fn check(ptr: NonNull<u8>, byte: u8, len: usize) {
    for i in 0..len {
        assert_eq!(*ptr.as_ptr().add(i), byte, "byte {i} corrupted");
    }
}

// Bump three units into one block, free the last one, then force the first
// to relocate on growth and drain the block back to a clean single-block
// pool.
#[test]
fn lifo_bump_and_reclaim() {
    let pool = StackPool::new(1024).unwrap();

    let a = pool.allocate(304).unwrap();
    let b = pool.allocate(304).unwrap();
    let c = pool.allocate(304).unwrap();

    // Same block, laid out contiguously.
    assert_eq!(pool.report().block_count(), 1);
    assert_eq!(addr(b) - addr(a), 304 + UNIT_OVERHEAD);
    assert_eq!(addr(c) - addr(b), 304 + UNIT_OVERHEAD);

    unsafe {
        fill(a, 0xAA, 304);
        pool.free(c).unwrap();

        // A is not the last unit in its block, so growing it relocates.
        let grown = pool.reallocate(a, 352).unwrap();
        assert_ne!(grown, a);
        check(grown, 0xAA, 304);

        pool.free(b).unwrap();
        pool.free(grown).unwrap();
    }

    // The sole block recycled instead of being released.
    let report = pool.report();
    assert_eq!(report.block_count(), 1);
    assert_eq!(report.live_units(), 0);
    assert_eq!(report.blocks[0].offset, 0);
}

// A scope swallows an oversized allocation's block and restores the first
// block exactly.
#[test]
fn scope_discipline() {
    let pool = StackPool::new(1024).unwrap();

    let x = pool.allocate(200).unwrap();
    unsafe { fill(x, 0x5A, 200) };
    let offset_before = pool.report().blocks[0].offset;

    pool.start_scope().unwrap();
    let y = pool.allocate(1_500_000).unwrap();
    unsafe { fill(y, 0xEE, 1_500_000) };
    assert_eq!(pool.report().block_count(), 2);
    pool.end_scope().unwrap();

    let report = pool.report();
    assert_eq!(report.block_count(), 1);
    assert_eq!(report.blocks[0].offset, offset_before);
    assert_eq!(report.blocks[0].live_units, 1);
    unsafe { check(x, 0x5A, 200) };
}

// With no trailing space left, an allocation is served first-fit from the
// free list without growing the block chain.
#[test]
fn free_list_first_fit() {
    // Three 104-byte units fill the block exactly.
    let pool = StackPool::new(3 * (104 + UNIT_OVERHEAD)).unwrap();

    let _a = pool.allocate(104).unwrap();
    let b = pool.allocate(104).unwrap();
    let _c = pool.allocate(104).unwrap();
    let offset_full = pool.report().blocks[0].offset;

    unsafe { pool.free(b).unwrap() };

    let d = pool.allocate(48).unwrap();
    assert_eq!(d, b);

    let report = pool.report();
    assert_eq!(report.block_count(), 1);
    assert_eq!(report.blocks[0].offset, offset_full);
    assert_eq!(report.blocks[0].free_slots, 0);
}

// Reallocation preserves content whether it moves or not.
#[test]
fn reallocate_preserves_content() {
    let pool = StackPool::new(4096).unwrap();

    let p = pool.allocate(128).unwrap();
    unsafe {
        fill(p, 0x3C, 128);

        // Trailing: grows in place.
        let grown = pool.reallocate(p, 256).unwrap();
        assert_eq!(grown, p);
        check(grown, 0x3C, 128);

        // Shrink requests keep the pointer and the bytes.
        let shrunk = pool.reallocate(grown, 64).unwrap();
        assert_eq!(shrunk, grown);
        check(shrunk, 0x3C, 128);

        pool.free(shrunk).unwrap();
    }
}

#[test]
fn allocation_cap_is_enforced() {
    let pool = StackPool::with_config(
        StackPoolConfig::new(4096).with_max_allocation(256),
    )
    .unwrap();

    assert!(pool.allocate(256).is_ok());
    assert_eq!(
        pool.allocate(257),
        Err(MemoryError::ExceedsMaxSize {
            requested: 257,
            max: 256
        })
    );
}

// At most one empty block survives any free sequence.
#[test]
fn empty_blocks_are_not_hoarded() {
    let pool = StackPool::new(256).unwrap();

    let keep = pool.allocate(64).unwrap();
    let mut big = Vec::new();
    for _ in 0..8 {
        big.push(pool.allocate(512).unwrap());
    }
    assert_eq!(pool.report().block_count(), 9);

    unsafe {
        for ptr in big.drain(..) {
            pool.free(ptr).unwrap();
        }
    }

    let report = pool.report();
    assert_eq!(report.block_count(), 1);
    assert_eq!(report.live_units(), 1);

    unsafe { pool.free(keep).unwrap() };
}

#[test]
fn stats_track_the_lifecycle() {
    let pool = StackPool::new(3 * (104 + UNIT_OVERHEAD)).unwrap();

    let _a = pool.allocate(104).unwrap();
    let b = pool.allocate(104).unwrap();
    let _c = pool.allocate(104).unwrap();
    unsafe { pool.free(b).unwrap() };

    // The block is full, so this reuses b's slot.
    let _d = pool.allocate(48).unwrap();

    let stats = pool.stats();
    assert_eq!(stats.allocations(), 4);
    assert_eq!(stats.frees(), 1);
    assert_eq!(stats.free_list_hits(), 1);
    assert_eq!(stats.blocks_created(), 1);
    assert_eq!(stats.blocks_released(), 0);

    // The first block is full, so the scope record and the oversized
    // allocation each get a block of their own; the scope takes both back.
    pool.start_scope().unwrap();
    let _big = pool.allocate(4096).unwrap();
    pool.end_scope().unwrap();

    let stats = pool.stats();
    assert_eq!(stats.scopes_opened(), 1);
    assert_eq!(stats.scopes_closed(), 1);
    assert_eq!(stats.blocks_created(), 3);
    assert_eq!(stats.blocks_released(), 2);
    assert_eq!(pool.report().block_count(), 1);
}

#[test]
fn shared_pool_parallel_churn() {
    let pool = Arc::new(ThreadSafeStackPool::new(64 * 1024).unwrap());

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                let byte = worker as u8;
                for round in 0..200 {
                    let size = 16 + (round % 13) * 24;
                    let ptr = pool.allocate(size).unwrap();
                    unsafe {
                        fill(ptr, byte, size);
                        check(ptr, byte, size);
                        pool.free(ptr).unwrap();
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(pool.report().live_units(), 0);
}

#[test]
fn scoped_batches_on_shared_pool() {
    let pool = ThreadSafeStackPool::new(8 * 1024).unwrap();
    let baseline = pool.report().blocks[0].offset;

    for _ in 0..50 {
        pool.start_scope().unwrap();
        for size in [24, 96, 8, 344] {
            let ptr = pool.allocate(size).unwrap();
            unsafe { fill(ptr, 0x11, size) };
        }
        pool.end_scope().unwrap();
        assert_eq!(pool.report().blocks[0].offset, baseline);
    }
}
