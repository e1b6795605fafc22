//! Walks through the three pool families on a request-scratchpad workload.

use strata_memory::object::ObjectPool;
use strata_memory::segregated::{SegregatedPool, SegregatedPoolConfig};
use strata_memory::stack::StackPool;
use strata_memory::MemoryResult;

struct Request {
    id: u64,
    payload_len: usize,
}

fn main() -> MemoryResult<()> {
    // Variable-size scratch memory: one scope per request, freed wholesale.
    let scratch = StackPool::new(64 * 1024)?;

    for request in [
        Request { id: 1, payload_len: 512 },
        Request { id: 2, payload_len: 48 * 1024 },
        Request { id: 3, payload_len: 96 * 1024 }, // spills into its own block
    ] {
        scratch.start_scope()?;

        let buffer = scratch.allocate(request.payload_len)?;
        unsafe { std::ptr::write_bytes(buffer.as_ptr(), 0, request.payload_len) };
        println!(
            "request {}: {} scratch bytes\n{}",
            request.id,
            request.payload_len,
            scratch.report()
        );

        scratch.end_scope()?;
    }

    // Fixed-size slots with LIFO reuse.
    let slots = SegregatedPool::with_config(
        SegregatedPoolConfig::new(64).with_items_per_block(32),
    )?;
    let a = slots.allocate()?;
    let b = slots.allocate()?;
    unsafe {
        slots.free(a)?;
        let reused = slots.allocate()?;
        assert_eq!(reused, a);
        slots.free(reused)?;
        slots.free(b)?;
    }

    // The same storage, typed.
    let nodes: ObjectPool<Request> = ObjectPool::with_items_per_block(32)?;
    let node = nodes.allocate_with(Request {
        id: 99,
        payload_len: 0,
    })?;
    unsafe {
        println!("pooled request id: {}", node.as_ref().id);
        nodes.free_value(node)?;
    }

    Ok(())
}
