//! The stack pool engine shared by all three concurrency variants.
//!
//! # Safety
//!
//! `StackCore` owns a doubly-linked chain of heap blocks and is the only
//! holder of pointers into them (apart from the payload pointers handed to
//! callers). All raw manipulation is confined to this module and
//! [`super::block`]; the concurrency wrappers only decide how a core is
//! shared.
//!
//! ## Invariants
//!
//! - The chain runs `first -> ... -> current`; `current` is the newest
//!   block and the only bump target.
//! - A block whose `live_units` hits zero is released immediately, unless
//!   it is the pool's sole block, which instead recycles to a clean state.
//! - Open scopes form a stack threaded through in-pool records; a record
//!   captures the visible state of the block it was opened in, sampled
//!   right before the record's own allocation.

use std::mem;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use super::block::{
    bump_allocate, create_block, destroy_block, payload_base, payload_end, push_free,
    take_from_free_list, unit_len, BlockHeader, FreeHeader, UnitHeader, UNIT_OVERHEAD,
};
use super::report::{StackBlockReport, StackPoolReport};
use super::StackPoolConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::stats::PoolStats;

/// Scope record, allocated in-pool as an ordinary unit.
///
/// Ending the scope restores every captured field, so the pool state
/// round-trips to the moment just before `start_scope`.
#[repr(C)]
struct ScopeHeader {
    /// Block that was current when the scope opened.
    block: *mut BlockHeader,
    offset: usize,
    live_units: usize,
    free_list: *mut FreeHeader,
    largest_free: usize,
    /// Enclosing scope.
    prev: *mut ScopeHeader,
}

/// Engine state of one stack pool: the block chain, the scope stack and the
/// sizing configuration.
pub(crate) struct StackCore {
    first: *mut BlockHeader,
    current: *mut BlockHeader,
    scope: *mut ScopeHeader,
    config: StackPoolConfig,
    stats: Arc<PoolStats>,
}

impl StackCore {
    pub(crate) fn new(config: StackPoolConfig) -> MemoryResult<Self> {
        let first = create_block(config.block_size)
            .map_err(|_| MemoryError::CannotCreatePool)?
            .as_ptr();

        let stats = Arc::new(PoolStats::default());
        stats.record_block_created();

        Ok(Self {
            first,
            current: first,
            scope: ptr::null_mut(),
            config,
            stats,
        })
    }

    pub(crate) fn stats_handle(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Hands out `size` writable bytes.
    ///
    /// Sizing order: bump from the current block's trailing space, then
    /// first-fit from the free lists, then a fresh block of
    /// `max(size + overhead, block_size)`.
    pub(crate) fn allocate(&mut self, size: usize) -> MemoryResult<NonNull<u8>> {
        if let Some(max) = self.config.max_allocation {
            if size > max {
                return Err(MemoryError::ExceedsMaxSize {
                    requested: size,
                    max,
                });
            }
        }

        let length = unit_len(size);
        let need = length + UNIT_OVERHEAD;

        // SAFETY: `current` always points to a live block owned by this
        // core; the bump is guarded by the space check.
        unsafe {
            if (*self.current).offset + need <= (*self.current).size {
                self.stats.record_allocation();
                return Ok(bump_allocate(self.current, length));
            }

            if let Some(ptr) = take_from_free_list(self.current, length) {
                self.stats.record_allocation();
                self.stats.record_free_list_hit();
                return Ok(ptr);
            }

            self.append_block(need.max(self.config.block_size))?;
            self.stats.record_allocation();
            Ok(bump_allocate(self.current, length))
        }
    }

    /// Resizes the unit behind `ptr`.
    ///
    /// Shrinking returns the same pointer (the excess stays owned by the
    /// unit). A trailing unit grows in place when the block has room;
    /// otherwise the unit is moved and its old bytes copied over.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this pool.
    pub(crate) unsafe fn reallocate(
        &mut self,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> MemoryResult<NonNull<u8>> {
        if let Some(max) = self.config.max_allocation {
            if new_size > max {
                return Err(MemoryError::ExceedsMaxSize {
                    requested: new_size,
                    max,
                });
            }
        }

        let block = self.find_owner(ptr).ok_or(MemoryError::OutOfPool)?;
        let header = ptr.as_ptr().cast::<UnitHeader>().sub(1);
        if (*header).owner != block {
            return Err(MemoryError::OutOfPool);
        }

        self.stats.record_reallocation();

        let length = (*header).length;
        if new_size <= length {
            return Ok(ptr);
        }

        let new_length = unit_len(new_size);
        let trailing = ptr.as_ptr().add(length) == payload_end(block);
        if trailing && (*block).offset + (new_length - length) <= (*block).size {
            (*block).offset += new_length - length;
            (*header).length = new_length;
            return Ok(ptr);
        }

        let fresh = self.allocate(new_size)?;
        // SAFETY: the old unit holds `length` valid bytes and the new unit
        // is at least `new_size > length` bytes; the regions are distinct
        // allocations within the pool.
        ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), length);
        self.free(ptr)?;
        Ok(fresh)
    }

    /// Releases the unit behind `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation of this pool and must not be used
    /// afterwards.
    pub(crate) unsafe fn free(&mut self, ptr: NonNull<u8>) -> MemoryResult<()> {
        let block = self.find_owner(ptr).ok_or(MemoryError::OutOfPool)?;
        let header = ptr.as_ptr().cast::<UnitHeader>().sub(1);
        if (*header).owner != block || (*block).live_units == 0 {
            return Err(MemoryError::OutOfPool);
        }

        (*block).live_units -= 1;
        self.stats.record_free();

        if (*block).live_units == 0 {
            self.release_block(block);
        } else if ptr.as_ptr().add((*header).length) == payload_end(block) {
            // Trailing unit: give the bytes straight back to the offset.
            (*block).offset -= UNIT_OVERHEAD + (*header).length;
        } else {
            push_free(header);
        }

        Ok(())
    }

    /// Opens a scope. Ending it rolls the pool back to the state it had
    /// right before this call.
    pub(crate) fn start_scope(&mut self) -> MemoryResult<()> {
        // SAFETY: `current` is live; the snapshot is taken before the
        // record allocation so the restore erases the record too.
        unsafe {
            let block = self.current;
            let saved = ScopeHeader {
                block,
                offset: (*block).offset,
                live_units: (*block).live_units,
                free_list: (*block).free_list,
                largest_free: (*block).largest_free,
                prev: self.scope,
            };

            let record = self.allocate_scope_record()?.cast::<ScopeHeader>();
            record.as_ptr().write(saved);
            self.scope = record.as_ptr();
        }
        self.stats.record_scope_opened();
        Ok(())
    }

    /// Closes the innermost scope: releases every block appended after the
    /// scope opened and restores the opening block's captured state.
    pub(crate) fn end_scope(&mut self) -> MemoryResult<()> {
        if self.scope.is_null() {
            return Err(MemoryError::NoOpenScope);
        }

        // SAFETY: the record lives at or after the captured offset, so it
        // is copied out before any memory it sits in is rolled back.
        unsafe {
            let record = self.scope.read();

            while self.current != record.block {
                let doomed = self.current;
                self.release_block(doomed);
            }

            (*self.current).offset = record.offset;
            (*self.current).live_units = record.live_units;
            (*self.current).free_list = record.free_list;
            (*self.current).largest_free = record.largest_free;
            self.scope = record.prev;
        }
        self.stats.record_scope_closed();
        Ok(())
    }

    /// Diagnostic snapshot of every block.
    pub(crate) fn report(&self) -> StackPoolReport {
        let mut blocks = Vec::new();

        // SAFETY: the chain is well formed; free lists only reference
        // records inside their own block.
        unsafe {
            let mut block = self.first;
            while !block.is_null() {
                let mut free_slots = 0;
                let mut free_bytes = 0;
                let mut entry = (*block).free_list;
                while !entry.is_null() {
                    free_slots += 1;
                    free_bytes += UNIT_OVERHEAD + (*entry).unit.length;
                    entry = (*entry).prev;
                }

                blocks.push(StackBlockReport {
                    size: (*block).size,
                    offset: (*block).offset,
                    live_units: (*block).live_units,
                    free_slots,
                    free_bytes,
                    largest_free: (*block).largest_free,
                });
                block = (*block).next;
            }
        }

        StackPoolReport { blocks }
    }

    /// Scope records bypass the free lists: they must sit at the bump
    /// frontier so the captured offset erases them on restore.
    fn allocate_scope_record(&mut self) -> MemoryResult<NonNull<u8>> {
        let length = unit_len(mem::size_of::<ScopeHeader>());
        let need = length + UNIT_OVERHEAD;

        // SAFETY: as in `allocate`; the bump is guarded by the space check.
        unsafe {
            if (*self.current).offset + need > (*self.current).size {
                self.append_block(need.max(self.config.block_size))?;
            }
            Ok(bump_allocate(self.current, length))
        }
    }

    fn append_block(&mut self, payload: usize) -> MemoryResult<()> {
        let block = create_block(payload)?.as_ptr();

        // SAFETY: `block` is detached and `current` is the chain tail.
        unsafe {
            (*block).prev = self.current;
            (*self.current).next = block;
        }
        self.current = block;
        self.stats.record_block_created();
        Ok(())
    }

    /// Detaches and destroys an empty-of-interest block, or recycles the
    /// pool's sole block to a clean state.
    ///
    /// # Safety
    ///
    /// `block` must be part of this core's chain.
    unsafe fn release_block(&mut self, block: *mut BlockHeader) {
        if self.first == self.current {
            debug_assert_eq!(block, self.first);
            (*block).offset = 0;
            (*block).live_units = 0;
            (*block).free_list = ptr::null_mut();
            (*block).largest_free = 0;
            return;
        }

        if block == self.first {
            self.first = (*block).next;
            (*self.first).prev = ptr::null_mut();
        } else if block == self.current {
            self.current = (*block).prev;
            (*self.current).next = ptr::null_mut();
        } else {
            (*(*block).prev).next = (*block).next;
            (*(*block).next).prev = (*block).prev;
        }

        tracing::trace!(payload = (*block).size, "released stack pool block");
        destroy_block(block);
        self.stats.record_block_released();
    }

    /// Best-effort owner lookup: the block whose handed-out payload range
    /// contains `ptr`. Foreign pointers fall off the end and report
    /// `OutOfPool` at the call sites.
    fn find_owner(&self, ptr: NonNull<u8>) -> Option<*mut BlockHeader> {
        let addr = ptr.as_ptr() as usize;

        // SAFETY: walking the owned chain only.
        unsafe {
            let mut block = self.current;
            while !block.is_null() {
                let base = payload_base(block) as usize;
                let end = base + (*block).offset;
                if addr >= base + UNIT_OVERHEAD && addr < end {
                    return Some(block);
                }
                block = (*block).prev;
            }
        }
        None
    }
}

impl Drop for StackCore {
    fn drop(&mut self) {
        // SAFETY: the core exclusively owns every block in its chain.
        unsafe {
            let mut block = self.first;
            while !block.is_null() {
                let next = (*block).next;
                destroy_block(block);
                block = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(block_size: usize) -> StackCore {
        StackCore::new(StackPoolConfig::new(block_size)).unwrap()
    }

    #[test]
    fn bump_then_new_block() {
        let mut core = pool(256);
        let a = core.allocate(128).unwrap();
        // 128 + overhead fits; a second 128 does not.
        let b = core.allocate(128).unwrap();
        assert_ne!(a, b);
        assert_eq!(core.report().blocks.len(), 2);
    }

    #[test]
    fn oversized_request_gets_matching_block() {
        let mut core = pool(256);
        let _ = core.allocate(1024).unwrap();
        let report = core.report();
        assert_eq!(report.blocks.len(), 2);
        assert!(report.blocks[1].size >= 1024 + UNIT_OVERHEAD);
    }

    #[test]
    fn max_allocation_cap() {
        let mut core =
            StackCore::new(StackPoolConfig::new(1024).with_max_allocation(100)).unwrap();
        assert_eq!(
            core.allocate(101),
            Err(MemoryError::ExceedsMaxSize {
                requested: 101,
                max: 100
            })
        );
        assert!(core.allocate(100).is_ok());
    }

    #[test]
    fn trailing_free_returns_to_offset() {
        let mut core = pool(1024);
        let _a = core.allocate(64).unwrap();
        let offset_after_a = core.report().blocks[0].offset;
        let b = core.allocate(64).unwrap();

        unsafe { core.free(b).unwrap() };
        let report = core.report();
        assert_eq!(report.blocks[0].offset, offset_after_a);
        assert_eq!(report.blocks[0].free_slots, 0);
    }

    #[test]
    fn interior_free_goes_to_free_list() {
        let mut core = pool(1024);
        let a = core.allocate(64).unwrap();
        let _b = core.allocate(64).unwrap();
        let offset = core.report().blocks[0].offset;

        unsafe { core.free(a).unwrap() };
        let report = core.report();
        assert_eq!(report.blocks[0].offset, offset);
        assert_eq!(report.blocks[0].free_slots, 1);
        assert_eq!(report.blocks[0].largest_free, 64);
    }

    #[test]
    fn sole_block_recycles_when_emptied() {
        let mut core = pool(1024);
        let a = core.allocate(64).unwrap();
        let b = core.allocate(64).unwrap();

        unsafe {
            core.free(a).unwrap();
            core.free(b).unwrap();
        }

        let report = core.report();
        assert_eq!(report.blocks.len(), 1);
        assert_eq!(report.blocks[0].offset, 0);
        assert_eq!(report.blocks[0].live_units, 0);
        assert_eq!(report.blocks[0].free_slots, 0);
    }

    #[test]
    fn emptied_second_block_is_released() {
        let mut core = pool(256);
        let _a = core.allocate(64).unwrap();
        let big = core.allocate(512).unwrap();
        assert_eq!(core.report().blocks.len(), 2);

        unsafe { core.free(big).unwrap() };
        assert_eq!(core.report().blocks.len(), 1);
    }

    #[test]
    fn foreign_pointer_is_rejected() {
        let mut core = pool(1024);
        let _a = core.allocate(64).unwrap();

        let mut local = 0u64;
        let foreign = NonNull::new(&mut local as *mut u64 as *mut u8).unwrap();
        unsafe {
            assert_eq!(core.free(foreign), Err(MemoryError::OutOfPool));
            assert_eq!(core.reallocate(foreign, 128), Err(MemoryError::OutOfPool));
        }
    }

    #[test]
    fn reallocate_shrink_is_identity() {
        let mut core = pool(1024);
        let a = core.allocate(128).unwrap();
        let shrunk = unsafe { core.reallocate(a, 64).unwrap() };
        assert_eq!(a, shrunk);
    }

    #[test]
    fn reallocate_trailing_grows_in_place() {
        let mut core = pool(1024);
        let _a = core.allocate(64).unwrap();
        let b = core.allocate(64).unwrap();
        let offset = core.report().blocks[0].offset;

        let grown = unsafe { core.reallocate(b, 128).unwrap() };
        assert_eq!(b, grown);
        assert_eq!(core.report().blocks[0].offset, offset + 64);
    }

    #[test]
    fn reallocate_interior_moves_and_copies() {
        let mut core = pool(1024);
        let a = core.allocate(64).unwrap();
        let _b = core.allocate(64).unwrap();

        unsafe {
            ptr::write_bytes(a.as_ptr(), 0xAB, 64);
            let moved = core.reallocate(a, 128).unwrap();
            assert_ne!(a, moved);
            for i in 0..64 {
                assert_eq!(*moved.as_ptr().add(i), 0xAB);
            }
        }
    }

    #[test]
    fn scope_roundtrip_restores_state() {
        let mut core = pool(1024);
        let _x = core.allocate(64).unwrap();
        let before = core.report();

        core.start_scope().unwrap();
        let y = core.allocate(64).unwrap();
        let _z = core.allocate(64).unwrap();
        unsafe { core.free(y).unwrap() };
        core.end_scope().unwrap();

        let after = core.report();
        assert_eq!(before.blocks.len(), after.blocks.len());
        assert_eq!(before.blocks[0].offset, after.blocks[0].offset);
        assert_eq!(before.blocks[0].live_units, after.blocks[0].live_units);
        assert_eq!(before.blocks[0].free_slots, after.blocks[0].free_slots);
    }

    #[test]
    fn nested_scopes_compose() {
        let mut core = pool(1024);
        core.start_scope().unwrap();
        let outer_offset = core.report().blocks[0].offset;

        core.start_scope().unwrap();
        let _tmp = core.allocate(64).unwrap();
        core.end_scope().unwrap();
        assert_eq!(core.report().blocks[0].offset, outer_offset);

        core.end_scope().unwrap();
        assert_eq!(core.report().blocks[0].offset, 0);
        assert_eq!(core.end_scope(), Err(MemoryError::NoOpenScope));
    }

    #[test]
    fn scope_releases_appended_blocks() {
        let mut core = pool(256);
        let _x = core.allocate(64).unwrap();

        core.start_scope().unwrap();
        let _big = core.allocate(4096).unwrap();
        assert!(core.report().blocks.len() > 1);
        core.end_scope().unwrap();

        assert_eq!(core.report().blocks.len(), 1);
    }
}
