//! The segregated pool engine shared by all three concurrency variants.
//!
//! # Safety
//!
//! A segregated pool is a chain of equally sized blocks, each a single heap
//! allocation of `items_per_block` fixed-size slots, plus one pool-wide
//! free list threaded through the freed slots themselves.
//!
//! ## Invariants
//!
//! - Every block has the same payload size; `offset` advances in whole
//!   strides and never exceeds the payload size.
//! - The free list only links slot bases that were previously handed out.
//! - Slots never move: a pointer stays valid until freed.

use std::alloc::{alloc, dealloc, Layout};
use std::fmt;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use super::SegregatedPoolConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::stats::PoolStats;
use crate::utils::align_up;

pub(crate) const SEG_BLOCK_HEADER_SIZE: usize = mem::size_of::<SegBlockHeader>();

/// Minimum alignment and granularity of a slot; a freed slot must be able
/// to hold its list link.
pub(crate) const SLOT_ALIGN: usize = mem::align_of::<FreeSlot>();

/// Header of one segregated block. The slot array follows it immediately.
#[repr(C)]
pub(crate) struct SegBlockHeader {
    pub prev: *mut SegBlockHeader,
    pub next: *mut SegBlockHeader,
    /// Payload bytes handed out, always a multiple of the stride.
    pub offset: usize,
}

/// A freed slot, overlaid on the slot base.
#[repr(C)]
pub(crate) struct FreeSlot {
    /// Previously freed slot, anywhere in the pool.
    pub prev: *mut FreeSlot,
}

/// Rounds an item size up to the slot granularity.
#[inline]
pub(crate) fn slot_len(item_size: usize) -> usize {
    align_up(item_size.max(mem::size_of::<FreeSlot>()), SLOT_ALIGN)
}

/// Engine state of one segregated pool.
pub(crate) struct SegregatedCore {
    first: *mut SegBlockHeader,
    current: *mut SegBlockHeader,
    free_list: *mut FreeSlot,
    /// Bytes consumed per slot, any per-slot header included.
    stride: usize,
    /// Payload capacity of every block.
    block_payload: usize,
    config: SegregatedPoolConfig,
    stats: Arc<PoolStats>,
}

impl SegregatedCore {
    /// `slot_overhead` is the per-slot header size a variant prepends to
    /// each item (zero for the raw shapes).
    pub(crate) fn new(
        config: SegregatedPoolConfig,
        slot_overhead: usize,
    ) -> MemoryResult<Self> {
        let stride = slot_overhead + slot_len(config.item_size);
        let block_payload = stride
            .checked_mul(config.items_per_block)
            .filter(|&payload| payload > 0)
            .ok_or(MemoryError::CannotCreatePool)?;

        let first = create_block(block_payload)
            .map_err(|_| MemoryError::CannotCreatePool)?
            .as_ptr();

        let stats = Arc::new(PoolStats::default());
        stats.record_block_created();

        Ok(Self {
            first,
            current: first,
            free_list: ptr::null_mut(),
            stride,
            block_payload,
            config,
            stats,
        })
    }

    pub(crate) fn config(&self) -> &SegregatedPoolConfig {
        &self.config
    }

    pub(crate) fn stats_handle(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Hands out one slot base: most recently freed slot first, then the
    /// current block's tail, then a fresh block.
    pub(crate) fn allocate_slot(&mut self) -> MemoryResult<NonNull<u8>> {
        // SAFETY: the free list only holds slot bases this core handed out;
        // `current` is a live block and the bump is guarded by the space
        // check.
        unsafe {
            if !self.free_list.is_null() {
                let slot = self.free_list;
                self.free_list = (*slot).prev;
                self.stats.record_allocation();
                self.stats.record_free_list_hit();
                return Ok(NonNull::new_unchecked(slot.cast()));
            }

            if (*self.current).offset + self.stride <= self.block_payload {
                let slot = payload_base(self.current).add((*self.current).offset);
                (*self.current).offset += self.stride;
                self.stats.record_allocation();
                return Ok(NonNull::new_unchecked(slot));
            }

            self.append_block()?;
            let slot = payload_base(self.current);
            (*self.current).offset = self.stride;
            self.stats.record_allocation();
            Ok(NonNull::new_unchecked(slot))
        }
    }

    /// Pushes a slot base onto the free list (LIFO).
    ///
    /// # Safety
    ///
    /// `base` must be a slot base previously returned by
    /// [`allocate_slot`](Self::allocate_slot) and not currently free.
    pub(crate) unsafe fn free_slot(&mut self, base: NonNull<u8>) {
        let slot = base.cast::<FreeSlot>().as_ptr();
        (*slot).prev = self.free_list;
        self.free_list = slot;
        self.stats.record_free();
    }

    /// Best-effort membership test for a slot base: inside some block's
    /// handed-out range and on a stride boundary.
    pub(crate) fn contains_slot(&self, base: NonNull<u8>) -> bool {
        let addr = base.as_ptr() as usize;

        // SAFETY: walking the owned chain only.
        unsafe {
            let mut block = self.current;
            while !block.is_null() {
                let start = payload_base(block) as usize;
                if addr >= start && addr < start + (*block).offset {
                    return (addr - start) % self.stride == 0;
                }
                block = (*block).prev;
            }
        }
        false
    }

    /// Diagnostic snapshot.
    pub(crate) fn report(&self) -> SegregatedPoolReport {
        let mut blocks = Vec::new();
        let mut free_slots = 0;

        // SAFETY: walking the owned chain and free list only.
        unsafe {
            let mut block = self.first;
            while !block.is_null() {
                blocks.push(SegregatedBlockReport {
                    slots_handed_out: (*block).offset / self.stride,
                    capacity: self.config.items_per_block,
                });
                block = (*block).next;
            }

            let mut slot = self.free_list;
            while !slot.is_null() {
                free_slots += 1;
                slot = (*slot).prev;
            }
        }

        SegregatedPoolReport {
            item_size: self.config.item_size,
            blocks,
            free_slots,
        }
    }

    fn append_block(&mut self) -> MemoryResult<()> {
        let block = create_block(self.block_payload)?.as_ptr();

        // SAFETY: `block` is detached and `current` is the chain tail.
        unsafe {
            (*block).prev = self.current;
            (*self.current).next = block;
        }
        self.current = block;
        self.stats.record_block_created();
        tracing::trace!(payload = self.block_payload, "appended segregated block");
        Ok(())
    }
}

impl Drop for SegregatedCore {
    fn drop(&mut self) {
        // SAFETY: the core exclusively owns every block in its chain.
        unsafe {
            let mut block = self.first;
            while !block.is_null() {
                let next = (*block).next;
                destroy_block(block, self.block_payload);
                block = next;
            }
        }
    }
}

#[inline]
fn block_layout(payload: usize) -> Option<Layout> {
    let bytes = SEG_BLOCK_HEADER_SIZE.checked_add(payload)?;
    Layout::from_size_align(bytes, mem::align_of::<SegBlockHeader>()).ok()
}

fn create_block(payload: usize) -> Result<NonNull<SegBlockHeader>, MemoryError> {
    let layout = block_layout(payload).ok_or(MemoryError::CannotCreateBlock { size: payload })?;

    // SAFETY: the layout is non-zero sized (it always includes the header).
    let raw = unsafe { alloc(layout) }.cast::<SegBlockHeader>();
    let Some(block) = NonNull::new(raw) else {
        return Err(MemoryError::CannotCreateBlock { size: payload });
    };

    // SAFETY: freshly allocated with the header's layout.
    unsafe {
        block.as_ptr().write(SegBlockHeader {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            offset: 0,
        });
    }
    Ok(block)
}

/// # Safety
///
/// `block` must come from [`create_block`] with the same `payload`, be
/// unlinked, and never be touched again.
unsafe fn destroy_block(block: *mut SegBlockHeader, payload: usize) {
    let bytes = SEG_BLOCK_HEADER_SIZE + payload;
    // SAFETY: mirrors the layout used in `create_block`.
    dealloc(
        block.cast(),
        Layout::from_size_align_unchecked(bytes, mem::align_of::<SegBlockHeader>()),
    );
}

/// # Safety
///
/// `block` must point to a live block.
#[inline]
unsafe fn payload_base(block: *mut SegBlockHeader) -> *mut u8 {
    block.cast::<u8>().add(SEG_BLOCK_HEADER_SIZE)
}

/// Snapshot of one segregated block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegregatedBlockReport {
    /// Slots handed out from this block's tail (freed ones included).
    pub slots_handed_out: usize,
    /// Slot capacity of the block.
    pub capacity: usize,
}

/// Snapshot of a segregated pool, oldest block first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegregatedPoolReport {
    /// Configured item size.
    pub item_size: usize,
    /// Per-block snapshots.
    pub blocks: Vec<SegregatedBlockReport>,
    /// Slots currently in the free list.
    pub free_slots: usize,
}

impl SegregatedPoolReport {
    /// Number of blocks in the chain.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Slots handed out and not yet freed.
    pub fn live_slots(&self) -> usize {
        let handed_out: usize = self.blocks.iter().map(|b| b.slots_handed_out).sum();
        handed_out - self.free_slots
    }
}

impl fmt::Display for SegregatedPoolReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "item size: {}", self.item_size)?;
        for (index, block) in self.blocks.iter().enumerate() {
            writeln!(
                f,
                "block {}: {}/{} slots",
                index + 1,
                block.slots_handed_out,
                block.capacity
            )?;
        }
        writeln!(f, "free slots: {}", self.free_slots)
    }
}
