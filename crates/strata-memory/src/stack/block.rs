//! Raw block storage for the stack pools.
//!
//! # Safety
//!
//! Everything here manipulates a tagged, variable-size record layout inside
//! fixed-size heap blocks:
//! - Each block is one heap allocation: a `BlockHeader` followed by `size`
//!   payload bytes.
//! - The payload is a sequence of length-prefixed records. A LIVE record is
//!   a `UnitHeader` followed by its payload; a FREE record is the same
//!   region reinterpreted as a `FreeHeader`, which shares the
//!   `{length, owner}` prefix and stores its list link in the first bytes
//!   of the dead payload.
//!
//! ## Invariants
//!
//! - `0 <= offset <= size` for every block at every visible state.
//! - Unit lengths are multiples of [`UNIT_ALIGN`] and at least one pointer
//!   wide, so every header is naturally aligned and every freed record can
//!   hold its list link.
//! - `free_list` only chains records that lie strictly below `offset` in
//!   the same block.
//! - `largest_free` is an upper bound on the free-list slot sizes; it never
//!   shrinks between block resets, so it can only cause a wasted walk,
//!   never a missed slot.

use std::alloc::{alloc, dealloc, Layout};
use std::mem;
use std::ptr::{self, NonNull};

use crate::error::MemoryError;
use crate::utils::align_up;

/// Bookkeeping bytes that precede every live allocation.
///
/// A block must be at least `UNIT_OVERHEAD` bytes larger than the biggest
/// allocation it is expected to serve from its bump offset.
pub const UNIT_OVERHEAD: usize = mem::size_of::<UnitHeader>();

/// Alignment of every pointer the pool hands out.
pub(crate) const UNIT_ALIGN: usize = mem::align_of::<UnitHeader>();

pub(crate) const BLOCK_HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

/// Header of one pool block. The payload follows it immediately.
#[repr(C)]
pub(crate) struct BlockHeader {
    /// Older neighbour in the chain, null for the first block.
    pub prev: *mut BlockHeader,
    /// Newer neighbour in the chain, null for the current block.
    pub next: *mut BlockHeader,
    /// Payload capacity in bytes.
    pub size: usize,
    /// Payload bytes handed out so far.
    pub offset: usize,
    /// Units in this block that have not been freed.
    pub live_units: usize,
    /// Most recently freed interior record.
    pub free_list: *mut FreeHeader,
    /// Upper bound on the largest free-list slot.
    pub largest_free: usize,
}

/// Header preceding every live unit.
#[repr(C)]
pub(crate) struct UnitHeader {
    /// Usable payload length, always a multiple of [`UNIT_ALIGN`].
    pub length: usize,
    /// Block the unit resides in.
    pub owner: *mut BlockHeader,
}

/// A freed record, overlaid in place on the dead unit.
///
/// The `unit` prefix is byte-compatible with [`UnitHeader`], so flipping a
/// record FREE -> LIVE needs nothing beyond the list splice.
#[repr(C)]
pub(crate) struct FreeHeader {
    pub unit: UnitHeader,
    /// Previously freed record in the same block.
    pub prev: *mut FreeHeader,
}

/// Rounds a requested size up to the pool's allocation granularity.
///
/// The floor of one pointer guarantees a freed record can store its list
/// link; the rounding keeps every subsequent header naturally aligned.
#[inline]
pub(crate) fn unit_len(size: usize) -> usize {
    align_up(size.max(mem::size_of::<*mut FreeHeader>()), UNIT_ALIGN)
}

#[inline]
fn block_layout(payload: usize) -> Option<Layout> {
    let bytes = BLOCK_HEADER_SIZE.checked_add(payload)?;
    Layout::from_size_align(bytes, mem::align_of::<BlockHeader>()).ok()
}

/// Allocates a detached, initialized block with `payload` usable bytes.
pub(crate) fn create_block(payload: usize) -> Result<NonNull<BlockHeader>, MemoryError> {
    let layout = block_layout(payload).ok_or(MemoryError::CannotCreateBlock { size: payload })?;

    // SAFETY: the layout is non-zero sized (it always includes the header).
    let raw = unsafe { alloc(layout) }.cast::<BlockHeader>();
    let Some(block) = NonNull::new(raw) else {
        return Err(MemoryError::CannotCreateBlock { size: payload });
    };

    // SAFETY: `block` is freshly allocated with the header's layout, so it
    // is valid and properly aligned for a `BlockHeader` write.
    unsafe {
        block.as_ptr().write(BlockHeader {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            size: payload,
            offset: 0,
            live_units: 0,
            free_list: ptr::null_mut(),
            largest_free: 0,
        });
    }

    tracing::trace!(payload, "created stack pool block");
    Ok(block)
}

/// Releases a block's storage.
///
/// # Safety
///
/// `block` must come from [`create_block`], be unlinked from any chain, and
/// never be touched again.
pub(crate) unsafe fn destroy_block(block: *mut BlockHeader) {
    let bytes = BLOCK_HEADER_SIZE + (*block).size;
    // SAFETY: mirrors the layout used in `create_block`.
    dealloc(
        block.cast(),
        Layout::from_size_align_unchecked(bytes, mem::align_of::<BlockHeader>()),
    );
}

/// First payload byte of `block`.
///
/// # Safety
///
/// `block` must point to a live block.
#[inline]
pub(crate) unsafe fn payload_base(block: *mut BlockHeader) -> *mut u8 {
    block.cast::<u8>().add(BLOCK_HEADER_SIZE)
}

/// One past the last handed-out payload byte of `block`.
///
/// # Safety
///
/// `block` must point to a live block.
#[inline]
pub(crate) unsafe fn payload_end(block: *mut BlockHeader) -> *mut u8 {
    payload_base(block).add((*block).offset)
}

/// Bump-allocates a unit of `length` payload bytes from the block's offset.
///
/// # Safety
///
/// `block` must point to a live block with at least
/// `length + UNIT_OVERHEAD` bytes of trailing space, and `length` must be
/// granular per [`unit_len`].
pub(crate) unsafe fn bump_allocate(block: *mut BlockHeader, length: usize) -> NonNull<u8> {
    debug_assert!((*block).offset + length + UNIT_OVERHEAD <= (*block).size);

    let header = payload_end(block).cast::<UnitHeader>();
    header.write(UnitHeader { length, owner: block });
    (*block).offset += UNIT_OVERHEAD + length;
    (*block).live_units += 1;

    // SAFETY: the unit's payload starts right after its header and is
    // inside the block's allocation.
    NonNull::new_unchecked(header.cast::<u8>().add(UNIT_OVERHEAD))
}

/// First-fit search of the free lists, walking blocks newest to oldest and
/// slots newest to oldest within each block. A matching slot is spliced out
/// whole; remainders are never split off.
///
/// # Safety
///
/// `newest` must be the current block of a well-formed chain (or null).
pub(crate) unsafe fn take_from_free_list(
    newest: *mut BlockHeader,
    length: usize,
) -> Option<NonNull<u8>> {
    let mut block = newest;
    while !block.is_null() {
        // The hint gates the walk; it may be stale-high but never stale-low.
        if length <= (*block).largest_free {
            let mut newer: *mut FreeHeader = ptr::null_mut();
            let mut entry = (*block).free_list;
            while !entry.is_null() {
                if (*entry).unit.length >= length {
                    if newer.is_null() {
                        (*block).free_list = (*entry).prev;
                    } else {
                        (*newer).prev = (*entry).prev;
                    }
                    (*block).live_units += 1;

                    // The record keeps its full length; the requested size
                    // is simply served from it.
                    let header = entry.cast::<UnitHeader>();
                    return Some(NonNull::new_unchecked(
                        header.cast::<u8>().add(UNIT_OVERHEAD),
                    ));
                }
                newer = entry;
                entry = (*entry).prev;
            }
        }
        block = (*block).prev;
    }
    None
}

/// Returns a freed unit to its block's free list.
///
/// The list is scanned newest to oldest for a physically adjacent slot; the
/// first one found is merged with the unit (either orientation), and the
/// scan stops there. Without a neighbour the unit is pushed as the new list
/// head. The block's `largest_free` hint is raised when needed.
///
/// # Safety
///
/// `header` must point to a live unit header whose owner block is valid and
/// whose payload is no longer referenced.
pub(crate) unsafe fn push_free(header: *mut UnitHeader) {
    let block = (*header).owner;
    let unit_base = header.cast::<u8>();
    let unit_end = unit_base.add(UNIT_OVERHEAD + (*header).length);

    let mut newer: *mut FreeHeader = ptr::null_mut();
    let mut entry = (*block).free_list;
    while !entry.is_null() {
        let entry_base = entry.cast::<u8>();
        let entry_end = entry_base.add(UNIT_OVERHEAD + (*entry).unit.length);

        if unit_base == entry_end {
            // The unit sits directly after the slot: extend the slot over it.
            (*entry).unit.length += UNIT_OVERHEAD + (*header).length;
            if (*entry).unit.length > (*block).largest_free {
                (*block).largest_free = (*entry).unit.length;
            }
            return;
        }

        if entry_base == unit_end {
            // The slot sits directly after the unit: absorb it into the unit
            // and take over its place in the list.
            let merged = header.cast::<FreeHeader>();
            let absorbed = UNIT_OVERHEAD + (*entry).unit.length;
            (*merged).prev = (*entry).prev;
            (*merged).unit.length += absorbed;
            if newer.is_null() {
                (*block).free_list = merged;
            } else {
                (*newer).prev = merged;
            }
            if (*merged).unit.length > (*block).largest_free {
                (*block).largest_free = (*merged).unit.length;
            }
            return;
        }

        newer = entry;
        entry = (*entry).prev;
    }

    let slot = header.cast::<FreeHeader>();
    (*slot).prev = (*block).free_list;
    (*block).free_list = slot;
    if (*slot).unit.length > (*block).largest_free {
        (*block).largest_free = (*slot).unit.length;
    }
}
