//! Diagnostic snapshots of a stack pool's blocks.

use std::fmt;

/// Snapshot of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackBlockReport {
    /// Payload capacity in bytes.
    pub size: usize,
    /// Payload bytes handed out.
    pub offset: usize,
    /// Units not yet freed.
    pub live_units: usize,
    /// Entries in the free list.
    pub free_slots: usize,
    /// Bytes reclaimable from the free list, headers included.
    pub free_bytes: usize,
    /// Upper bound on the largest free slot.
    pub largest_free: usize,
}

impl StackBlockReport {
    /// Fraction of the payload handed out, in percent.
    pub fn fullness(&self) -> f64 {
        if self.size == 0 {
            0.0
        } else {
            self.offset as f64 / self.size as f64 * 100.0
        }
    }
}

/// Snapshot of a whole pool, oldest block first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackPoolReport {
    /// Per-block snapshots.
    pub blocks: Vec<StackBlockReport>,
}

impl StackPoolReport {
    /// Number of blocks in the chain.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Units not yet freed, across all blocks.
    pub fn live_units(&self) -> usize {
        self.blocks.iter().map(|b| b.live_units).sum()
    }
}

impl fmt::Display for StackPoolReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, block) in self.blocks.iter().enumerate() {
            writeln!(f, "block {}:", index + 1)?;
            writeln!(
                f,
                "  used: {:.1}% ({}/{})",
                block.fullness(),
                block.offset,
                block.size
            )?;
            writeln!(f, "  live units: {}", block.live_units)?;
            writeln!(
                f,
                "  free slots: {} ({} bytes, largest {})",
                block.free_slots, block.free_bytes, block.largest_free
            )?;
        }
        Ok(())
    }
}
