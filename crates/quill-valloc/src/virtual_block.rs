use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use range_alloc::RangeAllocator;
use thiserror::Error;

use crate::align::{align_up, is_power_of_two};

static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VirtualBlockError {
    #[error("allocation size must be non-zero")]
    ZeroSize,
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(u64),
    #[error(
        "virtual block out of space: requested {requested} bytes (alignment {alignment}), {free} bytes free, largest free range {largest_free_range} bytes"
    )]
    OutOfSpace {
        requested: u64,
        alignment: u64,
        free: u64,
        largest_free_range: u64,
    },
    #[error("allocation at offset {offset} (size {size}) does not belong to this block")]
    UnknownAllocation { offset: u64, size: u64 },
}

/// A live range inside a [`VirtualBlock`].
///
/// The token is intentionally not `Clone`: the only way to release the range
/// is to hand the token back to [`VirtualBlock::free`], which consumes it.
#[derive(PartialEq, Eq)]
pub struct VirtualAllocation {
    block_id: u64,
    offset: u64,
    size: u64,
}

impl VirtualAllocation {
    /// Byte offset from the start of the block.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// One past the last byte covered by this allocation.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

impl fmt::Debug for VirtualAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualAllocation")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

/// Occupancy snapshot of a [`VirtualBlock`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockStatistics {
    pub allocation_count: usize,
    pub allocation_bytes: u64,
    pub block_bytes: u64,
    pub free_range_count: usize,
    pub largest_free_range: u64,
}

impl BlockStatistics {
    pub fn free_bytes(&self) -> u64 {
        self.block_bytes - self.allocation_bytes
    }
}

/// Address-space-only allocator for a fixed-capacity region.
///
/// Free space is kept by a [`RangeAllocator`], which places best-fit and
/// merges neighbouring free ranges on release, so a block that had every
/// allocation released always collapses back to a single free range. An
/// aligned request that does not land on its alignment is retried with
/// enough slack to align it, and the slack on either side goes straight back
/// to the free list.
pub struct VirtualBlock {
    id: u64,
    capacity: u64,
    ranges: RangeAllocator<u64>,
    allocations: HashMap<u64, u64>,
    allocated_bytes: u64,
}

impl VirtualBlock {
    pub fn new(capacity: u64) -> Self {
        Self {
            id: NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed),
            capacity,
            ranges: RangeAllocator::new(0..capacity),
            allocations: HashMap::new(),
            allocated_bytes: 0,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// `true` when no allocation is live.
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Drop every allocation and return the block to a single free range.
    ///
    /// Tokens handed out before the call are no longer recognised; freeing
    /// them afterwards reports [`VirtualBlockError::UnknownAllocation`] even
    /// when a newer allocation sits at the same offset.
    pub fn clear(&mut self) {
        self.id = NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed);
        self.ranges.reset();
        self.allocations.clear();
        self.allocated_bytes = 0;
    }

    pub fn allocate(
        &mut self,
        size: u64,
        alignment: u64,
    ) -> Result<VirtualAllocation, VirtualBlockError> {
        if size == 0 {
            return Err(VirtualBlockError::ZeroSize);
        }
        let alignment = alignment.max(1);
        if !is_power_of_two(alignment) {
            return Err(VirtualBlockError::InvalidAlignment(alignment));
        }

        let offset = self
            .place(size, alignment)
            .ok_or_else(|| self.out_of_space(size, alignment))?;

        self.allocations.insert(offset, size);
        self.allocated_bytes += size;

        Ok(VirtualAllocation {
            block_id: self.id,
            offset,
            size,
        })
    }

    pub fn free(&mut self, allocation: VirtualAllocation) -> Result<(), VirtualBlockError> {
        let unknown = VirtualBlockError::UnknownAllocation {
            offset: allocation.offset,
            size: allocation.size,
        };
        if allocation.block_id != self.id {
            return Err(unknown);
        }
        match self.allocations.get(&allocation.offset) {
            Some(&size) if size == allocation.size => {}
            _ => return Err(unknown),
        }
        self.allocations.remove(&allocation.offset);
        self.allocated_bytes -= allocation.size;
        self.ranges.free_range(allocation.offset..allocation.end());
        Ok(())
    }

    pub fn statistics(&self) -> BlockStatistics {
        let mut free_range_count = 0;
        let mut largest_free_range = 0;
        for gap in self.free_ranges() {
            free_range_count += 1;
            largest_free_range = largest_free_range.max(gap.end - gap.start);
        }
        BlockStatistics {
            allocation_count: self.allocations.len(),
            allocation_bytes: self.allocated_bytes,
            block_bytes: self.capacity,
            free_range_count,
            largest_free_range,
        }
    }

    /// Offset of a fresh `size`-byte range aligned to `alignment`, already
    /// taken out of the free list.
    fn place(&mut self, size: u64, alignment: u64) -> Option<u64> {
        if size > self.capacity {
            return None;
        }
        if let Ok(range) = self.ranges.allocate_range(size) {
            if range.start % alignment == 0 {
                return Some(range.start);
            }
            self.ranges.free_range(range);
        }

        let padded = size.checked_add(alignment - 1)?;
        if padded > self.capacity {
            return None;
        }
        let range = self.ranges.allocate_range(padded).ok()?;
        let offset = align_up(range.start, alignment);
        if offset > range.start {
            self.ranges.free_range(range.start..offset);
        }
        if offset + size < range.end {
            self.ranges.free_range(offset + size..range.end);
        }
        Some(offset)
    }

    fn out_of_space(&self, size: u64, alignment: u64) -> VirtualBlockError {
        let stats = self.statistics();
        VirtualBlockError::OutOfSpace {
            requested: size,
            alignment,
            free: stats.free_bytes(),
            largest_free_range: stats.largest_free_range,
        }
    }

    /// Gaps between live allocations, in address order.
    fn free_ranges(&self) -> Vec<Range<u64>> {
        let mut live: Vec<(u64, u64)> = self
            .allocations
            .iter()
            .map(|(&offset, &size)| (offset, offset + size))
            .collect();
        live.sort_unstable();

        let mut gaps = Vec::new();
        let mut cursor = 0;
        for (start, end) in live {
            if start > cursor {
                gaps.push(cursor..start);
            }
            cursor = end;
        }
        if cursor < self.capacity {
            gaps.push(cursor..self.capacity);
        }
        gaps
    }
}

impl fmt::Debug for VirtualBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.statistics();
        f.debug_struct("VirtualBlock")
            .field("capacity", &self.capacity)
            .field("allocation_count", &stats.allocation_count)
            .field("allocation_bytes", &stats.allocation_bytes)
            .field("free_range_count", &stats.free_range_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_respect_alignment() {
        let mut block = VirtualBlock::new(4096);

        let a = block.allocate(10, 1).unwrap();
        assert_eq!(a.offset(), 0);

        let b = block.allocate(16, 256).unwrap();
        assert_eq!(b.offset(), 256);

        // The 246 bytes of padding in front of `b` are still usable.
        let c = block.allocate(200, 4).unwrap();
        assert_eq!(c.offset(), 12);

        let stats = block.statistics();
        assert_eq!(stats.allocation_count, 3);
        assert_eq!(stats.allocation_bytes, 226);
    }

    #[test]
    fn exhaustion_reports_free_space() {
        let mut block = VirtualBlock::new(1024);
        let _a = block.allocate(1000, 1).unwrap();

        let err = block.allocate(100, 1).unwrap_err();
        assert_eq!(
            err,
            VirtualBlockError::OutOfSpace {
                requested: 100,
                alignment: 1,
                free: 24,
                largest_free_range: 24,
            }
        );
    }

    #[test]
    fn freeing_everything_coalesces_to_one_range() {
        let mut block = VirtualBlock::new(1024);
        let a = block.allocate(100, 1).unwrap();
        let b = block.allocate(100, 1).unwrap();
        let c = block.allocate(100, 1).unwrap();

        block.free(b).unwrap();
        assert_eq!(block.statistics().free_range_count, 2);

        block.free(a).unwrap();
        block.free(c).unwrap();

        let stats = block.statistics();
        assert!(block.is_empty());
        assert_eq!(stats.free_range_count, 1);
        assert_eq!(stats.largest_free_range, 1024);
    }

    #[test]
    fn best_fit_prefers_the_smallest_hole() {
        let mut block = VirtualBlock::new(1000);
        let a = block.allocate(300, 1).unwrap();
        let _b = block.allocate(10, 1).unwrap();
        let c = block.allocate(50, 1).unwrap();
        let _d = block.allocate(10, 1).unwrap();

        block.free(a).unwrap();
        block.free(c).unwrap();

        // Holes: [0, 300) and [310, 360), plus the tail. 40 bytes fits the 50-byte hole best.
        let e = block.allocate(40, 1).unwrap();
        assert_eq!(e.offset(), 310);
    }

    #[test]
    fn foreign_tokens_are_rejected() {
        let mut a = VirtualBlock::new(256);
        let mut b = VirtualBlock::new(256);

        let token = a.allocate(16, 1).unwrap();
        let err = b.free(token).unwrap_err();
        assert_eq!(
            err,
            VirtualBlockError::UnknownAllocation { offset: 0, size: 16 }
        );
        // `a` still tracks the allocation.
        assert_eq!(a.statistics().allocation_count, 1);
    }

    #[test]
    fn clear_invalidates_outstanding_tokens() {
        let mut block = VirtualBlock::new(256);
        let stale = block.allocate(64, 1).unwrap();
        block.clear();
        assert!(block.is_empty());

        // The fresh allocation lands where the stale one was.
        let live = block.allocate(64, 1).unwrap();
        assert_eq!(live.offset(), stale.offset());

        assert_eq!(
            block.free(stale).unwrap_err(),
            VirtualBlockError::UnknownAllocation { offset: 0, size: 64 }
        );
        assert_eq!(block.statistics().allocation_count, 1);
        block.free(live).unwrap();
        assert!(block.is_empty());
    }

    #[test]
    fn aligned_allocation_can_fill_the_whole_block() {
        let mut block = VirtualBlock::new(64 * 1024);
        let whole = block.allocate(64 * 1024, 64 * 1024).unwrap();
        assert_eq!(whole.offset(), 0);
        assert_eq!(block.statistics().free_range_count, 0);
        block.free(whole).unwrap();
        assert_eq!(block.statistics().largest_free_range, 64 * 1024);
    }

    #[test]
    fn alignment_slack_is_returned_to_the_free_list() {
        let mut block = VirtualBlock::new(1024);
        let _head = block.allocate(8, 1).unwrap();
        let aligned = block.allocate(100, 512).unwrap();
        assert_eq!(aligned.offset(), 512);

        let stats = block.statistics();
        assert_eq!(stats.free_bytes(), 1024 - 108);
        // [8, 512) and [612, 1024).
        assert_eq!(stats.free_range_count, 2);
        assert_eq!(stats.largest_free_range, 504);
    }

    #[test]
    fn rejects_zero_size_and_bad_alignment() {
        let mut block = VirtualBlock::new(256);
        assert_eq!(block.allocate(0, 1).unwrap_err(), VirtualBlockError::ZeroSize);
        assert_eq!(
            block.allocate(8, 3).unwrap_err(),
            VirtualBlockError::InvalidAlignment(3)
        );
    }
}
