//! Common types and constants for device-memory management

use crate::error::{MemoryError, MemoryResult};

/// Fixed size of one block, the minimum granularity of coarse allocation.
///
/// Coarse regions are subdivided into blocks of this size and tracked with
/// one free-mask bit per block.
pub const BLOCK_SIZE: u64 = 8 * 1024 * 1024;

/// Maximum number of blocks in one coarse region (one `u64` free mask).
pub const MAX_BLOCKS_PER_REGION: u32 = u64::BITS;

/// Strategy selector for an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationKind {
    /// Pass-through to the backing provider, bypassing block accounting.
    /// For very large or provider-special allocations.
    Raw,
    /// Multi-block contiguous range served by the block allocator.
    BlockLevel,
    /// Bump allocation inside a LIFO scope stack; freed by scope rewind.
    Scoped,
    /// Short-lived allocation from a reference-counted bump block.
    Transient,
}

/// Check that an alignment is usable against the fixed block size:
/// non-zero, an even divisor of [`BLOCK_SIZE`], and not larger than it.
#[must_use]
pub fn is_valid_alignment(alignment: u64) -> bool {
    alignment != 0 && alignment <= BLOCK_SIZE && BLOCK_SIZE % alignment == 0
}

/// Round `value` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two (every divisor of the power-of-two
/// block size is).
#[inline]
#[must_use]
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Number of whole blocks needed to cover `bytes`.
///
/// Requests that would need more blocks than one region can hold are
/// usage violations; this is where byte counts too large for a `u32`
/// block count get rejected instead of truncated.
#[inline]
pub(crate) fn blocks_for(bytes: u64) -> MemoryResult<u32> {
    debug_assert!(bytes > 0);
    let blocks = bytes.div_ceil(BLOCK_SIZE);
    if blocks > u64::from(MAX_BLOCKS_PER_REGION) {
        return Err(MemoryError::ExceedsRegionCapacity {
            blocks,
            max: MAX_BLOCKS_PER_REGION,
        });
    }
    Ok(blocks as u32)
}
