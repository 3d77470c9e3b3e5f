//! Coarse block allocator
//!
//! Owns raw provider reservations cut into fixed-size blocks, tracked with
//! one free-mask bit per block. Serves multi-block contiguous ranges with
//! a first-fit bit scan, grows allocations in place when the following
//! blocks are free, and frees in O(1) by restoring mask bits. Regions are
//! never returned to the provider individually; they live until the
//! allocator itself is dropped.

use core::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{AllocatorId, DeviceAllocation, RegionId};
use crate::core::config::{CeilingPolicy, MemoryConfig};
use crate::core::types::{AllocationKind, BLOCK_SIZE};
use crate::error::{MemoryError, MemoryResult};
use crate::provider::{MemoryProvider, ProviderRegion};
use crate::stats::{AllocationStats, StatsSnapshot};

/// Mask of `count` contiguous set bits starting at bit 0.
fn span_mask(count: u32) -> u64 {
    debug_assert!(count >= 1 && count <= u64::BITS);
    if count == u64::BITS {
        u64::MAX
    } else {
        (1u64 << count) - 1
    }
}

/// First-fit scan: find the lowest shift at which `span` contiguous free
/// bits exist in `free_mask`, by alternately stripping used and
/// too-short-free runs with `trailing_zeros`.
fn first_fit(free_mask: u64, span: u64) -> Option<u32> {
    let mut bits = free_mask;
    let mut shift = 0u32;
    while bits != 0 {
        let used = bits.trailing_zeros();
        bits >>= used;
        shift += used;
        if bits & span == span {
            return Some(shift);
        }
        let run = (!bits).trailing_zeros();
        if run >= u64::BITS {
            return None;
        }
        bits >>= run;
        shift += run;
    }
    None
}

struct Region {
    memory: Box<dyn ProviderRegion>,
    /// Bit set = block free. Only the low `block_count` bits are ever set.
    free_mask: u64,
    block_count: u32,
}

impl Region {
    fn free_blocks(&self) -> u32 {
        self.free_mask.count_ones()
    }
}

#[derive(Default)]
struct BlockState {
    regions: Vec<Region>,
    regions_created: u32,
    reserved_bytes: u64,
    ceiling_warned: bool,
}

/// Block-granular allocator over growable coarse regions.
///
/// Shared by the scoped and transient allocators of one pool; the region
/// table sits behind a short mutex so they can pull coarse spans without
/// external coordination.
pub struct BlockAllocator {
    id: AllocatorId,
    memory_type: u32,
    provider: Arc<dyn MemoryProvider>,
    config: MemoryConfig,
    stats: AllocationStats,
    state: Mutex<BlockState>,
}

impl BlockAllocator {
    /// Create a block allocator for one memory-type index.
    pub fn new(
        memory_type: u32,
        provider: Arc<dyn MemoryProvider>,
        config: MemoryConfig,
    ) -> MemoryResult<Self> {
        config.validate()?;
        Ok(Self {
            id: AllocatorId::new(),
            memory_type,
            provider,
            config,
            stats: AllocationStats::default(),
            state: Mutex::new(BlockState::default()),
        })
    }

    /// Identity of this allocator instance.
    #[must_use]
    pub fn id(&self) -> AllocatorId {
        self.id
    }

    /// Memory-type index this allocator serves.
    #[must_use]
    pub fn memory_type(&self) -> u32 {
        self.memory_type
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Cumulative bytes reserved from the provider.
    #[must_use]
    pub fn reserved_bytes(&self) -> u64 {
        self.state.lock().reserved_bytes
    }

    /// Allocate `block_count` contiguous blocks.
    ///
    /// Panics on usage violations (zero count, count above the per-region
    /// maximum); see [`try_allocate_blocks`](Self::try_allocate_blocks)
    /// for the validating variant.
    pub fn allocate_blocks(&self, block_count: u32) -> DeviceAllocation {
        self.try_allocate_blocks(block_count)
            .unwrap_or_else(|e| panic!("block allocation failed: {e}"))
    }

    /// Allocate `block_count` contiguous blocks, surfacing contract
    /// violations as typed errors.
    ///
    /// Scans existing regions first-fit; if none can hold the span,
    /// reserves a new region sized to the larger of the request and the
    /// progressive growth target.
    pub fn try_allocate_blocks(&self, block_count: u32) -> MemoryResult<DeviceAllocation> {
        if block_count == 0 {
            return Err(MemoryError::ZeroSize);
        }
        if block_count > self.config.max_region_blocks {
            return Err(MemoryError::ExceedsRegionCapacity {
                blocks: u64::from(block_count),
                max: self.config.max_region_blocks,
            });
        }

        let span = span_mask(block_count);
        let mut state = self.state.lock();

        for (index, region) in state.regions.iter_mut().enumerate() {
            if region.free_blocks() < block_count {
                continue;
            }
            if let Some(shift) = first_fit(region.free_mask, span) {
                region.free_mask &= !(span << shift);
                self.stats.record_allocation();
                return Ok(self.handle(index, shift, block_count));
            }
        }

        let target = self.config.growth_target(state.regions_created);
        let index = self.reserve_region(&mut state, block_count.max(target))?;
        state.regions[index].free_mask &= !span;
        self.stats.record_allocation();
        Ok(self.handle(index, 0, block_count))
    }

    /// Try to extend `alloc` in place by `additional_blocks`.
    ///
    /// Succeeds iff the blocks immediately following the current span are
    /// free in the owning region; the offset never changes. Failure is an
    /// expected control-flow outcome, not an error. A zero-block growth
    /// trivially succeeds.
    pub fn try_grow(&self, alloc: &mut DeviceAllocation, additional_blocks: u32) -> bool {
        assert_eq!(
            alloc.owner, self.id,
            "grow of an allocation from a different allocator"
        );
        assert_eq!(
            alloc.kind,
            AllocationKind::BlockLevel,
            "grow of a sub-allocation handle"
        );
        if additional_blocks == 0 {
            return true;
        }

        let mut state = self.state.lock();
        let region = &mut state.regions[alloc.region.0 as usize];

        let end_block = ((alloc.offset + alloc.size) / BLOCK_SIZE) as u32;
        if end_block + additional_blocks > region.block_count {
            self.stats.record_grow(false);
            return false;
        }
        let span = span_mask(additional_blocks) << end_block;
        if region.free_mask & span != span {
            self.stats.record_grow(false);
            return false;
        }

        region.free_mask &= !span;
        alloc.size += u64::from(additional_blocks) * BLOCK_SIZE;
        self.stats.record_grow(true);
        true
    }

    /// Free a block-level allocation, restoring its mask bits.
    ///
    /// Panics on usage violations (foreign or double free); see
    /// [`try_free`](Self::try_free).
    pub fn free(&self, alloc: DeviceAllocation) {
        self.try_free(alloc)
            .unwrap_or_else(|e| panic!("block free failed: {e}"));
    }

    /// Free a block-level allocation, surfacing contract violations as
    /// typed errors.
    pub fn try_free(&self, alloc: DeviceAllocation) -> MemoryResult<()> {
        if alloc.owner != self.id || alloc.kind != AllocationKind::BlockLevel {
            return Err(MemoryError::ForeignAllocation);
        }

        let mut state = self.state.lock();
        let region = state
            .regions
            .get_mut(alloc.region.0 as usize)
            .ok_or(MemoryError::ForeignAllocation)?;

        let shift = (alloc.offset / BLOCK_SIZE) as u32;
        let count = (alloc.size / BLOCK_SIZE) as u32;
        let span = span_mask(count) << shift;
        if region.free_mask & span != 0 {
            return Err(MemoryError::double_free(alloc.offset, alloc.size));
        }

        region.free_mask |= span;
        self.stats.record_free();
        Ok(())
    }

    /// Host pointer to an allocation inside a persistently-mapped region.
    #[must_use]
    pub fn mapped_ptr(&self, alloc: &DeviceAllocation) -> Option<NonNull<u8>> {
        if alloc.owner != self.id {
            return None;
        }
        let state = self.state.lock();
        let region = state.regions.get(alloc.region.0 as usize)?;
        let base = region.memory.mapped_ptr()?;
        // SAFETY: the allocation lies within the region, so the offset
        // stays inside the mapping.
        NonNull::new(unsafe { base.as_ptr().add(alloc.offset as usize) })
    }

    fn handle(&self, region: usize, shift: u32, count: u32) -> DeviceAllocation {
        DeviceAllocation {
            memory_type: self.memory_type,
            kind: AllocationKind::BlockLevel,
            region: RegionId(region as u32),
            offset: u64::from(shift) * BLOCK_SIZE,
            size: u64::from(count) * BLOCK_SIZE,
            owner: self.id,
            transient_slot: None,
        }
    }

    /// Reserve a new coarse region of `blocks` blocks and append it.
    fn reserve_region(&self, state: &mut BlockState, blocks: u32) -> MemoryResult<usize> {
        let bytes = u64::from(blocks) * BLOCK_SIZE;

        if let Some(ceiling) = self.config.soft_ceiling {
            let total = state.reserved_bytes + bytes;
            if total > ceiling {
                match self.config.ceiling_policy {
                    CeilingPolicy::Fail => {
                        return Err(MemoryError::CeilingExceeded {
                            reserved: total,
                            ceiling,
                        });
                    }
                    CeilingPolicy::Warn => {
                        if !state.ceiling_warned {
                            state.ceiling_warned = true;
                            warn!(
                                memory_type = self.memory_type,
                                reserved = total,
                                ceiling,
                                "reserved device memory crossed the soft ceiling"
                            );
                        }
                    }
                }
            }
        }

        let memory = self.provider.reserve(bytes, self.config.mapped)?;
        debug!(
            memory_type = self.memory_type,
            blocks, bytes, "reserved new coarse region"
        );

        state.reserved_bytes += bytes;
        state.regions_created += 1;
        self.stats.record_region(bytes);
        state.regions.push(Region {
            memory,
            free_mask: span_mask(blocks),
            block_count: blocks,
        });
        Ok(state.regions.len() - 1)
    }

    #[cfg(test)]
    pub(crate) fn free_mask(&self, region: RegionId) -> u64 {
        self.state.lock().regions[region.0 as usize].free_mask
    }

    #[cfg(test)]
    pub(crate) fn region_count(&self) -> usize {
        self.state.lock().regions.len()
    }
}

impl Drop for BlockAllocator {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let leaked: u32 = state
            .regions
            .iter()
            .map(|r| r.block_count - r.free_blocks())
            .sum();
        if leaked > 0 && !std::thread::panicking() {
            panic!(
                "dropping block allocator: {}",
                MemoryError::LiveAllocations {
                    live: u64::from(leaked)
                }
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::HostProvider;

    fn allocator() -> BlockAllocator {
        let config = MemoryConfig {
            initial_region_blocks: 4,
            max_region_blocks: 16,
            growth_ramp_regions: 4,
            soft_ceiling: None,
            ..Default::default()
        };
        BlockAllocator::new(0, Arc::new(HostProvider::new()), config).unwrap()
    }

    #[test]
    fn test_first_fit_scan() {
        // Free everywhere: lands at 0.
        assert_eq!(first_fit(u64::MAX, span_mask(3)), Some(0));
        // Low blocks used, hole of 2, then free: a 3-span skips the hole.
        let mask = (u64::MAX << 8) | 0b0110_0000;
        assert_eq!(first_fit(mask, span_mask(3)), Some(8));
        assert_eq!(first_fit(mask, span_mask(2)), Some(5));
        // Nothing free.
        assert_eq!(first_fit(0, span_mask(1)), None);
        // Fragmented: no run of 4.
        assert_eq!(first_fit(0b0111_0111, span_mask(4)), None);
    }

    #[test]
    fn test_allocate_free_round_trip() {
        let alloc = allocator();
        let a = alloc.try_allocate_blocks(3).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(a.size(), 3 * BLOCK_SIZE);

        let mask_during = alloc.free_mask(RegionId(0));
        assert_eq!(mask_during, span_mask(4) & !span_mask(3));

        alloc.try_free(a).unwrap();
        assert_eq!(alloc.free_mask(RegionId(0)), span_mask(4));
    }

    #[test]
    fn test_freed_blocks_are_reused() {
        let alloc = allocator();
        let a = alloc.try_allocate_blocks(3).unwrap();
        alloc.try_free(a).unwrap();

        let b = alloc.try_allocate_blocks(1).unwrap();
        assert_eq!(b.offset(), 0);
        assert_eq!(alloc.region_count(), 1);
        alloc.try_free(b).unwrap();
    }

    #[test]
    fn test_no_fit_reserves_new_region() {
        let alloc = allocator();
        let a = alloc.try_allocate_blocks(3).unwrap();
        // First region has 4 blocks; a second 3-block span cannot fit.
        let b = alloc.try_allocate_blocks(3).unwrap();
        assert_eq!(alloc.region_count(), 2);
        assert_eq!(b.offset(), 0);
        alloc.try_free(a).unwrap();
        alloc.try_free(b).unwrap();
    }

    #[test]
    fn test_grow_in_place() {
        let alloc = allocator();
        let mut a = alloc.try_allocate_blocks(2).unwrap();

        assert!(alloc.try_grow(&mut a, 0));
        assert_eq!(a.size(), 2 * BLOCK_SIZE);

        assert!(alloc.try_grow(&mut a, 2));
        assert_eq!(a.offset(), 0);
        assert_eq!(a.size(), 4 * BLOCK_SIZE);

        // Region is now full.
        assert!(!alloc.try_grow(&mut a, 1));
        alloc.try_free(a).unwrap();
    }

    #[test]
    fn test_grow_blocked_by_neighbor() {
        let alloc = allocator();
        let mut a = alloc.try_allocate_blocks(1).unwrap();
        let b = alloc.try_allocate_blocks(1).unwrap();
        assert_eq!(b.offset(), BLOCK_SIZE);

        assert!(!alloc.try_grow(&mut a, 1));
        assert_eq!(a.size(), BLOCK_SIZE);

        alloc.try_free(b).unwrap();
        assert!(alloc.try_grow(&mut a, 1));
        alloc.try_free(a).unwrap();
    }

    #[test]
    fn test_usage_violations() {
        let alloc = allocator();
        assert_eq!(alloc.try_allocate_blocks(0), Err(MemoryError::ZeroSize));
        assert!(matches!(
            alloc.try_allocate_blocks(17),
            Err(MemoryError::ExceedsRegionCapacity { blocks: 17, max: 16 })
        ));

        let other = allocator();
        let a = alloc.try_allocate_blocks(1).unwrap();
        let err = other.try_free(a).unwrap_err();
        assert_eq!(err, MemoryError::ForeignAllocation);
        // `a` was consumed by the failed free; re-create and clean up.
        let state = alloc.free_mask(RegionId(0));
        assert_eq!(state, span_mask(4) & !1);
        let replay = DeviceAllocation {
            memory_type: 0,
            kind: AllocationKind::BlockLevel,
            region: RegionId(0),
            offset: 0,
            size: BLOCK_SIZE,
            owner: alloc.id(),
            transient_slot: None,
        };
        alloc.try_free(replay).unwrap();
    }

    #[test]
    fn test_double_free_detected() {
        let alloc = allocator();
        let a = alloc.try_allocate_blocks(2).unwrap();
        let replay = DeviceAllocation {
            memory_type: 0,
            kind: AllocationKind::BlockLevel,
            region: a.region,
            offset: a.offset,
            size: a.size,
            owner: alloc.id(),
            transient_slot: None,
        };
        alloc.try_free(a).unwrap();
        assert!(matches!(
            alloc.try_free(replay),
            Err(MemoryError::DoubleFree { .. })
        ));
    }

    #[test]
    fn test_ceiling_fail_policy() {
        let config = MemoryConfig {
            initial_region_blocks: 4,
            max_region_blocks: 8,
            growth_ramp_regions: 2,
            soft_ceiling: Some(4 * BLOCK_SIZE),
            ceiling_policy: CeilingPolicy::Fail,
            mapped: false,
        };
        let alloc = BlockAllocator::new(0, Arc::new(HostProvider::new()), config).unwrap();

        let a = alloc.try_allocate_blocks(4).unwrap();
        let err = alloc.try_allocate_blocks(4).unwrap_err();
        assert!(matches!(err, MemoryError::CeilingExceeded { .. }));
        alloc.try_free(a).unwrap();
    }

    #[test]
    fn test_growth_ramp_sizes_regions() {
        let config = MemoryConfig {
            initial_region_blocks: 2,
            max_region_blocks: 8,
            growth_ramp_regions: 2,
            soft_ceiling: None,
            ..Default::default()
        };
        let alloc = BlockAllocator::new(0, Arc::new(HostProvider::new()), config).unwrap();

        // Each 2-block request fills the current region entirely, forcing
        // a fresh region per request: 2, then 5, then 8 blocks.
        let a = alloc.try_allocate_blocks(2).unwrap();
        let b = alloc.try_allocate_blocks(3).unwrap();
        let c = alloc.try_allocate_blocks(6).unwrap();
        assert_eq!(alloc.region_count(), 3);
        assert_eq!(
            alloc.reserved_bytes(),
            (2 + 5 + 8) * BLOCK_SIZE
        );
        alloc.try_free(a).unwrap();
        alloc.try_free(b).unwrap();
        alloc.try_free(c).unwrap();
    }

    #[test]
    fn test_mapped_ptr() {
        let config = MemoryConfig {
            soft_ceiling: None,
            mapped: true,
            ..Default::default()
        };
        let alloc = BlockAllocator::new(0, Arc::new(HostProvider::new()), config).unwrap();
        let a = alloc.try_allocate_blocks(1).unwrap();
        let b = alloc.try_allocate_blocks(1).unwrap();

        let pa = alloc.mapped_ptr(&a).unwrap();
        let pb = alloc.mapped_ptr(&b).unwrap();
        assert_eq!(
            pb.as_ptr() as usize - pa.as_ptr() as usize,
            BLOCK_SIZE as usize
        );

        alloc.try_free(a).unwrap();
        alloc.try_free(b).unwrap();
    }

    #[test]
    #[should_panic(expected = "still live")]
    fn test_drop_with_live_allocation_panics() {
        let alloc = allocator();
        let a = alloc.try_allocate_blocks(1).unwrap();
        std::mem::forget(a);
        drop(alloc);
    }
}
