//! Allocation strategies
//!
//! Leaf-first: the block allocator owns coarse regions and serves
//! multi-block ranges; the scoped and transient allocators carve bump
//! allocations out of coarse spans they pull from it; the pool set
//! composes all three per memory type, and the device allocator fans a
//! single scope stack out across every heap.

use core::num::NonZeroUsize;
use core::sync::atomic::{AtomicUsize, Ordering};

pub mod block;
pub mod device;
pub mod pool_set;
pub mod scoped;
pub mod transient;

pub use block::BlockAllocator;
pub use device::{DeviceAllocator, DeviceScope};
pub use pool_set::PoolSet;
pub use scoped::{Scope, ScopedAllocator};
pub use transient::TransientAllocator;

use crate::core::types::AllocationKind;

// ============================================================================
// Allocator identity
// ============================================================================

/// Process-unique identifier of an allocator instance.
///
/// Every allocation handle records the ID of the allocator that produced
/// it; freeing through any other instance is a usage violation. Uses
/// `NonZeroUsize` so `Option<AllocatorId>` costs nothing extra.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocatorId(NonZeroUsize);

impl AllocatorId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicUsize = AtomicUsize::new(1);
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        // COUNTER starts at 1 and only increments; wrapping would take
        // 2^64 allocator creations.
        Self(NonZeroUsize::new(id).expect("allocator id counter wrapped"))
    }
}

// ============================================================================
// Region and allocation handles
// ============================================================================

/// Index of a coarse region inside its owning allocator's region table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(pub(crate) u32);

/// Handle to one granted sub-range of device memory.
///
/// Exclusively held by the requester until freed through the pool (or
/// allocator) that produced it; deliberately neither `Clone` nor `Copy`.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "dropping the handle leaks the allocation; free it through its pool"]
pub struct DeviceAllocation {
    pub(crate) memory_type: u32,
    pub(crate) kind: AllocationKind,
    pub(crate) region: RegionId,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) owner: AllocatorId,
    /// Slot of the owning transient block record, for transient handles.
    pub(crate) transient_slot: Option<u32>,
}

impl DeviceAllocation {
    /// Memory-type index this allocation was served from.
    #[must_use]
    pub fn memory_type(&self) -> u32 {
        self.memory_type
    }

    /// Strategy that served this allocation.
    #[must_use]
    pub fn kind(&self) -> AllocationKind {
        self.kind
    }

    /// Coarse region the allocation lives in.
    #[must_use]
    pub fn region(&self) -> RegionId {
        self.region
    }

    /// Byte offset within the coarse region.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Byte size of the granted range.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}
