//! Per-memory-type pool composition
//!
//! A `PoolSet` owns one block allocator, one scoped allocator, and one
//! transient allocator for a single memory-type index, plus a raw
//! pass-through path that hands provider regions out directly, bypassing
//! block accounting. Requests are routed by [`AllocationKind`].

use core::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use super::block::BlockAllocator;
use super::scoped::{Scope, ScopedAllocator};
use super::transient::TransientAllocator;
use super::{AllocatorId, DeviceAllocation, RegionId};
use crate::core::config::MemoryConfig;
use crate::core::types::{self, AllocationKind, is_valid_alignment};
use crate::error::{MemoryError, MemoryResult};
use crate::provider::{MemoryProvider, ProviderRegion};
use crate::stats::StatsSnapshot;

/// Slot arena of raw pass-through regions.
#[derive(Default)]
struct RawTable {
    regions: Vec<Option<Box<dyn ProviderRegion>>>,
    free_slots: Vec<u32>,
    live: u64,
}

impl RawTable {
    fn insert(&mut self, region: Box<dyn ProviderRegion>) -> u32 {
        self.live += 1;
        if let Some(slot) = self.free_slots.pop() {
            self.regions[slot as usize] = Some(region);
            slot
        } else {
            self.regions.push(Some(region));
            (self.regions.len() - 1) as u32
        }
    }
}

/// Composition of the allocation strategies for one memory type.
///
/// Created once per memory type at device initialization and dropped at
/// shutdown, after all allocations from it have been released.
pub struct PoolSet {
    memory_type: u32,
    id: AllocatorId,
    provider: Arc<dyn MemoryProvider>,
    config: MemoryConfig,
    block: Arc<BlockAllocator>,
    scoped: ScopedAllocator,
    transient: TransientAllocator,
    raw: Mutex<RawTable>,
}

impl PoolSet {
    /// Build the pool set for one memory-type index.
    pub fn new(
        memory_type: u32,
        provider: Arc<dyn MemoryProvider>,
        config: MemoryConfig,
    ) -> MemoryResult<Self> {
        let block = Arc::new(BlockAllocator::new(
            memory_type,
            Arc::clone(&provider),
            config.clone(),
        )?);
        Ok(Self {
            memory_type,
            id: AllocatorId::new(),
            provider,
            config,
            scoped: ScopedAllocator::new(Arc::clone(&block)),
            transient: TransientAllocator::new(Arc::clone(&block)),
            block,
            raw: Mutex::new(RawTable::default()),
        })
    }

    /// Memory-type index this pool serves.
    #[must_use]
    pub fn memory_type(&self) -> u32 {
        self.memory_type
    }

    /// Counter snapshot of the underlying block allocator.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.block.stats()
    }

    /// The scoped allocator of this pool.
    #[must_use]
    pub fn scoped(&self) -> &ScopedAllocator {
        &self.scoped
    }

    /// The transient allocator of this pool.
    #[must_use]
    pub fn transient(&self) -> &TransientAllocator {
        &self.transient
    }

    /// Open a root allocation scope on this pool's scoped allocator.
    #[must_use]
    pub fn root_scope(&self) -> Scope<'_> {
        self.scoped.root_scope()
    }

    /// Allocate `size` bytes at `alignment` with the strategy selected by
    /// `kind`.
    ///
    /// Panics on usage violations; see
    /// [`try_allocate`](Self::try_allocate).
    pub fn allocate(&self, size: u64, alignment: u64, kind: AllocationKind) -> DeviceAllocation {
        self.try_allocate(size, alignment, kind)
            .unwrap_or_else(|e| panic!("pool allocation failed: {e}"))
    }

    /// Allocate, surfacing contract violations as typed errors.
    ///
    /// Scoped requests are rejected here: they go through an explicit
    /// scope object ([`root_scope`](Self::root_scope)).
    pub fn try_allocate(
        &self,
        size: u64,
        alignment: u64,
        kind: AllocationKind,
    ) -> MemoryResult<DeviceAllocation> {
        if size == 0 {
            return Err(MemoryError::ZeroSize);
        }
        if !is_valid_alignment(alignment) {
            return Err(MemoryError::invalid_alignment(alignment));
        }

        match kind {
            AllocationKind::Raw => {
                let region = self.provider.reserve(size, self.config.mapped)?;
                let slot = self.raw.lock().insert(region);
                Ok(DeviceAllocation {
                    memory_type: self.memory_type,
                    kind: AllocationKind::Raw,
                    region: RegionId(slot),
                    offset: 0,
                    size,
                    owner: self.id,
                    transient_slot: None,
                })
            }
            AllocationKind::BlockLevel => {
                self.block.try_allocate_blocks(types::blocks_for(size)?)
            }
            AllocationKind::Transient => self.transient.try_allocate(size, alignment),
            AllocationKind::Scoped => Err(MemoryError::ScopedKindViaPool),
        }
    }

    /// Free an allocation produced by this pool.
    ///
    /// Panics on usage violations; see [`try_free`](Self::try_free).
    pub fn free(&self, alloc: DeviceAllocation) {
        self.try_free(alloc)
            .unwrap_or_else(|e| panic!("pool free failed: {e}"));
    }

    /// Free, surfacing contract violations as typed errors.
    ///
    /// Dispatches on the handle's kind. Freeing a scoped allocation is a
    /// deliberate no-op: scoped memory is reclaimed by scope rewind.
    pub fn try_free(&self, alloc: DeviceAllocation) -> MemoryResult<()> {
        if alloc.memory_type != self.memory_type {
            return Err(MemoryError::ForeignAllocation);
        }
        match alloc.kind {
            AllocationKind::Raw => {
                if alloc.owner != self.id {
                    return Err(MemoryError::ForeignAllocation);
                }
                let mut raw = self.raw.lock();
                let slot = alloc.region.0;
                let region = raw
                    .regions
                    .get_mut(slot as usize)
                    .and_then(Option::take)
                    .ok_or(MemoryError::double_free(alloc.offset, alloc.size))?;
                drop(region);
                raw.free_slots.push(slot);
                raw.live -= 1;
                Ok(())
            }
            AllocationKind::BlockLevel => self.block.try_free(alloc),
            AllocationKind::Transient => self.transient.try_free(alloc),
            AllocationKind::Scoped => {
                if alloc.owner != self.block.id() {
                    return Err(MemoryError::ForeignAllocation);
                }
                Ok(())
            }
        }
    }

    /// Host pointer to a persistently-mapped allocation.
    ///
    /// `None` if the pool is not mapped or the handle belongs elsewhere.
    #[must_use]
    pub fn mapped_ptr(&self, alloc: &DeviceAllocation) -> Option<NonNull<u8>> {
        match alloc.kind {
            AllocationKind::Raw => {
                if alloc.owner != self.id {
                    return None;
                }
                let raw = self.raw.lock();
                raw.regions
                    .get(alloc.region.0 as usize)?
                    .as_ref()?
                    .mapped_ptr()
            }
            _ => self.block.mapped_ptr(alloc),
        }
    }
}

impl Drop for PoolSet {
    fn drop(&mut self) {
        let live = self.raw.get_mut().live;
        if live > 0 && !std::thread::panicking() {
            panic!(
                "dropping pool set: {}",
                MemoryError::LiveAllocations { live }
            );
        }
    }
}
