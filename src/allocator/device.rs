//! Device allocator collection and multi-heap scope wrapper
//!
//! `DeviceAllocator` owns one [`PoolSet`] per heap (memory-type index).
//! [`DeviceScope`] fans a single logical "push a nested scope" out across
//! every heap's scoped allocator, preserving 1:1 index correspondence, so
//! callers manage one scope object per pass instead of one per heap.

use std::sync::Arc;

use super::pool_set::PoolSet;
use super::scoped::Scope;
use super::DeviceAllocation;
use crate::core::config::MemoryConfig;
use crate::core::types::AllocationKind;
use crate::error::{MemoryError, MemoryResult};
use crate::provider::MemoryProvider;

/// All memory pools of one logical device, one per heap.
///
/// Built once at device initialization from per-heap configurations and
/// never resized.
pub struct DeviceAllocator {
    pools: Vec<PoolSet>,
}

impl DeviceAllocator {
    /// Build one pool set per heap configuration, indexed in order.
    pub fn new(
        provider: Arc<dyn MemoryProvider>,
        heap_configs: Vec<MemoryConfig>,
    ) -> MemoryResult<Self> {
        let pools = heap_configs
            .into_iter()
            .enumerate()
            .map(|(index, config)| PoolSet::new(index as u32, Arc::clone(&provider), config))
            .collect::<MemoryResult<Vec<_>>>()?;
        Ok(Self { pools })
    }

    /// Number of heaps.
    #[must_use]
    pub fn heap_count(&self) -> usize {
        self.pools.len()
    }

    /// The pool set serving `heap`.
    ///
    /// Panics on an out-of-range index; see [`try_pool`](Self::try_pool).
    #[must_use]
    pub fn pool(&self, heap: usize) -> &PoolSet {
        self.try_pool(heap)
            .unwrap_or_else(|e| panic!("heap lookup failed: {e}"))
    }

    /// The pool set serving `heap`, surfacing a bad index as an error.
    pub fn try_pool(&self, heap: usize) -> MemoryResult<&PoolSet> {
        self.pools.get(heap).ok_or(MemoryError::InvalidHeap {
            heap,
            count: self.pools.len(),
        })
    }

    /// Allocate from one heap's pool set.
    pub fn try_allocate(
        &self,
        heap: usize,
        size: u64,
        alignment: u64,
        kind: AllocationKind,
    ) -> MemoryResult<DeviceAllocation> {
        self.try_pool(heap)?.try_allocate(size, alignment, kind)
    }

    /// Free through the pool set that produced the handle.
    pub fn try_free(&self, alloc: DeviceAllocation) -> MemoryResult<()> {
        let heap = alloc.memory_type() as usize;
        self.try_pool(heap)?.try_free(alloc)
    }

    /// Open a root scope spanning every heap.
    #[must_use]
    pub fn root_scope(&self) -> DeviceScope<'_> {
        DeviceScope {
            scopes: self.pools.iter().map(PoolSet::root_scope).collect(),
        }
    }
}

/// One allocation scope fanned out across all heaps.
///
/// Index `i` of this wrapper always corresponds to heap `i` of the owning
/// [`DeviceAllocator`]. Nesting and teardown follow the same LIFO borrow
/// discipline as the per-heap [`Scope`].
pub struct DeviceScope<'a> {
    scopes: Vec<Scope<'a>>,
}

impl<'a> DeviceScope<'a> {
    /// Push a nested scope on every per-heap scope simultaneously.
    #[must_use]
    pub fn push_scope(&mut self) -> DeviceScope<'_> {
        DeviceScope {
            scopes: self.scopes.iter_mut().map(Scope::push_scope).collect(),
        }
    }

    /// Number of per-heap scopes (equals the device's heap count).
    #[must_use]
    pub fn heap_count(&self) -> usize {
        self.scopes.len()
    }

    /// Bump-allocate from the scope of `heap`.
    ///
    /// Panics on usage violations; see
    /// [`try_allocate`](Self::try_allocate).
    pub fn allocate(&mut self, heap: usize, size: u64, alignment: u64) -> DeviceAllocation {
        self.try_allocate(heap, size, alignment)
            .unwrap_or_else(|e| panic!("device scope allocation failed: {e}"))
    }

    /// Bump-allocate, surfacing contract violations as typed errors.
    pub fn try_allocate(
        &mut self,
        heap: usize,
        size: u64,
        alignment: u64,
    ) -> MemoryResult<DeviceAllocation> {
        let count = self.scopes.len();
        let scope = self
            .scopes
            .get_mut(heap)
            .ok_or(MemoryError::InvalidHeap { heap, count })?;
        scope.try_allocate(size, alignment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::BLOCK_SIZE;
    use crate::provider::HostProvider;

    fn device(heaps: usize) -> DeviceAllocator {
        let config = MemoryConfig {
            initial_region_blocks: 4,
            max_region_blocks: 8,
            growth_ramp_regions: 2,
            soft_ceiling: None,
            ..Default::default()
        };
        DeviceAllocator::new(
            Arc::new(HostProvider::new()),
            vec![config; heaps],
        )
        .unwrap()
    }

    #[test]
    fn test_pools_indexed_by_memory_type() {
        let device = device(3);
        assert_eq!(device.heap_count(), 3);
        for heap in 0..3 {
            assert_eq!(device.pool(heap).memory_type(), heap as u32);
        }
        assert!(matches!(
            device.try_pool(3),
            Err(MemoryError::InvalidHeap { heap: 3, count: 3 })
        ));
    }

    #[test]
    fn test_allocate_routes_by_heap() {
        let device = device(2);
        let a = device
            .try_allocate(1, BLOCK_SIZE, 256, AllocationKind::BlockLevel)
            .unwrap();
        assert_eq!(a.memory_type(), 1);
        assert_eq!(device.pool(0).stats().allocations, 0);
        assert_eq!(device.pool(1).stats().allocations, 1);
        device.try_free(a).unwrap();
    }

    #[test]
    fn test_scope_fans_out_across_heaps() {
        let device = device(2);
        let mut frame = device.root_scope();
        assert_eq!(frame.heap_count(), 2);

        let a = frame.allocate(0, 100, 1);
        let b = frame.allocate(1, 100, 1);
        assert_eq!(a.memory_type(), 0);
        assert_eq!(b.memory_type(), 1);

        {
            let mut pass = frame.push_scope();
            // Nested scopes resume each heap where the frame left off.
            let c = pass.allocate(0, 50, 1);
            assert_eq!(c.offset(), 100);
            let d = pass.allocate(1, 50, 1);
            assert_eq!(d.offset(), 100);
        }

        // Rewind applies per heap.
        let e = frame.allocate(0, 30, 1);
        assert_eq!(e.offset(), 100);
    }

    #[test]
    fn test_out_of_range_heap_in_scope() {
        let device = device(1);
        let mut frame = device.root_scope();
        assert!(matches!(
            frame.try_allocate(1, 64, 1),
            Err(MemoryError::InvalidHeap { heap: 1, count: 1 })
        ));
    }
}
