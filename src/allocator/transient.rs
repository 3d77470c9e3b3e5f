//! Transient allocator
//!
//! Serves short-lived allocations (staging and upload buffers) without the
//! scoped allocator's nesting discipline. Sub-allocations are carved
//! bump-style out of reference-counted block records; a record is released
//! back to the block allocator once it has been finalized ("ended") and
//! its last sub-allocation is freed, in whichever order those happen.
//!
//! The one internally-synchronized strategy: a single mutex guards both
//! the allocate and free paths, so worker threads can use it without
//! external coordination.

use std::sync::Arc;

use parking_lot::Mutex;

use super::block::BlockAllocator;
use super::DeviceAllocation;
use crate::core::types::{self, AllocationKind, BLOCK_SIZE, is_valid_alignment};
use crate::error::{MemoryError, MemoryResult};

/// Minimum block count of a coarse span backing one transient record.
const MIN_TRANSIENT_BLOCKS: u32 = 2;

/// One reference-counted coarse span serving transient sub-allocations.
struct TransientRecord {
    /// The underlying block-level allocation.
    span: DeviceAllocation,
    /// Live sub-allocations carved from this record.
    live: u32,
    /// No further sub-allocations will be carved from this record.
    ended: bool,
}

#[derive(Default)]
struct TransientState {
    /// Slot arena of records; freed slots are recycled via `free_slots`.
    records: Vec<Option<TransientRecord>>,
    free_slots: Vec<u32>,
    /// Record currently open for carving, if any.
    current: Option<u32>,
    /// Bump cursor within the current record's span.
    offset: u64,
}

impl TransientState {
    fn insert(&mut self, record: TransientRecord) -> u32 {
        if let Some(slot) = self.free_slots.pop() {
            self.records[slot as usize] = Some(record);
            slot
        } else {
            self.records.push(Some(record));
            (self.records.len() - 1) as u32
        }
    }
}

/// Lock-based allocator for short-lived, independently-released
/// allocations.
pub struct TransientAllocator {
    block: Arc<BlockAllocator>,
    state: Mutex<TransientState>,
}

impl TransientAllocator {
    #[must_use]
    pub fn new(block: Arc<BlockAllocator>) -> Self {
        Self {
            block,
            state: Mutex::new(TransientState::default()),
        }
    }

    /// Allocate `size` bytes at `alignment`.
    ///
    /// Panics on usage violations; see
    /// [`try_allocate`](Self::try_allocate).
    pub fn allocate(&self, size: u64, alignment: u64) -> DeviceAllocation {
        self.try_allocate(size, alignment)
            .unwrap_or_else(|e| panic!("transient allocation failed: {e}"))
    }

    /// Allocate, surfacing contract violations as typed errors.
    ///
    /// Bumps within the current record; on overflow tries in-place growth
    /// of its span, else finalizes it and opens a new record.
    pub fn try_allocate(&self, size: u64, alignment: u64) -> MemoryResult<DeviceAllocation> {
        if size == 0 {
            return Err(MemoryError::ZeroSize);
        }
        if !is_valid_alignment(alignment) {
            return Err(MemoryError::invalid_alignment(alignment));
        }

        let mut state = self.state.lock();
        loop {
            if let Some(slot) = state.current {
                let offset = state.offset;
                let record = state.records[slot as usize]
                    .as_mut()
                    .expect("current transient record missing");

                let aligned = types::align_up(offset, alignment);
                // checked_add: a size near u64::MAX must not wrap into a
                // range that appears to fit.
                if let Some(end) = aligned.checked_add(size) {
                    if end <= record.span.size {
                        record.live += 1;
                        let handle = DeviceAllocation {
                            memory_type: record.span.memory_type,
                            kind: AllocationKind::Transient,
                            region: record.span.region,
                            offset: record.span.offset + aligned,
                            size,
                            owner: record.span.owner,
                            transient_slot: Some(slot),
                        };
                        state.offset = end;
                        return Ok(handle);
                    }

                    // A combined size past the region capacity just means
                    // the record cannot grow; a fresh record may still
                    // serve it.
                    if let Ok(needed) = types::blocks_for(end) {
                        let have = (record.span.size / BLOCK_SIZE) as u32;
                        if self.block.try_grow(&mut record.span, needed - have) {
                            continue;
                        }
                    }
                }

                // The record is full: finalize it. If nothing is live in
                // it anymore, it can be released right away.
                record.ended = true;
                let drained = record.live == 0;
                if drained {
                    self.release(&mut state, slot)?;
                }
                state.current = None;
            }

            let blocks = types::blocks_for(size)?.max(MIN_TRANSIENT_BLOCKS);
            let span = self.block.try_allocate_blocks(blocks)?;
            let slot = state.insert(TransientRecord {
                span,
                live: 0,
                ended: false,
            });
            state.current = Some(slot);
            state.offset = 0;
        }
    }

    /// Free one transient sub-allocation.
    ///
    /// Panics on usage violations; see [`try_free`](Self::try_free).
    pub fn free(&self, alloc: DeviceAllocation) {
        self.try_free(alloc)
            .unwrap_or_else(|e| panic!("transient free failed: {e}"));
    }

    /// Free, surfacing contract violations as typed errors.
    ///
    /// Decrements the owning record's live count; a finalized record whose
    /// count reaches zero is released back to the block allocator. The
    /// count can never go negative: an extra free is reported as a double
    /// free.
    pub fn try_free(&self, alloc: DeviceAllocation) -> MemoryResult<()> {
        if alloc.kind != AllocationKind::Transient || alloc.owner != self.block.id() {
            return Err(MemoryError::ForeignAllocation);
        }
        let slot = alloc.transient_slot.ok_or(MemoryError::ForeignAllocation)?;

        let mut state = self.state.lock();
        let record = state
            .records
            .get_mut(slot as usize)
            .and_then(Option::as_mut)
            .ok_or(MemoryError::double_free(alloc.offset, alloc.size))?;

        if record.live == 0 {
            return Err(MemoryError::double_free(alloc.offset, alloc.size));
        }
        record.live -= 1;

        if record.ended && record.live == 0 {
            self.release(&mut state, slot)?;
        }
        Ok(())
    }

    /// Live sub-allocations across all records.
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        let state = self.state.lock();
        state
            .records
            .iter()
            .flatten()
            .map(|r| u64::from(r.live))
            .sum()
    }

    fn release(&self, state: &mut TransientState, slot: u32) -> MemoryResult<()> {
        let record = state.records[slot as usize]
            .take()
            .expect("released transient record missing");
        debug_assert!(record.ended && record.live == 0);
        state.free_slots.push(slot);
        if state.current == Some(slot) {
            state.current = None;
        }
        self.block.try_free(record.span)
    }

    #[cfg(test)]
    pub(crate) fn record_count(&self) -> usize {
        self.state.lock().records.iter().flatten().count()
    }
}

impl Drop for TransientAllocator {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let live: u64 = state
            .records
            .iter()
            .flatten()
            .map(|r| u64::from(r.live))
            .sum();
        if live > 0 {
            if !std::thread::panicking() {
                panic!(
                    "dropping transient allocator: {}",
                    MemoryError::LiveAllocations { live }
                );
            }
            return;
        }
        for record in state.records.drain(..).flatten() {
            // Records without live sub-allocations (ended or current) go
            // back to the block allocator so its teardown sees clean masks.
            let _ = self.block.try_free(record.span);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::MemoryConfig;
    use crate::core::types::BLOCK_SIZE;
    use crate::provider::HostProvider;

    fn transient(max_region_blocks: u32) -> TransientAllocator {
        let config = MemoryConfig {
            initial_region_blocks: max_region_blocks,
            max_region_blocks,
            growth_ramp_regions: 2,
            soft_ceiling: None,
            ..Default::default()
        };
        let block = BlockAllocator::new(0, Arc::new(HostProvider::new()), config).unwrap();
        TransientAllocator::new(Arc::new(block))
    }

    #[test]
    fn test_bump_within_record() {
        let alloc = transient(8);
        let a = alloc.try_allocate(100, 1).unwrap();
        let b = alloc.try_allocate(50, 256).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 256);
        assert_eq!(a.kind(), AllocationKind::Transient);
        assert_eq!(alloc.outstanding(), 2);

        alloc.try_free(a).unwrap();
        alloc.try_free(b).unwrap();
        assert_eq!(alloc.outstanding(), 0);
    }

    #[test]
    fn test_record_released_after_end_then_frees() {
        // 2-block regions: the record can never grow in place.
        let alloc = transient(2);
        let a = alloc.try_allocate(BLOCK_SIZE, 1).unwrap();
        let b = alloc.try_allocate(BLOCK_SIZE, 1).unwrap();
        assert_eq!(alloc.record_count(), 1);

        // Overflow finalizes the first record and opens a second.
        let c = alloc.try_allocate(BLOCK_SIZE, 1).unwrap();
        assert_eq!(alloc.record_count(), 2);

        // First free keeps the ended record alive, second releases it.
        alloc.try_free(a).unwrap();
        assert_eq!(alloc.record_count(), 2);
        alloc.try_free(b).unwrap();
        assert_eq!(alloc.record_count(), 1);

        alloc.try_free(c).unwrap();
    }

    #[test]
    fn test_frees_before_end_release_on_finalize() {
        let alloc = transient(2);
        let a = alloc.try_allocate(BLOCK_SIZE, 1).unwrap();
        let b = alloc.try_allocate(BLOCK_SIZE, 1).unwrap();

        // Drain the record before it is finalized.
        alloc.try_free(a).unwrap();
        alloc.try_free(b).unwrap();
        assert_eq!(alloc.record_count(), 1);

        // The overflow that finalizes the drained record releases it
        // immediately, leaving only the fresh one.
        let c = alloc.try_allocate(BLOCK_SIZE, 1).unwrap();
        assert_eq!(alloc.record_count(), 1);
        alloc.try_free(c).unwrap();
    }

    #[test]
    fn test_grow_keeps_record_open() {
        let alloc = transient(8);
        let a = alloc.try_allocate(2 * BLOCK_SIZE, 1).unwrap();
        let b = alloc.try_allocate(BLOCK_SIZE, 1).unwrap();
        // The span grew in place: both came from the same record.
        assert_eq!(a.region(), b.region());
        assert_eq!(b.offset(), 2 * BLOCK_SIZE);
        assert_eq!(alloc.record_count(), 1);

        alloc.try_free(a).unwrap();
        alloc.try_free(b).unwrap();
    }

    #[test]
    fn test_double_free_detected() {
        let alloc = transient(8);
        let a = alloc.try_allocate(64, 1).unwrap();
        let replay = DeviceAllocation {
            memory_type: a.memory_type,
            kind: a.kind,
            region: a.region,
            offset: a.offset,
            size: a.size,
            owner: a.owner,
            transient_slot: a.transient_slot,
        };
        alloc.try_free(a).unwrap();
        assert!(matches!(
            alloc.try_free(replay),
            Err(MemoryError::DoubleFree { .. })
        ));
    }

    #[test]
    fn test_concurrent_churn() {
        let alloc = Arc::new(transient(8));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let alloc = Arc::clone(&alloc);
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let a = alloc.try_allocate(4096, 256).unwrap();
                    alloc.try_free(a).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(alloc.outstanding(), 0);
    }

    #[test]
    #[should_panic(expected = "still live")]
    fn test_drop_with_live_allocation_panics() {
        let alloc = transient(8);
        let a = alloc.try_allocate(64, 1).unwrap();
        std::mem::forget(a);
        drop(alloc);
    }
}
