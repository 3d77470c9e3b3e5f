//! Scoped bump allocator
//!
//! Serves frame- and pass-local allocations from a strict LIFO stack of
//! scopes. A scope bump-allocates inside coarse spans pulled from the
//! block allocator; nothing is freed individually. Memory is reused by
//! rewinding to a parent scope's cursor once a child is dropped, and by
//! the next root scope restarting from the front of the span list.
//!
//! The scope stack is expressed through the borrow checker rather than a
//! thread-local cursor: [`Scope::push_scope`] mutably borrows the parent,
//! so a scope with a live child cannot allocate and scopes unwind in LIFO
//! order by construction.

use core::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

use super::block::BlockAllocator;
use super::{DeviceAllocation, RegionId};
use crate::core::types::{self, AllocationKind, BLOCK_SIZE, is_valid_alignment};
use crate::error::{MemoryError, MemoryResult};

/// Minimum block count of a coarse span pulled for scope allocations.
/// Sized generously so consecutive small scopes rarely touch the block
/// allocator.
const MIN_SCOPE_BLOCKS: u32 = 2;

#[derive(Default)]
struct ScopedState {
    /// Coarse spans pulled from the block allocator, in pull order.
    /// Returned only when the allocator is dropped.
    spans: Vec<DeviceAllocation>,
}

/// Bump allocator with LIFO scope discipline and aggressive cross-frame
/// reuse.
pub struct ScopedAllocator {
    block: Arc<BlockAllocator>,
    state: Mutex<ScopedState>,
}

impl ScopedAllocator {
    #[must_use]
    pub fn new(block: Arc<BlockAllocator>) -> Self {
        Self {
            block,
            state: Mutex::new(ScopedState::default()),
        }
    }

    /// Open a root scope. The cursor starts at the front of the span
    /// list, reusing everything previous root scopes bump-allocated.
    ///
    /// Root scopes taken on different threads may legitimately overlap in
    /// address space; callers guarantee they are disjoint in usage time.
    #[must_use]
    pub fn root_scope(&self) -> Scope<'_> {
        Scope {
            alloc: self,
            span_index: 0,
            offset: 0,
            _not_send: PhantomData,
        }
    }

    #[cfg(test)]
    pub(crate) fn span_count(&self) -> usize {
        self.state.lock().spans.len()
    }
}

impl Drop for ScopedAllocator {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for span in state.spans.drain(..) {
            if let Err(e) = self.block.try_free(span) {
                error!("failed to return scoped span to the block allocator: {e}");
            }
        }
    }
}

/// One nested allocation context.
///
/// Holds the bump cursor (span index + byte offset). Pushing a child
/// copies the cursor into it and mutably borrows the parent for the
/// child's lifetime; dropping the child leaves the parent's cursor where
/// it was, which is exactly the rewind the reuse discipline relies on.
///
/// `Scope` is `!Send`: a scope chain belongs to one thread.
pub struct Scope<'a> {
    alloc: &'a ScopedAllocator,
    span_index: usize,
    offset: u64,
    _not_send: PhantomData<*const ()>,
}

impl<'a> Scope<'a> {
    /// Push a nested scope that starts allocating exactly where this
    /// scope left off. While the child is alive, this scope cannot
    /// allocate (enforced at compile time by the mutable borrow).
    #[must_use]
    pub fn push_scope(&mut self) -> Scope<'_> {
        Scope {
            alloc: self.alloc,
            span_index: self.span_index,
            offset: self.offset,
            _not_send: PhantomData,
        }
    }

    /// Bump-allocate `size` bytes at `alignment`.
    ///
    /// Panics on usage violations; see
    /// [`try_allocate`](Self::try_allocate).
    pub fn allocate(&mut self, size: u64, alignment: u64) -> DeviceAllocation {
        self.try_allocate(size, alignment)
            .unwrap_or_else(|e| panic!("scoped allocation failed: {e}"))
    }

    /// Bump-allocate, surfacing contract violations as typed errors.
    ///
    /// Fit order: bump within the current coarse span; grow the span in
    /// place; advance to the next already-held span with the cursor reset
    /// to 0; pull a fresh span from the block allocator.
    pub fn try_allocate(&mut self, size: u64, alignment: u64) -> MemoryResult<DeviceAllocation> {
        if size == 0 {
            return Err(MemoryError::ZeroSize);
        }
        if !is_valid_alignment(alignment) {
            return Err(MemoryError::invalid_alignment(alignment));
        }

        let mut state = self.alloc.state.lock();
        loop {
            if let Some(span) = state.spans.get_mut(self.span_index) {
                let aligned = types::align_up(self.offset, alignment);
                // checked_add: a size near u64::MAX must not wrap into a
                // range that appears to fit.
                if let Some(end) = aligned.checked_add(size) {
                    if end <= span.size {
                        self.offset = end;
                        return Ok(DeviceAllocation {
                            memory_type: span.memory_type,
                            kind: AllocationKind::Scoped,
                            region: span.region,
                            offset: span.offset + aligned,
                            size,
                            owner: span.owner,
                            transient_slot: None,
                        });
                    }

                    // Fast path: extend the current span in place. A
                    // combined size past the region capacity just means
                    // growth is not an option here.
                    if let Ok(needed) = types::blocks_for(end) {
                        let have = (span.size / BLOCK_SIZE) as u32;
                        if self.alloc.block.try_grow(span, needed - have) {
                            continue;
                        }
                    }
                }

                // Fall over to the next span already on hand.
                if self.span_index + 1 < state.spans.len() {
                    self.span_index += 1;
                    self.offset = 0;
                    continue;
                }
            }

            // Nothing left to reuse: pull a fresh coarse span.
            let blocks = types::blocks_for(size)?.max(MIN_SCOPE_BLOCKS);
            let span = self.alloc.block.try_allocate_blocks(blocks)?;
            self.span_index = state.spans.len();
            self.offset = 0;
            state.spans.push(span);
        }
    }

    /// Coarse region the cursor currently points into, for diagnostics.
    #[must_use]
    pub fn current_region(&self) -> Option<RegionId> {
        let state = self.alloc.state.lock();
        state.spans.get(self.span_index).map(|s| s.region)
    }

    /// Current bump offset within the active coarse span.
    #[must_use]
    pub fn cursor_offset(&self) -> u64 {
        self.offset
    }
}
