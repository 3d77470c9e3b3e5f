//! Backing-memory provider contract
//!
//! The allocator core never talks to a graphics API directly: it consumes
//! an opaque provider that can reserve coarse contiguous regions and,
//! optionally, persistently host-map them. Regions are released implicitly
//! when their handle is dropped; the core never frees individual blocks
//! back to the provider.

use core::ptr::NonNull;
use std::alloc::{self, Layout};

use crate::error::{MemoryError, MemoryResult};

/// One coarse reservation obtained from a [`MemoryProvider`].
///
/// The reservation is released when this handle is dropped.
pub trait ProviderRegion: Send + Sync {
    /// Size of the reservation in bytes.
    fn size(&self) -> u64;

    /// Persistent host mapping, if one was requested at reserve time.
    fn mapped_ptr(&self) -> Option<NonNull<u8>>;
}

/// Provider of coarse backing-memory regions.
pub trait MemoryProvider: Send + Sync {
    /// Reserve one contiguous region of `size` bytes, host-mapped if
    /// `mapped` is set. The region must be aligned at least to the block
    /// size.
    fn reserve(&self, size: u64, mapped: bool) -> MemoryResult<Box<dyn ProviderRegion>>;
}

// ============================================================================
// Host reference provider
// ============================================================================

/// Region alignment guaranteed by [`HostProvider`].
const HOST_REGION_ALIGN: usize = 4096;

/// Host-memory provider backed by the global allocator.
///
/// Reference implementation of the provider contract, used by tests,
/// benches, and engine bring-up before a device backend is wired in.
/// Every region is mappable.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostProvider;

impl HostProvider {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

struct HostRegion {
    ptr: NonNull<u8>,
    layout: Layout,
    mapped: bool,
}

// SAFETY: the region is a plain byte buffer with no interior state; the
// allocator core serializes all access to its contents.
unsafe impl Send for HostRegion {}
unsafe impl Sync for HostRegion {}

impl ProviderRegion for HostRegion {
    fn size(&self) -> u64 {
        self.layout.size() as u64
    }

    fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped.then_some(self.ptr)
    }
}

impl Drop for HostRegion {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this exact layout in `reserve` and
        // is freed exactly once here.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl MemoryProvider for HostProvider {
    fn reserve(&self, size: u64, mapped: bool) -> MemoryResult<Box<dyn ProviderRegion>> {
        let layout = Layout::from_size_align(size as usize, HOST_REGION_ALIGN)
            .map_err(|_| MemoryError::provider_exhausted(size))?;

        // SAFETY: layout has non-zero size (callers validate against
        // zero-size requests) and a valid power-of-two alignment.
        let raw = unsafe { alloc::alloc(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| MemoryError::provider_exhausted(size))?;

        Ok(Box::new(HostRegion {
            ptr,
            layout,
            mapped,
        }))
    }
}
