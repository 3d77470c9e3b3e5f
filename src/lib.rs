//! # prism-memory
//!
//! Tiered device-memory allocation for the Prism rendering engine.
//!
//! Device memory is reserved from a backend in coarse regions and carved
//! into fixed-size blocks. Three allocation strategies sit on top of that
//! foundation, composed per memory type:
//! - Block-level allocation for standalone, long-lived resources
//! - Scoped bump allocation with a strict LIFO scope stack for frame- and
//!   pass-local data
//! - Transient reference-counted allocation for staging and upload traffic
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use prism_memory::prelude::*;
//!
//! let device = DeviceAllocator::new(
//!     Arc::new(HostProvider::new()),
//!     vec![MemoryConfig::default()],
//! )?;
//!
//! // Long-lived resource: whole blocks, freed explicitly.
//! let image = device.try_allocate(0, 20 << 20, 256, AllocationKind::BlockLevel)?;
//!
//! // Frame-local data: bump-allocated, reclaimed by scope rewind.
//! {
//!     let mut frame = device.root_scope();
//!     let _uniforms = frame.allocate(0, 4096, 256);
//! }
//!
//! device.try_free(image)?;
//! # Ok::<(), prism_memory::MemoryError>(())
//! ```
//!
//! ## Architecture
//!
//! [`DeviceAllocator`] owns one [`PoolSet`] per heap; each pool set routes
//! requests by [`AllocationKind`] to its block, scoped, or transient
//! allocator, or straight through to the [`MemoryProvider`] for raw
//! reservations. Misuse (double frees, foreign handles, bad alignment) is
//! detected eagerly and panics by default; the `try_` variants surface the
//! same violations as [`MemoryError`] values for test harnesses.

#![warn(clippy::all)]
#![warn(clippy::perf)]
#![warn(rust_2018_idioms)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// Cast truncation/sign-loss in block arithmetic is reviewed per-site
#![allow(clippy::cast_possible_truncation)]

pub mod allocator;
pub mod core;
pub mod error;
pub mod provider;
pub mod stats;

pub use crate::allocator::{
    AllocatorId, BlockAllocator, DeviceAllocation, DeviceAllocator, DeviceScope, PoolSet,
    RegionId, Scope, ScopedAllocator, TransientAllocator,
};
pub use crate::core::{AllocationKind, CeilingPolicy, MemoryConfig, BLOCK_SIZE};
pub use crate::error::{MemoryError, MemoryResult};
pub use crate::provider::{HostProvider, MemoryProvider, ProviderRegion};
pub use crate::stats::StatsSnapshot;

pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use crate::allocator::{
        DeviceAllocation, DeviceAllocator, DeviceScope, PoolSet, Scope,
    };
    pub use crate::core::{AllocationKind, CeilingPolicy, MemoryConfig, BLOCK_SIZE};
    pub use crate::error::{MemoryError, MemoryResult};
    pub use crate::provider::{HostProvider, MemoryProvider, ProviderRegion};
}
