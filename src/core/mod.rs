//! Core building blocks: configuration, constants, and shared types.

pub mod config;
pub mod types;

pub use config::{CeilingPolicy, MemoryConfig};
pub use types::{AllocationKind, BLOCK_SIZE, MAX_BLOCKS_PER_REGION, is_valid_alignment};
