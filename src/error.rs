//! Error types for prism-memory
//!
//! Uses thiserror for clean, idiomatic Rust error definitions.
//!
//! The allocator's contract is fail-fast: the primary `allocate`/`free`
//! entry points panic on usage violations. Every fallible path also has a
//! `try_`-prefixed twin that surfaces the same checks as typed errors, for
//! test harnesses and fuzzing.

use thiserror::Error;

use crate::core::types::BLOCK_SIZE;

// ============================================================================
// Main Error Type
// ============================================================================

/// Device-memory allocation errors
#[must_use = "errors should be handled"]
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    // --- Usage-contract violations ---
    #[error("zero-size allocation request")]
    ZeroSize,

    #[error("invalid alignment {alignment}: must evenly divide the {block_size} byte block size")]
    InvalidAlignment { alignment: u64, block_size: u64 },

    #[error("request of {blocks} blocks exceeds the per-region capacity of {max} blocks")]
    ExceedsRegionCapacity { blocks: u64, max: u32 },

    #[error("allocation was not produced by this allocator")]
    ForeignAllocation,

    #[error("allocation already freed: offset {offset}, {size} bytes")]
    DoubleFree { offset: u64, size: u64 },

    #[error("scoped allocations must be requested through an explicit scope object")]
    ScopedKindViaPool,

    #[error("{live} allocation(s) still live")]
    LiveAllocations { live: u64 },

    #[error("invalid heap index {heap} (heap count {count})")]
    InvalidHeap { heap: usize, count: usize },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // --- Resource exhaustion ---
    #[error("reserving would bring total to {reserved} bytes, above the {ceiling} byte ceiling")]
    CeilingExceeded { reserved: u64, ceiling: u64 },

    #[error("backing provider failed to reserve {size} bytes")]
    ProviderExhausted { size: u64 },
}

impl MemoryError {
    /// Usage-contract violations are programmer errors: the panicking entry
    /// points abort on them rather than returning them.
    #[must_use]
    pub fn is_usage_violation(&self) -> bool {
        !matches!(
            self,
            Self::CeilingExceeded { .. } | Self::ProviderExhausted { .. }
        )
    }

    /// Get error code for categorization
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ZeroSize => "MEM:USAGE:ZERO_SIZE",
            Self::InvalidAlignment { .. } => "MEM:USAGE:ALIGN",
            Self::ExceedsRegionCapacity { .. } => "MEM:USAGE:REGION_CAP",
            Self::ForeignAllocation => "MEM:USAGE:FOREIGN",
            Self::DoubleFree { .. } => "MEM:USAGE:DOUBLE_FREE",
            Self::ScopedKindViaPool => "MEM:USAGE:SCOPED_KIND",
            Self::LiveAllocations { .. } => "MEM:USAGE:LIVE",
            Self::InvalidHeap { .. } => "MEM:USAGE:HEAP",
            Self::InvalidConfig { .. } => "MEM:CONFIG:INVALID",
            Self::CeilingExceeded { .. } => "MEM:CAPACITY:CEILING",
            Self::ProviderExhausted { .. } => "MEM:CAPACITY:PROVIDER",
        }
    }

    // --- Convenience constructors ---

    /// Create invalid alignment error
    #[must_use]
    pub fn invalid_alignment(alignment: u64) -> Self {
        Self::InvalidAlignment {
            alignment,
            block_size: BLOCK_SIZE,
        }
    }

    /// Create invalid config error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create double free error from an allocation's geometry
    #[must_use]
    pub fn double_free(offset: u64, size: u64) -> Self {
        Self::DoubleFree { offset, size }
    }

    /// Create provider exhausted error
    #[must_use]
    pub fn provider_exhausted(size: u64) -> Self {
        Self::ProviderExhausted { size }
    }
}

// ============================================================================
// Result Type
// ============================================================================

/// Result type for memory operations
pub type MemoryResult<T> = core::result::Result<T, MemoryError>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let error = MemoryError::invalid_alignment(48);
        assert!(error.to_string().contains("48"));

        let error = MemoryError::double_free(1024, 256);
        assert!(error.to_string().contains("1024"));
        assert!(error.to_string().contains("256"));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(MemoryError::ZeroSize.code(), "MEM:USAGE:ZERO_SIZE");
        assert_eq!(
            MemoryError::provider_exhausted(1 << 30).code(),
            "MEM:CAPACITY:PROVIDER"
        );
    }

    #[test]
    fn test_usage_violation_category() {
        assert!(MemoryError::ZeroSize.is_usage_violation());
        assert!(MemoryError::ForeignAllocation.is_usage_violation());
        assert!(!MemoryError::provider_exhausted(64).is_usage_violation());
        assert!(
            !MemoryError::CeilingExceeded {
                reserved: 2,
                ceiling: 1
            }
            .is_usage_violation()
        );
    }
}
