//! Allocator configuration

use crate::core::types::MAX_BLOCKS_PER_REGION;
use crate::error::{MemoryError, MemoryResult};

/// Policy applied when cumulative reserved memory crosses the soft ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CeilingPolicy {
    /// Log a warning and keep going. Reserving more memory than budgeted is
    /// an operational concern, not a correctness one.
    Warn,
    /// Refuse to reserve further regions.
    Fail,
}

/// Configuration for one memory pool (one memory-type index).
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Block count of the first coarse region.
    pub initial_region_blocks: u32,

    /// Block count new regions ramp up to.
    pub max_region_blocks: u32,

    /// Number of region creations over which the region size ramps
    /// linearly from `initial_region_blocks` to `max_region_blocks`.
    pub growth_ramp_regions: u32,

    /// Soft ceiling on cumulative reserved bytes, if any.
    pub soft_ceiling: Option<u64>,

    /// What to do when the soft ceiling is crossed.
    pub ceiling_policy: CeilingPolicy,

    /// Persistently host-map coarse regions reserved for this pool.
    pub mapped: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            initial_region_blocks: 4,
            max_region_blocks: MAX_BLOCKS_PER_REGION,
            growth_ramp_regions: 8,
            soft_ceiling: Some(2 * 1024 * 1024 * 1024),
            ceiling_policy: CeilingPolicy::Warn,
            mapped: false,
        }
    }
}

impl MemoryConfig {
    /// Production configuration: full-size regions, warn-only ceiling.
    #[must_use]
    pub fn production() -> Self {
        Self::default()
    }

    /// Debug configuration: small regions so growth and fallback paths are
    /// exercised early, strict ceiling.
    #[must_use]
    pub fn debug() -> Self {
        Self {
            initial_region_blocks: 1,
            max_region_blocks: 8,
            growth_ramp_regions: 4,
            soft_ceiling: Some(256 * 1024 * 1024),
            ceiling_policy: CeilingPolicy::Fail,
            mapped: false,
        }
    }

    /// Same configuration with persistent host mapping enabled.
    #[must_use]
    pub fn with_mapped(mut self, mapped: bool) -> Self {
        self.mapped = mapped;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> MemoryResult<()> {
        if self.initial_region_blocks == 0 {
            return Err(MemoryError::invalid_config(
                "initial_region_blocks must be at least 1",
            ));
        }
        if self.max_region_blocks > MAX_BLOCKS_PER_REGION {
            return Err(MemoryError::invalid_config(format!(
                "max_region_blocks {} exceeds the hard limit of {MAX_BLOCKS_PER_REGION}",
                self.max_region_blocks
            )));
        }
        if self.initial_region_blocks > self.max_region_blocks {
            return Err(MemoryError::invalid_config(
                "initial_region_blocks exceeds max_region_blocks",
            ));
        }
        if self.growth_ramp_regions == 0 {
            return Err(MemoryError::invalid_config(
                "growth_ramp_regions must be at least 1",
            ));
        }
        Ok(())
    }

    /// Block count target for the `regions_created`-th region: ramps
    /// linearly from the initial to the maximum block count, so early
    /// regions stay small and later ones amortize reservation count.
    #[must_use]
    pub(crate) fn growth_target(&self, regions_created: u32) -> u32 {
        let step = regions_created.min(self.growth_ramp_regions);
        let span = u64::from(self.max_region_blocks - self.initial_region_blocks);
        let ramped = span * u64::from(step) / u64::from(self.growth_ramp_regions);
        self.initial_region_blocks + ramped as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(MemoryConfig::default().validate().is_ok());
        assert!(MemoryConfig::debug().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_configs() {
        let config = MemoryConfig {
            initial_region_blocks: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = MemoryConfig {
            max_region_blocks: MAX_BLOCKS_PER_REGION + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = MemoryConfig {
            initial_region_blocks: 16,
            max_region_blocks: 8,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_growth_target_ramps_linearly() {
        let config = MemoryConfig {
            initial_region_blocks: 4,
            max_region_blocks: 64,
            growth_ramp_regions: 6,
            ..Default::default()
        };

        assert_eq!(config.growth_target(0), 4);
        assert_eq!(config.growth_target(3), 34);
        assert_eq!(config.growth_target(6), 64);
        // Saturates at the maximum past the ramp.
        assert_eq!(config.growth_target(100), 64);
    }
}
