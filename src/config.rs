//! Construction-time configuration for the pool engine.
//!
//! Configuration is fixed when an engine is built and never re-negotiated
//! at runtime: the size-class layout, the byte size of each new pool's
//! backing allocation, and a name used only for diagnostics.

use crate::error::{AllocError, AllocResult};
use crate::utils::WORD_SIZE;

/// How the engine's size-class table is populated.
#[derive(Debug, Clone)]
pub enum SizeClasses {
    /// A fixed, strictly ascending list of block sizes. Requests above the
    /// largest class fall back to the heap backend.
    Fixed(Vec<usize>),
    /// The table starts empty and grows one class per newly observed size,
    /// up to `growth_ceiling` bytes. Larger requests fall back to the heap
    /// backend.
    Dynamic {
        /// Largest block size the table may grow a class for.
        growth_ceiling: usize,
    },
}

/// Debug instrumentation toggles.
///
/// These checks change observability only, never allocation outcomes. The
/// defaults enable everything in debug builds and nothing in release
/// builds.
#[derive(Debug, Clone, Copy)]
pub struct DebugChecks {
    /// Append and verify a 4-byte sentinel after each block's usable bytes
    pub bounds_guard: bool,

    /// Fill pattern written over a block as it leaves the free list
    pub alloc_pattern: Option<u8>,

    /// Fill pattern written over a freed block, first word excepted (it
    /// holds the free-list link)
    pub dealloc_pattern: Option<u8>,
}

impl Default for DebugChecks {
    fn default() -> Self {
        Self {
            bounds_guard: cfg!(debug_assertions),
            alloc_pattern: if cfg!(debug_assertions) { Some(0xBB) } else { None },
            dealloc_pattern: if cfg!(debug_assertions) { Some(0xDD) } else { None },
        }
    }
}

impl DebugChecks {
    /// Production configuration - no instrumentation
    pub fn production() -> Self {
        Self {
            bounds_guard: false,
            alloc_pattern: None,
            dealloc_pattern: None,
        }
    }

    /// Debug configuration - guards and fill patterns on
    pub fn debug() -> Self {
        Self {
            bounds_guard: true,
            alloc_pattern: Some(0xBB),
            dealloc_pattern: Some(0xDD),
        }
    }
}

/// Construction-time configuration for a [`PoolEngine`](crate::engine::PoolEngine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Human-readable name, used only for diagnostics
    pub name: String,

    /// Byte size of each new pool's backing allocation. A pool holds
    /// however many whole blocks fit after the header, minimum one.
    pub pool_bytes: usize,

    /// Size-class layout
    pub classes: SizeClasses,

    /// Debug instrumentation
    pub checks: DebugChecks,
}

impl EngineConfig {
    /// Configuration with a fixed list of size classes.
    pub fn fixed(name: impl Into<String>, pool_bytes: usize, sizes: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            pool_bytes,
            classes: SizeClasses::Fixed(sizes),
            checks: DebugChecks::default(),
        }
    }

    /// Configuration that grows one class per observed size up to
    /// `growth_ceiling`.
    pub fn dynamic(name: impl Into<String>, pool_bytes: usize, growth_ceiling: usize) -> Self {
        Self {
            name: name.into(),
            pool_bytes,
            classes: SizeClasses::Dynamic { growth_ceiling },
            checks: DebugChecks::default(),
        }
    }

    /// Replaces the debug instrumentation settings.
    pub fn with_checks(mut self, checks: DebugChecks) -> Self {
        self.checks = checks;
        self
    }

    /// Validates the configuration.
    ///
    /// Fixed class lists must be non-empty and strictly ascending after
    /// clamping each size to at least one machine word; the pool backing
    /// size must be non-zero.
    pub fn validate(&self) -> AllocResult<()> {
        if self.pool_bytes == 0 {
            return Err(AllocError::config_error("pool_bytes must be non-zero"));
        }
        match &self.classes {
            SizeClasses::Fixed(sizes) => {
                if sizes.is_empty() {
                    return Err(AllocError::config_error("size class list is empty"));
                }
                let mut prev = 0usize;
                for &size in sizes {
                    let size = size.max(WORD_SIZE);
                    if size <= prev {
                        return Err(AllocError::config_error(format!(
                            "size classes must be strictly ascending (after clamping to {} bytes): {:?}",
                            WORD_SIZE, sizes
                        )));
                    }
                    prev = size;
                }
                Ok(())
            }
            SizeClasses::Dynamic { growth_ceiling } => {
                if *growth_ceiling < WORD_SIZE {
                    return Err(AllocError::config_error(format!(
                        "growth ceiling {} is below the minimum block size {}",
                        growth_ceiling, WORD_SIZE
                    )));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_config_validates() {
        let config = EngineConfig::fixed("test", 4096, vec![16, 32, 64]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_unsorted_classes() {
        let config = EngineConfig::fixed("test", 4096, vec![32, 16]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_after_clamp() {
        // 1 and 4 both clamp to the word size on 64-bit targets
        let config = EngineConfig::fixed("test", 4096, vec![1, 4]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_classes_and_zero_pool() {
        assert!(EngineConfig::fixed("test", 4096, vec![]).validate().is_err());
        assert!(EngineConfig::fixed("test", 0, vec![16]).validate().is_err());
    }

    #[test]
    fn dynamic_ceiling_floor() {
        assert!(EngineConfig::dynamic("test", 4096, 1).validate().is_err());
        assert!(EngineConfig::dynamic("test", 4096, 256).validate().is_ok());
    }
}
