//! Segregated free-list pool allocator with heap fallback.
//!
//! This crate serves small, high-frequency allocation requests from
//! size-classed memory pools (each a contiguous region of same-size
//! blocks threaded with an intrusive free list) while transparently
//! falling back to a general-purpose heap for anything larger. A flat span
//! registry answers "which pool owns this address" on the way back, and an
//! optional tracker observes every allocation for leak detection.
//!
//! # Architecture
//!
//! - [`engine::PoolEngine`]: the core. Size-class table, pool chains, and
//!   span registry, all behind one mutex
//! - [`heap::HeapBackend`] / [`heap::SystemHeap`]: the boundary to the
//!   general-purpose allocator, used for large requests and for the
//!   engine's own backing allocations
//! - [`facade`]: the process-wide `malloc`-shaped surface with lazy
//!   one-time initialization, out-of-memory policy, and leak reporting
//! - [`tracker::AllocTracker`]: optional usage/leak observer
//!
//! # Example
//!
//! ```
//! use segalloc::config::EngineConfig;
//! use segalloc::engine::PoolEngine;
//! use segalloc::flags::AllocFlags;
//! use segalloc::heap::SystemHeap;
//! use std::sync::Arc;
//!
//! let config = EngineConfig::fixed("example", 4096, vec![16, 32, 64]);
//! let engine = PoolEngine::new(config, Arc::new(SystemHeap::new())).unwrap();
//!
//! let ptr = engine.allocate(24, AllocFlags::empty()).unwrap();
//! unsafe {
//!     assert_eq!(engine.usable_size(ptr), 32);
//!     engine.deallocate(ptr, AllocFlags::empty());
//! }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod engine;
pub mod error;
pub mod facade;
pub mod flags;
pub mod heap;
pub mod tracker;
pub mod utils;

pub use config::{DebugChecks, EngineConfig, SizeClasses};
pub use engine::PoolEngine;
pub use error::{AllocError, AllocResult};
pub use facade::{FacadeConfig, MemoryContext, OomHandler};
pub use flags::AllocFlags;
pub use heap::{HeapBackend, SystemHeap};
pub use tracker::{AllocTracker, StatsTracker, TrackerSnapshot};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
