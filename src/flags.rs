//! Bit-flag word threaded through heap-backend hooks and tracker calls.

use bitflags::bitflags;

bitflags! {
    /// Flags describing the origin and tracking policy of an allocation.
    ///
    /// Every pool-engine operation threads this word through the heap
    /// backend hooks and the optional usage tracker. Flags never change an
    /// allocation outcome, only its bookkeeping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Set by the pool engine when the returned memory came from a
        /// pool. Informational.
        const POOL_ALLOC = 1 << 0;
        /// Suppresses tracker reporting for this call; the allocation is
        /// accounted for elsewhere.
        const NOTRACK_ALLOC = 1 << 1;
        /// Marks an allocation made by the engine for its own bookkeeping
        /// (pool backing store, registry growth). Untracked, so the
        /// tracker never recurses into the engine.
        const INTERNAL_ALLOC = 1 << 2;
        /// Marks an allocation originating from the tracking subsystem
        /// itself.
        const DEBUG_ALLOC = 1 << 3;
    }
}

impl AllocFlags {
    /// Whether a call carrying these flags should be reported to the
    /// usage tracker.
    #[inline]
    pub fn is_tracked(self) -> bool {
        !self.intersects(Self::NOTRACK_ALLOC | Self::INTERNAL_ALLOC | Self::DEBUG_ALLOC)
    }
}
