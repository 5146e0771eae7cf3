//! Error types for allocation operations.
//!
//! Allocation success or failure is the only condition that propagates to
//! callers as a value. Invariant violations (bounds-guard mismatch, a
//! pointer resolved to a pool but not to a block boundary) indicate memory
//! corruption and panic instead of returning an error.

use thiserror::Error;

/// Result type for allocation operations
pub type AllocResult<T> = Result<T, AllocError>;

/// Allocation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The backing heap could not satisfy the request
    #[error("out of memory: requested {requested} bytes")]
    OutOfMemory {
        /// Bytes requested from the backing heap
        requested: usize,
    },

    /// A size computation overflowed
    #[error("allocation size calculation overflowed")]
    SizeOverflow,

    /// Alignment is not a power of two
    #[error("invalid alignment: {align} is not a power of two")]
    InvalidAlignment {
        /// The rejected alignment value
        align: usize,
    },

    /// Layout parameters are unusable
    #[error("invalid layout: {0}")]
    InvalidLayout(&'static str),

    /// The engine is in a state that cannot serve the request
    #[error("invalid allocator state: {0}")]
    InvalidState(&'static str),

    /// Construction-time configuration was rejected
    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl AllocError {
    /// Create an out-of-memory error
    pub fn out_of_memory(requested: usize) -> Self {
        Self::OutOfMemory { requested }
    }

    /// Create an invalid-alignment error
    pub fn invalid_alignment(align: usize) -> Self {
        Self::InvalidAlignment { align }
    }

    /// Create a configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    /// Checks if this is an out-of-memory error
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}
