//! Error types for the hostname cache
//!
//! Provides unified error handling using thiserror.

use std::io;
use std::time::Duration;

use nix::errno::Errno;
use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the hostname cache.
///
/// Cache misses are not errors: they surface as `Ok(None)` or `Ok(false)`.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The shared memory segment or its lock could not be created
    #[error("Failed to create shared memory object {name}: {source}")]
    SegmentCreate {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The shared memory segment or its lock could not be opened
    #[error("Failed to open shared memory object {name}: {source}")]
    SegmentOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The mapped object does not hold a hostname cache
    #[error("Invalid segment: {0}")]
    InvalidSegment(String),

    /// Segment name or size cannot be used
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The segment has no block large enough for the new entry
    #[error("Out of shared memory: requested {requested} bytes, {available} bytes free")]
    OutOfMemory { requested: usize, available: usize },

    /// Key rejected before touching the store
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Alias does not fit in the fixed-capacity entry buffer
    #[error("Alias is {len} bytes, maximum is {max}")]
    AliasTooLong { len: usize, max: usize },

    /// Bounded-wait lock acquisition gave up
    #[error("Timed out after {0:?} waiting for the cache lock")]
    LockTimeout(Duration),

    /// The underlying pthread call failed
    #[error("Lock operation failed: {0}")]
    Lock(#[source] Errno),

    /// The handle was never initialised or attached, or was torn down
    #[error("Hostname cache is not initialized")]
    NotInitialized,
}

// == Result Type Alias ==
/// Convenience Result type for the hostname cache.
pub type Result<T> = std::result::Result<T, CacheError>;
