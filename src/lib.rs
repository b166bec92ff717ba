//! Hostname Cache - A cross-process hostname cache in shared memory
//!
//! Lets unrelated processes on one host share resolved hostname aliases with
//! TTL expiration, through a named shared memory segment guarded by a named
//! process-shared reader-writer lock.

pub mod cache;
pub mod config;
pub mod error;
pub mod shm;
pub mod tasks;

pub use cache::{CacheEntry, CacheStats, HostnameCache};
pub use config::Config;
pub use error::{CacheError, Result};
pub use tasks::spawn_sweep_task;
