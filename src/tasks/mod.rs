//! Background Tasks Module
//!
//! Contains background tasks that run periodically while a process serves
//! the cache.
//!
//! # Tasks
//! - Expiration sweep: removes expired entries at the configured interval

mod sweep;

pub use sweep::spawn_sweep_task;
