//! Shared Memory Module
//!
//! Named segments, the offset-addressed arena living inside them, and the
//! process-shared lock guarding both.

pub mod arena;
mod rwlock;
mod segment;

pub use arena::{Arena, Offset};
pub use rwlock::{lock_name, LockGuard, NamedRwLock};
pub use segment::{object_name, SharedSegment};
