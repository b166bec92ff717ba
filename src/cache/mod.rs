//! Cache Module
//!
//! Provides the shared-memory hostname cache with TTL expiration.

mod entry;
mod service;
mod stats;
mod store;


// Re-export public types
pub use entry::{current_timestamp, Alias, CacheEntry, MAX_ALIAS_LENGTH};
pub use service::HostnameCache;
pub use stats::{CacheStats, SharedCounters};
pub use store::CacheStore;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

    /// Segment name no other test in this or a concurrent run will use.
    pub(crate) fn unique_segment_name() -> String {
        format!(
            "/hc-unit-{}-{}",
            std::process::id(),
            NEXT_ID.fetch_add(1, Ordering::Relaxed)
        )
    }
}
