//! Cache Statistics Module
//!
//! Tracks cache activity in counters stored inside the shared segment, so
//! every attached process contributes to and reads the same numbers.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;

// == Shared Counters ==
/// Activity counters embedded in the map header.
///
/// Atomic so lookups can record hits and misses while holding only the
/// shared lock.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SharedCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    expired: AtomicU64,
}

impl SharedCounters {
    /// Records the outcome of a lookup.
    pub fn record_lookup(&self, hit: bool) {
        let counter = if hit { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an `insert_or_assign`, distinguishing new keys from updates.
    pub fn record_write(&self, inserted: bool) {
        let counter = if inserted {
            &self.inserts
        } else {
            &self.updates
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Records entries removed by an expiration sweep.
    pub fn record_expired(&self, count: usize) {
        self.expired.fetch_add(count as u64, Ordering::Relaxed);
    }
}

// == Cache Stats ==
/// Point-in-time view of the cache.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Lookups that returned a live alias
    pub hits: u64,
    /// Lookups for absent or expired keys
    pub misses: u64,
    /// Writes that created a key
    pub inserts: u64,
    /// Writes that replaced an existing key
    pub updates: u64,
    /// Entries removed by expiration sweeps
    pub expired_removed: u64,
    /// Current number of entries in the cache
    pub total_entries: usize,
    /// Free bytes left in the segment
    pub available_memory: usize,
    /// Total segment size in bytes
    pub segment_size: usize,
    /// RFC 3339 time the snapshot was taken
    pub captured_at: String,
}

impl CacheStats {
    // == Capture ==
    /// Builds a snapshot from the shared counters and the store's sizes.
    pub fn capture(
        counters: &SharedCounters,
        total_entries: usize,
        available_memory: usize,
        segment_size: usize,
    ) -> Self {
        Self {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            inserts: counters.inserts.load(Ordering::Relaxed),
            updates: counters.updates.load(Ordering::Relaxed),
            expired_removed: counters.expired.load(Ordering::Relaxed),
            total_entries,
            available_memory,
            segment_size,
            captured_at: Utc::now().to_rfc3339(),
        }
    }

    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no lookups have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
