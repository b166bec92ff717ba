//! Configuration Module
//!
//! Handles loading and managing cache configuration from environment variables.

use std::env;
use std::time::Duration;

/// Hostname cache configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the shared memory segment; the lock is named after it
    pub segment_name: String,
    /// Segment size in bytes, fixed for the segment's lifetime
    pub segment_size: usize,
    /// TTL in seconds for inserts that do not give one
    pub default_ttl: u64,
    /// Expiration sweep interval in seconds
    pub sweep_interval: u64,
    /// Longest wait for the cache lock, `None` waits forever
    pub lock_timeout: Option<Duration>,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `HOSTCACHE_SEGMENT_NAME` - Shared memory segment name (default: /hostname_cache)
    /// - `HOSTCACHE_SEGMENT_SIZE` - Segment size in bytes (default: 2500000)
    /// - `HOSTCACHE_DEFAULT_TTL` - Default TTL in seconds (default: 3600)
    /// - `HOSTCACHE_SWEEP_INTERVAL` - Sweep frequency in seconds (default: 600)
    /// - `HOSTCACHE_LOCK_TIMEOUT_MS` - Lock wait limit in milliseconds, 0 for none (default: none)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            segment_name: env::var("HOSTCACHE_SEGMENT_NAME")
                .ok()
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.segment_name),
            segment_size: env::var("HOSTCACHE_SEGMENT_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.segment_size),
            default_ttl: env::var("HOSTCACHE_DEFAULT_TTL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.default_ttl),
            sweep_interval: env::var("HOSTCACHE_SWEEP_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&secs: &u64| secs > 0)
                .unwrap_or(defaults.sweep_interval),
            lock_timeout: env::var("HOSTCACHE_LOCK_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&ms: &u64| ms > 0)
                .map(Duration::from_millis),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segment_name: "/hostname_cache".to_string(),
            segment_size: 2_500_000,
            default_ttl: 3600,
            sweep_interval: 600,
            lock_timeout: None,
        }
    }
}
