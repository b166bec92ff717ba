//! Cache Entry Module
//!
//! Defines the fixed-layout entry stored in shared memory for each hostname.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{CacheError, Result};

/// Longest alias an entry can hold, in bytes. Covers a 253 character FQDN.
pub const MAX_ALIAS_LENGTH: usize = 255;

// == Alias ==
/// Bounded, inline string holding a resolved alias.
///
/// Inputs longer than [`MAX_ALIAS_LENGTH`] bytes are rejected, never
/// truncated.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Alias {
    len: u8,
    bytes: [u8; MAX_ALIAS_LENGTH],
}

impl Alias {
    pub fn new(alias: &str) -> Result<Self> {
        if alias.len() > MAX_ALIAS_LENGTH {
            return Err(CacheError::AliasTooLong {
                len: alias.len(),
                max: MAX_ALIAS_LENGTH,
            });
        }

        let mut bytes = [0; MAX_ALIAS_LENGTH];
        bytes[..alias.len()].copy_from_slice(alias.as_bytes());
        Ok(Self {
            len: alias.len() as u8,
            bytes,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    /// The alias text. Bytes that are not UTF-8 (only possible if another
    /// process scribbled over the segment) read as an empty string.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(self.as_bytes()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for Alias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for Alias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// == Cache Entry ==
/// The value mapped to a hostname key.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    /// Unix timestamp in seconds at which the entry stops being served
    pub expiration: i64,
    /// TTL in seconds given when the entry was written
    pub expires_after: i64,
    /// The resolved alias
    pub hostname: Alias,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates an entry expiring `ttl` after `now`.
    ///
    /// # Arguments
    /// * `hostname` - The alias to store
    /// * `now` - Current Unix timestamp in seconds
    /// * `ttl` - Time to live; sub-second parts are dropped
    pub fn new(hostname: Alias, now: i64, ttl: Duration) -> Self {
        let expires_after = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        Self {
            expiration: now.saturating_add(expires_after),
            expires_after,
            hostname,
        }
    }

    // == Is Expired ==
    /// Checks if the entry has expired at `now`.
    ///
    /// Boundary condition: an entry is expired once `now` reaches its
    /// expiration, so a zero TTL entry is never served.
    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.expiration
    }

    /// Checks if the entry has expired at the current time.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp())
    }

    // == Time To Live ==
    /// Returns remaining TTL in seconds at `now`, 0 once expired.
    pub fn ttl_remaining_at(&self, now: i64) -> u64 {
        u64::try_from(self.expiration.saturating_sub(now)).unwrap_or(0)
    }

    /// Expiration as a UTC date, `None` if out of chrono's range.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.expiration, 0)
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in seconds.
pub fn current_timestamp() -> i64 {
    Utc::now().timestamp()
}
