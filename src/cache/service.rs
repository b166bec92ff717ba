//! Hostname Cache Service
//!
//! The public face of the cache: lifecycle of the shared objects plus the
//! lookup and maintenance operations, each run under the process-shared lock.

use std::time::Duration;

use nix::unistd::{getpid, Pid};
use tracing::{debug, info, warn};

use crate::cache::{current_timestamp, Alias, CacheEntry, CacheStats, CacheStore};
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::shm::{self, NamedRwLock, SharedSegment};

/// Segment and lock mapped into this process.
struct Shared {
    segment: SharedSegment,
    lock: NamedRwLock,
}

impl Shared {
    fn store(&self) -> Result<CacheStore> {
        CacheStore::open(self.segment.arena())
    }
}

// == Hostname Cache ==
/// A handle on a cross-process hostname cache.
///
/// A handle either creates the shared objects with [`HostnameCache::init`],
/// becoming their owner, or maps existing ones with
/// [`HostnameCache::attach`]. Only the owning process can tear them down;
/// for every other handle (including copies inherited across `fork`)
/// [`HostnameCache::deinit`] does nothing.
///
/// Every operation blocks until the lock is available. With a lock timeout
/// configured, Linux builds give up after that long with
/// [`CacheError::LockTimeout`].
pub struct HostnameCache {
    shared: Option<Shared>,
    owner_pid: Option<Pid>,
    lock_timeout: Option<Duration>,
}

impl HostnameCache {
    // == Constructors ==
    /// Creates a handle that is not yet bound to any segment.
    pub fn new() -> Self {
        Self::with_lock_timeout(None)
    }

    /// Creates an unbound handle whose lock acquisitions wait at most
    /// `lock_timeout` (`None` waits forever).
    pub fn with_lock_timeout(lock_timeout: Option<Duration>) -> Self {
        Self {
            shared: None,
            owner_pid: None,
            lock_timeout,
        }
    }

    /// Creates and initialises the segment named in `config`, owned by the
    /// calling process.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut cache = Self::with_lock_timeout(config.lock_timeout);
        cache.init(&config.segment_name, config.segment_size)?;
        Ok(cache)
    }

    /// Maps a segment another process created. The handle never owns it.
    pub fn attach(name: &str, lock_timeout: Option<Duration>) -> Result<Self> {
        let segment_name = shm::object_name(name)?;
        let segment = SharedSegment::open(&segment_name)?;
        let lock = NamedRwLock::open(&shm::lock_name(&segment_name))?;
        CacheStore::open(segment.arena())?;

        info!(segment = %segment_name, "Attached to hostname cache");
        Ok(Self {
            shared: Some(Shared { segment, lock }),
            owner_pid: None,
            lock_timeout,
        })
    }

    // == Init ==
    /// Creates the segment, its map, and its lock as a fresh empty cache,
    /// and makes this process the owner.
    ///
    /// Any objects already registered under the same names are removed
    /// first. Calling `init` again from the owning process is a no-op.
    ///
    /// # Arguments
    /// * `name` - Segment name; a leading `/` is added if missing
    /// * `size` - Segment size in bytes; the segment never grows
    pub fn init(&mut self, name: &str, size: usize) -> Result<()> {
        if self.is_owner() && self.shared.is_some() {
            debug!("Hostname cache already initialized by this process");
            return Ok(());
        }

        let segment_name = shm::object_name(name)?;
        let lock_name = shm::lock_name(&segment_name);
        if size < CacheStore::min_segment_size() {
            return Err(CacheError::InvalidConfig(format!(
                "segment size {size} is below the minimum of {} bytes",
                CacheStore::min_segment_size()
            )));
        }

        // Whatever this handle mapped before is released, not destroyed.
        self.shared = None;
        self.owner_pid = None;

        let segment = SharedSegment::create(&segment_name, size)?;
        let lock = match NamedRwLock::create(&lock_name) {
            Ok(lock) => lock,
            Err(err) => {
                segment.release();
                return Err(err);
            }
        };
        if let Err(err) = CacheStore::construct(segment.arena()) {
            lock.destroy();
            segment.release();
            return Err(err);
        }

        self.shared = Some(Shared { segment, lock });
        self.owner_pid = Some(getpid());
        info!(segment = %segment_name, size, "Hostname cache initialized");
        Ok(())
    }

    // == Deinit ==
    /// Destroys the map, the lock and the segment, and removes their names
    /// from the OS namespace. Names that a later `init` has since reused are
    /// left to their new owner.
    ///
    /// Does nothing unless called from the process that initialised the
    /// cache. Never fails: teardown problems are logged and ignored.
    pub fn deinit(&mut self) {
        if !self.is_owner() {
            return;
        }
        self.owner_pid = None;

        let Some(shared) = self.shared.take() else {
            return;
        };
        let segment_name = shared.segment.name().to_string();

        match shared.lock.write(self.lock_timeout) {
            Ok(_guard) => match shared.store() {
                Ok(store) => store.destroy(),
                Err(err) => warn!(segment = %segment_name, %err, "Cache map missing at teardown"),
            },
            Err(err) => warn!(segment = %segment_name, %err, "Skipping map teardown"),
        }

        let Shared { segment, lock } = shared;
        lock.destroy();
        segment.release();
        info!(segment = %segment_name, "Hostname cache torn down");
    }

    // == Accessors ==
    /// Returns true once `init` or `attach` succeeded and until `deinit`.
    pub fn is_initialized(&self) -> bool {
        self.shared.is_some()
    }

    /// Returns true if this process created the segment through this handle.
    pub fn is_owner(&self) -> bool {
        self.owner_pid == Some(getpid())
    }

    /// Normalised name of the mapped segment.
    pub fn segment_name(&self) -> Option<&str> {
        self.shared.as_ref().map(|shared| shared.segment.name())
    }

    // == Insert Or Assign ==
    /// Stores `alias` for `key`, expiring `ttl` from now.
    ///
    /// Returns `true` if the key was new and `false` if an existing entry
    /// (expired or not) was overwritten.
    ///
    /// # Errors
    /// * [`CacheError::InvalidKey`] for an empty key
    /// * [`CacheError::AliasTooLong`] when `alias` exceeds the entry buffer
    /// * [`CacheError::OutOfMemory`] when the segment has no room for a new
    ///   key; existing entries are unaffected
    pub fn insert_or_assign(&self, key: &str, alias: &str, ttl: Duration) -> Result<bool> {
        if key.is_empty() {
            return Err(CacheError::InvalidKey("key must not be empty".to_string()));
        }
        let alias = Alias::new(alias)?;
        let shared = self.shared()?;

        let _guard = shared.lock.write(self.lock_timeout)?;
        let entry = CacheEntry::new(alias, current_timestamp(), ttl);
        let mut store = shared.store()?;
        let inserted = store.insert_or_assign(key.as_bytes(), &entry)?;
        store.counters().record_write(inserted);
        Ok(inserted)
    }

    // == Lookup ==
    /// Returns the alias for `key` if present and not yet expired.
    ///
    /// Expired entries read as absent even before a sweep removes them. A
    /// hit does not extend the entry's lifetime.
    pub fn lookup(&self, key: &str) -> Result<Option<String>> {
        let shared = self.shared()?;

        let _guard = shared.lock.read(self.lock_timeout)?;
        let store = shared.store()?;
        let now = current_timestamp();
        let alias = store
            .get(key.as_bytes())
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.hostname.as_str().to_string());
        store.counters().record_lookup(alias.is_some());
        Ok(alias)
    }

    // == Erase ==
    /// Removes `key`. Returns whether an entry was removed; an absent key is
    /// not an error.
    pub fn erase(&self, key: &str) -> Result<bool> {
        let shared = self.shared()?;

        let _guard = shared.lock.write(self.lock_timeout)?;
        Ok(shared.store()?.remove(key.as_bytes()))
    }

    // == Erase Expired Entries ==
    /// Removes every entry whose expiration has been reached, in one pass
    /// under the exclusive lock.
    ///
    /// Returns the number of entries removed.
    pub fn erase_expired_entries(&self) -> Result<usize> {
        let shared = self.shared()?;

        let _guard = shared.lock.write(self.lock_timeout)?;
        let mut store = shared.store()?;
        let removed = store.remove_expired(current_timestamp());
        store.counters().record_expired(removed);
        debug!(removed, remaining = store.len(), "Swept expired entries");
        Ok(removed)
    }

    // == Clear ==
    /// Removes all entries.
    pub fn clear(&self) -> Result<()> {
        let shared = self.shared()?;

        let _guard = shared.lock.write(self.lock_timeout)?;
        shared.store()?.clear();
        Ok(())
    }

    // == Size ==
    /// Returns the number of stored entries, expired ones included.
    pub fn size(&self) -> Result<usize> {
        let shared = self.shared()?;

        let _guard = shared.lock.read(self.lock_timeout)?;
        Ok(shared.store()?.len())
    }

    // == Available Memory ==
    /// Returns the free bytes left in the segment.
    pub fn available_memory(&self) -> Result<usize> {
        let shared = self.shared()?;

        let _guard = shared.lock.read(self.lock_timeout)?;
        Ok(shared.segment.free_bytes())
    }

    // == Stats ==
    /// Returns a snapshot of the shared counters and sizes.
    pub fn stats(&self) -> Result<CacheStats> {
        let shared = self.shared()?;

        let _guard = shared.lock.read(self.lock_timeout)?;
        let store = shared.store()?;
        Ok(CacheStats::capture(
            store.counters(),
            store.len(),
            shared.segment.free_bytes(),
            shared.segment.size(),
        ))
    }

    fn shared(&self) -> Result<&Shared> {
        self.shared.as_ref().ok_or(CacheError::NotInitialized)
    }
}

impl Default for HostnameCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HostnameCache {
    fn drop(&mut self) {
        self.deinit();
    }
}
