//! Expiration Sweep Task
//!
//! Background task that periodically removes expired cache entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::HostnameCache;

/// Spawns a background task that periodically sweeps expired cache entries.
///
/// The task runs in an infinite loop, sleeping for the specified interval
/// between sweeps. The sweep itself runs on the blocking pool because it
/// waits on the process-shared lock, which may be held by another process.
///
/// # Arguments
/// * `cache` - Shared handle on an initialised or attached cache
/// * `sweep_interval_secs` - Interval in seconds between sweeps
///
/// # Returns
/// A JoinHandle for the spawned task, which can be used to abort the task
/// during graceful shutdown.
///
/// # Example
/// ```ignore
/// let cache = Arc::new(HostnameCache::from_config(&config)?);
/// let sweep_handle = spawn_sweep_task(cache.clone(), 600);
/// // Later, during shutdown:
/// sweep_handle.abort();
/// ```
pub fn spawn_sweep_task(cache: Arc<HostnameCache>, sweep_interval_secs: u64) -> JoinHandle<()> {
    let interval = Duration::from_secs(sweep_interval_secs);

    tokio::spawn(async move {
        info!(
            "Starting expiration sweep task with interval of {} seconds",
            sweep_interval_secs
        );

        loop {
            // Sleep for the configured interval
            tokio::time::sleep(interval).await;

            let sweep_cache = cache.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                let removed = sweep_cache.erase_expired_entries()?;
                let stats = sweep_cache.stats()?;
                Ok::<_, crate::error::CacheError>((removed, stats))
            })
            .await;

            // Log sweep statistics
            match outcome {
                Ok(Ok((removed, stats))) if removed > 0 => info!(
                    removed,
                    entries = stats.total_entries,
                    available_memory = stats.available_memory,
                    "Expiration sweep removed entries"
                ),
                Ok(Ok((_, stats))) => debug!(
                    entries = stats.total_entries,
                    "Expiration sweep found no expired entries"
                ),
                Ok(Err(err)) => warn!(%err, "Expiration sweep failed"),
                Err(err) => warn!(%err, "Expiration sweep task panicked"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::unique_segment_name;

    fn owned_cache() -> Arc<HostnameCache> {
        let mut cache = HostnameCache::new();
        cache.init(&unique_segment_name(), 64 * 1024).unwrap();
        Arc::new(cache)
    }

    #[tokio::test]
    async fn test_sweep_task_removes_expired_entries() {
        let cache = owned_cache();

        // Zero TTL entries are expired as soon as they are written
        cache
            .insert_or_assign("expire_soon", "10.0.0.1", Duration::ZERO)
            .unwrap();
        assert_eq!(cache.size().unwrap(), 1);

        let handle = spawn_sweep_task(cache.clone(), 1);

        // Wait for the sweep to run
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(cache.size().unwrap(), 0, "Expired entry should have been swept");

        handle.abort();
    }

    #[tokio::test]
    async fn test_sweep_task_preserves_valid_entries() {
        let cache = owned_cache();
        cache
            .insert_or_assign("long_lived", "10.0.0.2", Duration::from_secs(3600))
            .unwrap();

        let handle = spawn_sweep_task(cache.clone(), 1);

        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(
            cache.lookup("long_lived").unwrap().as_deref(),
            Some("10.0.0.2"),
            "Valid entry should not be removed"
        );

        handle.abort();
    }

    #[tokio::test]
    async fn test_sweep_task_can_be_aborted() {
        let cache = owned_cache();

        let handle = spawn_sweep_task(cache, 1);

        // Abort immediately
        handle.abort();

        // Wait a bit and verify task is finished
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.is_finished(), "Task should be finished after abort");
    }
}
