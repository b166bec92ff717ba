//! Integration Tests for the Cache Service
//!
//! Exercises the public API end to end over real named shared memory.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::sleep;
use std::time::Duration;

use hostname_cache::{CacheError, Config, HostnameCache};

// == Helper Functions ==

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

fn unique_name() -> String {
    format!(
        "/hc-it-svc-{}-{}",
        std::process::id(),
        NEXT_ID.fetch_add(1, Ordering::Relaxed)
    )
}

fn create_test_cache() -> HostnameCache {
    let config = Config {
        segment_name: unique_name(),
        segment_size: 512 * 1024,
        ..Config::default()
    };
    HostnameCache::from_config(&config).unwrap()
}

const HOUR: Duration = Duration::from_secs(3600);

// == Lifecycle Tests ==

#[test]
fn test_from_config_owns_segment() {
    let cache = create_test_cache();

    assert!(cache.is_initialized());
    assert!(cache.is_owner());
    assert_eq!(cache.size().unwrap(), 0);
    assert!(cache.available_memory().unwrap() > 0);
}

#[test]
fn test_name_without_leading_slash_is_normalised() {
    let bare = unique_name().trim_start_matches('/').to_string();
    let mut cache = HostnameCache::new();

    cache.init(&bare, 64 * 1024).unwrap();

    assert_eq!(cache.segment_name(), Some(format!("/{bare}").as_str()));
    let attached = HostnameCache::attach(&bare, None).unwrap();
    cache.insert_or_assign("host1", "1.2.3.4", HOUR).unwrap();
    assert_eq!(attached.lookup("host1").unwrap().as_deref(), Some("1.2.3.4"));
}

#[test]
fn test_segment_too_small_is_rejected() {
    let mut cache = HostnameCache::new();

    assert!(cache.init(&unique_name(), 16).is_err());
    assert!(!cache.is_initialized());
}

#[test]
fn test_reinit_by_new_owner_starts_empty() {
    let name = unique_name();
    let mut first = HostnameCache::new();
    first.init(&name, 64 * 1024).unwrap();
    first.insert_or_assign("host1", "1.2.3.4", HOUR).unwrap();

    let mut second = HostnameCache::new();
    second.init(&name, 64 * 1024).unwrap();

    assert_eq!(second.size().unwrap(), 0);
    assert_eq!(second.lookup("host1").unwrap(), None);

    // Tearing down the replaced session leaves the new one reachable.
    second.insert_or_assign("host2", "5.6.7.8", HOUR).unwrap();
    drop(first);
    let attached = HostnameCache::attach(&name, None).unwrap();
    assert_eq!(attached.lookup("host2").unwrap().as_deref(), Some("5.6.7.8"));
}

#[test]
fn test_attach_to_missing_segment_fails() {
    let result = HostnameCache::attach(&unique_name(), None);

    assert!(matches!(result, Err(CacheError::SegmentOpen { .. })));
}

// == Operation Tests ==

#[test]
fn test_insert_lookup_erase_cycle() {
    let cache = create_test_cache();

    assert!(cache.insert_or_assign("db.internal", "10.1.2.3", HOUR).unwrap());
    assert_eq!(cache.lookup("db.internal").unwrap().as_deref(), Some("10.1.2.3"));

    assert!(cache.erase("db.internal").unwrap());
    assert_eq!(cache.lookup("db.internal").unwrap(), None);
    assert_eq!(cache.size().unwrap(), 0);
}

#[test]
fn test_keys_are_case_sensitive() {
    let cache = create_test_cache();

    cache.insert_or_assign("Host", "1.1.1.1", HOUR).unwrap();
    cache.insert_or_assign("host", "2.2.2.2", HOUR).unwrap();

    assert_eq!(cache.size().unwrap(), 2);
    assert_eq!(cache.lookup("Host").unwrap().as_deref(), Some("1.1.1.1"));
    assert_eq!(cache.lookup("host").unwrap().as_deref(), Some("2.2.2.2"));
}

#[test]
fn test_entry_expires_after_ttl() {
    let cache = create_test_cache();
    cache
        .insert_or_assign("short", "10.0.0.1", Duration::from_secs(1))
        .unwrap();
    assert_eq!(cache.lookup("short").unwrap().as_deref(), Some("10.0.0.1"));

    sleep(Duration::from_millis(2100));

    assert_eq!(cache.lookup("short").unwrap(), None);
    assert_eq!(cache.size().unwrap(), 1);
    assert_eq!(cache.erase_expired_entries().unwrap(), 1);
    assert_eq!(cache.size().unwrap(), 0);
}

#[test]
fn test_max_length_alias_round_trips() {
    let cache = create_test_cache();
    let alias = "a".repeat(255);

    cache.insert_or_assign("long", &alias, HOUR).unwrap();

    assert_eq!(cache.lookup("long").unwrap(), Some(alias));
}

#[test]
fn test_stats_serialize_to_json() {
    let cache = create_test_cache();
    cache.insert_or_assign("host1", "1.2.3.4", HOUR).unwrap();
    cache.lookup("host1").unwrap();

    let json = serde_json::to_value(cache.stats().unwrap()).unwrap();

    assert_eq!(json["total_entries"], 1);
    assert_eq!(json["hits"], 1);
    assert_eq!(json["segment_size"], 512 * 1024);
    assert!(json["captured_at"].is_string());
}

#[test]
fn test_deinit_then_operations_fail() {
    let mut cache = create_test_cache();

    cache.deinit();

    assert!(matches!(cache.lookup("host1"), Err(CacheError::NotInitialized)));
    assert!(matches!(cache.clear(), Err(CacheError::NotInitialized)));
}
