//! Tests for the relay health cache and its backends.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, TimeDelta, TimeZone, Utc};

use relay_health_test::prelude::relay_url;

use crate::{
    constants::{CRITICAL_CACHED_RELAYS, HEALTH_CACHE_KEY, MAX_CACHED_RELAYS},
    BackendError, Config, FileBackend, HealthCache, HealthRecord, MemoryBackend, QuotaPressure,
    RelayStatus, RelayUrl, Snapshot, StorageBackend,
};

use super::InjectedFailure;

fn url(index: usize) -> RelayUrl {
    crate::canonical_relay_url(&relay_url(index)).expect("fixture relays are canonical")
}

fn now() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

/// Returns `count` connected relays, one second apart, the first one most recent.
fn connected_relays(count: usize) -> Vec<HealthRecord> {
    (0..count)
        .map(|index| HealthRecord {
            url: url(index),
            status: RelayStatus::Connected,
            last_error: None,
            last_event_at: Some(now() - TimeDelta::seconds(index as i64)),
        })
        .collect()
}

fn snapshot_of(records: &[HealthRecord]) -> Snapshot {
    let config = Config::default();
    Snapshot::build(
        records,
        &HashMap::new(),
        config.max_cached_relays,
        config.cache_ttl,
        now(),
    )
}

fn memory_cache() -> (Arc<MemoryBackend>, HealthCache) {
    let backend = Arc::new(MemoryBackend::new());
    let cache = HealthCache::new(backend.clone(), &Config::default());

    (backend, cache)
}

#[test]
fn write_then_read() {
    let _init_guard = relay_health_test::init();

    let (backend, cache) = memory_cache();
    let snapshot = snapshot_of(&connected_relays(5));

    let result = cache.write(&snapshot).expect("write succeeds");
    assert_eq!(result.persisted, 5);
    assert_eq!(result.bytes, snapshot.serialized().len());
    assert!(!result.quota_limited);
    assert_eq!(result.pressure, QuotaPressure::Normal);

    assert_eq!(
        backend.value(HEALTH_CACHE_KEY).as_deref(),
        Some(snapshot.serialized()),
    );
    assert_eq!(cache.read(now()), Some(connected_relays(5)));
}

/// Under critical pressure, a full write is cut down to the critical limit.
#[test]
fn critical_pressure_truncates_write() {
    let _init_guard = relay_health_test::init();

    let (backend, cache) = memory_cache();
    backend.set_pressure(QuotaPressure::Critical);

    let snapshot = snapshot_of(&connected_relays(MAX_CACHED_RELAYS));
    assert_eq!(snapshot.len(), MAX_CACHED_RELAYS);

    let result = cache.write(&snapshot).expect("write succeeds");
    assert!(result.quota_limited);
    assert_eq!(result.persisted, CRITICAL_CACHED_RELAYS);

    let stored = cache.read(now()).expect("cache is readable");
    assert_eq!(stored, connected_relays(CRITICAL_CACHED_RELAYS));

    // Written once in full, then once truncated
    assert_eq!(backend.write_count(), 2);
}

/// Small writes are not truncated, even under critical pressure.
#[test]
fn critical_pressure_keeps_small_writes() {
    let _init_guard = relay_health_test::init();

    let (backend, cache) = memory_cache();
    backend.set_pressure(QuotaPressure::Critical);

    let result = cache
        .write(&snapshot_of(&connected_relays(CRITICAL_CACHED_RELAYS)))
        .expect("write succeeds");

    assert!(!result.quota_limited);
    assert_eq!(result.persisted, CRITICAL_CACHED_RELAYS);
    assert_eq!(result.pressure, QuotaPressure::Critical);
    assert_eq!(backend.write_count(), 1);
}

/// Quota exhaustion disables writes for the rest of the session.
#[test]
fn quota_exhaustion_blocks_storage() {
    let _init_guard = relay_health_test::init();

    let (backend, cache) = memory_cache();
    let snapshot = snapshot_of(&connected_relays(3));

    backend.set_failure(Some(InjectedFailure::QuotaExceeded));
    assert_eq!(cache.write(&snapshot), None);
    assert!(cache.is_storage_blocked());

    // The latch holds even after the backend recovers
    backend.set_failure(None);
    assert_eq!(cache.write(&snapshot), None);
    assert_eq!(cache.write(&Snapshot::default()), None);
    assert_eq!(backend.write_count(), 0);
}

/// Other write errors are skipped without disabling later writes.
#[test]
fn io_errors_do_not_block_storage() {
    let _init_guard = relay_health_test::init();

    let (backend, cache) = memory_cache();
    let snapshot = snapshot_of(&connected_relays(3));

    backend.set_failure(Some(InjectedFailure::Io));
    assert_eq!(cache.write(&snapshot), None);
    assert!(!cache.is_storage_blocked());

    backend.set_failure(None);
    assert!(cache.write(&snapshot).is_some());
    assert_eq!(cache.read(now()).map(|records| records.len()), Some(3));
}

/// Backends without atomic replacement lose the old value if the new write fails.
#[test]
fn failed_write_after_clear_leaves_cache_empty() {
    let _init_guard = relay_health_test::init();

    let (backend, cache) = memory_cache();
    assert!(!backend.replaces_atomically());

    assert!(cache.write(&snapshot_of(&connected_relays(3))).is_some());

    backend.set_failure(Some(InjectedFailure::Io));
    assert_eq!(cache.write(&snapshot_of(&connected_relays(4))), None);

    assert_eq!(backend.value(HEALTH_CACHE_KEY), None);
    assert_eq!(cache.read(now()), None);
}

/// Empty snapshots remove the stored value instead of writing `[]`.
#[test]
fn empty_snapshot_removes_value() {
    let _init_guard = relay_health_test::init();

    let (backend, cache) = memory_cache();
    assert!(cache.write(&snapshot_of(&connected_relays(2))).is_some());

    let result = cache.write(&Snapshot::default()).expect("removal succeeds");
    assert_eq!(result.persisted, 0);
    assert!(!result.quota_limited);

    assert_eq!(backend.value(HEALTH_CACHE_KEY), None);
    assert_eq!(cache.read(now()), None);
}

#[test]
fn malformed_cache_reads_as_missing() {
    let _init_guard = relay_health_test::init();

    for raw in ["", "not json", "{}", "{\"url\":\"wss://a.example\"}", "42", "[1, 2"] {
        let (backend, cache) = memory_cache();
        backend.set(HEALTH_CACHE_KEY, raw).unwrap();

        assert_eq!(cache.read(now()), None, "unexpected read result for {raw:?}");
    }
}

/// Invalid entries are skipped, valid entries are normalized and kept.
#[test]
fn read_filters_entries() {
    let _init_guard = relay_health_test::init();

    let fresh = now().timestamp() - 60;
    let expired = (now() - TimeDelta::days(15)).timestamp();
    let raw = serde_json::json!([
        { "url": " wss://relay-0.example/ ", "status": "connected", "lastEventAt": fresh, "updatedAt": fresh },
        { "url": "wss://relay-1.example", "status": "ready", "lastEventAt": fresh },
        { "url": "", "status": "error" },
        { "status": "error" },
        { "url": "wss://relay-2.example", "status": "error", "lastEventAt": expired, "updatedAt": expired },
        { "url": "wss://relay-3.example", "status": "error", "lastEventAt": expired, "updatedAt": fresh },
        { "url": "wss://relay-4.example", "status": "error", "lastError": "Not connected" },
        17,
        "wss://relay-5.example",
    ]);

    let (backend, cache) = memory_cache();
    backend.set(HEALTH_CACHE_KEY, &raw.to_string()).unwrap();

    let records = cache.read(now()).expect("cache is readable");
    let urls: Vec<_> = records.iter().map(|record| record.url.clone()).collect();

    assert_eq!(urls, vec![url(0), url(3), url(4)]);
    assert_eq!(
        records[0].last_event_at.map(|time| time.timestamp_millis()),
        Some(fresh * 1000),
    );
    assert_eq!(records[2].last_error.as_deref(), Some("Not connected"));
}

/// Duplicate entries keep the freshest, and reads are capped at the normal limit.
#[test]
fn read_dedupes_and_caps() {
    let _init_guard = relay_health_test::init();

    let base = now().timestamp();
    let mut entries: Vec<_> = (0..MAX_CACHED_RELAYS + 10)
        .map(|index| {
            serde_json::json!({
                "url": relay_url(index),
                "status": "connected",
                "lastEventAt": base - index as i64,
            })
        })
        .collect();
    entries.push(serde_json::json!({
        "url": format!("{}/", relay_url(1)),
        "status": "error",
        "lastError": "Disconnected",
        "lastEventAt": base + 5,
    }));

    let (backend, cache) = memory_cache();
    backend
        .set(HEALTH_CACHE_KEY, &serde_json::Value::from(entries).to_string())
        .unwrap();

    let records = cache.read(now()).expect("cache is readable");
    assert_eq!(records.len(), MAX_CACHED_RELAYS);

    assert_eq!(records[0].url, url(1));
    assert_eq!(records[0].status, RelayStatus::Error);
    assert_eq!(records.iter().filter(|record| record.url == url(1)).count(), 1);
}

#[test]
fn file_backend_round_trip() {
    let _init_guard = relay_health_test::init();

    let dir = tempfile::tempdir().unwrap();
    let backend = FileBackend::new(dir.path().join("cache"), None);

    assert!(backend.replaces_atomically());
    assert_eq!(backend.get("missing").unwrap(), None);
    backend.remove("missing").unwrap();

    backend.set("key", "[1]").unwrap();
    backend.set("key", "[1,2]").unwrap();
    assert_eq!(backend.get("key").unwrap().as_deref(), Some("[1,2]"));
    assert!(backend.path("key").exists());

    backend.remove("key").unwrap();
    assert_eq!(backend.get("key").unwrap(), None);
    assert_eq!(backend.pressure(), QuotaPressure::Normal);
}

#[test]
fn file_backend_quota() {
    let _init_guard = relay_health_test::init();

    let dir = tempfile::tempdir().unwrap();
    let backend = FileBackend::new(dir.path(), Some(100));

    assert!(matches!(
        backend.set("key", &"x".repeat(101)),
        Err(BackendError::QuotaExceeded),
    ));
    assert_eq!(backend.get("key").unwrap(), None);

    backend.set("key", &"x".repeat(50)).unwrap();
    assert_eq!(backend.pressure(), QuotaPressure::Normal);

    // Replacing a value only counts the new size
    backend.set("key", &"x".repeat(80)).unwrap();
    assert_eq!(backend.pressure(), QuotaPressure::Elevated);

    backend.set("key", &"x".repeat(95)).unwrap();
    assert_eq!(backend.pressure(), QuotaPressure::Critical);
}

/// A file quota that is too small for the cache blocks storage for the session.
#[test]
fn file_quota_exhaustion_blocks_cache() {
    let _init_guard = relay_health_test::init();

    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FileBackend::new(dir.path(), Some(16)));
    let cache = HealthCache::new(backend.clone(), &Config::default());

    assert_eq!(cache.write(&snapshot_of(&connected_relays(3))), None);
    assert!(cache.is_storage_blocked());
    assert_eq!(backend.get(HEALTH_CACHE_KEY).unwrap(), None);
}
