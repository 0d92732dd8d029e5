//! The relay health cache: bounded reads and writes of a single storage slot.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    canonical_relay_url, dedupe_records, Config, HealthRecord, PersistedHealthRecord,
    RelayStatus, Snapshot,
};

mod backend;

#[cfg(test)]
mod tests;

pub use backend::{
    BackendError, FileBackend, InjectedFailure, MemoryBackend, QuotaPressure, StorageBackend,
};

/// The outcome of a successful cache write.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WriteResult {
    /// The number of records in the stored value.
    pub persisted: usize,

    /// The size of the stored value, in bytes.
    pub bytes: usize,

    /// True if the value was truncated to the critical limit because the
    /// backend reported critical quota pressure.
    ///
    /// Callers should keep their working set at the critical limit until a
    /// later write reports [`QuotaPressure::Normal`].
    pub quota_limited: bool,

    /// The backend's quota pressure after the write.
    pub pressure: QuotaPressure,
}

/// The storage gateway for relay health.
///
/// Owns the cache's storage slot for the whole session. Once the backend
/// reports that its quota is exhausted, the cache stops writing until it is
/// recreated, which only happens on restart.
#[derive(Debug)]
pub struct HealthCache {
    backend: Arc<dyn StorageBackend>,
    key: String,
    max_relays: usize,
    critical_relays: usize,
    ttl: Duration,

    /// Latched when the backend runs out of quota. Never unlatched.
    storage_blocked: AtomicBool,
}

/// A cache entry as it is stored, before validation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHealthEntry {
    url: Option<String>,
    status: Option<String>,
    last_error: Option<String>,
    last_event_at: Option<i64>,
    updated_at: Option<i64>,
}

impl HealthCache {
    /// Returns a cache that stores relay health in `backend`, with the limits in `config`.
    pub fn new(backend: Arc<dyn StorageBackend>, config: &Config) -> HealthCache {
        HealthCache {
            backend,
            key: crate::constants::HEALTH_CACHE_KEY.to_string(),
            max_relays: config.max_cached_relays,
            critical_relays: config.critical_cached_relays,
            ttl: config.cache_ttl,
            storage_blocked: AtomicBool::new(false),
        }
    }

    /// Returns true if writes are disabled for the rest of the session.
    pub fn is_storage_blocked(&self) -> bool {
        self.storage_blocked.load(Ordering::SeqCst)
    }

    /// The backend this cache writes to.
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Writes `snapshot` to the cache.
    ///
    /// An empty snapshot removes the stored value. If the backend reports
    /// critical quota pressure after the write, and the snapshot is larger
    /// than the critical limit, the stored value is rewritten with only the
    /// most recent relays.
    ///
    /// Returns `None` if the write failed or writes are disabled. Failures
    /// are logged, never returned.
    pub fn write(&self, snapshot: &Snapshot) -> Option<WriteResult> {
        if self.is_storage_blocked() {
            trace!("skipping relay health write: storage is blocked for this session");
            return None;
        }

        if snapshot.is_empty() {
            if let Err(error) = self.backend.remove(&self.key) {
                self.write_failed(error);
                return None;
            }

            return Some(WriteResult {
                persisted: 0,
                bytes: 0,
                quota_limited: false,
                pressure: self.backend.pressure(),
            });
        }

        if let Err(error) = self.store(snapshot.serialized()) {
            self.write_failed(error);
            return None;
        }

        let pressure = self.backend.pressure();
        if pressure == QuotaPressure::Critical && snapshot.len() > self.critical_relays {
            let limited = snapshot.truncated(self.critical_relays);

            info!(
                relays = ?snapshot.len(),
                limit = ?self.critical_relays,
                "storage quota is critical, shrinking relay health cache",
            );

            if let Err(error) = self.store(limited.serialized()) {
                self.write_failed(error);
                return None;
            }

            return Some(WriteResult {
                persisted: limited.len(),
                bytes: limited.serialized().len(),
                quota_limited: true,
                pressure: self.backend.pressure(),
            });
        }

        Some(WriteResult {
            persisted: snapshot.len(),
            bytes: snapshot.serialized().len(),
            quota_limited: false,
            pressure,
        })
    }

    /// Replaces the stored value with `serialized`.
    ///
    /// # Correctness
    ///
    /// If the backend can't replace values atomically, the old value is
    /// removed first, so the backend never holds two copies. A failed write
    /// after the removal leaves the cache empty until the next successful
    /// write.
    fn store(&self, serialized: &str) -> Result<(), BackendError> {
        if !self.backend.replaces_atomically() {
            self.backend.remove(&self.key)?;
        }

        self.backend.set(&self.key, serialized)
    }

    /// Logs a write failure, and disables writes if the quota is exhausted.
    fn write_failed(&self, error: BackendError) {
        match error {
            BackendError::QuotaExceeded => {
                let already_blocked = self.storage_blocked.swap(true, Ordering::SeqCst);
                if !already_blocked {
                    info!(
                        "storage quota exhausted: relay health will not be cached \
                         until the next restart",
                    );
                }
            }
            error => warn!(?error, "failed to write relay health cache"),
        }
    }

    /// Reads the cached relay health, with times at millisecond resolution.
    ///
    /// See [`read_persisted`](HealthCache::read_persisted) for the filtering rules.
    pub fn read(&self, now: DateTime<Utc>) -> Option<Vec<HealthRecord>> {
        let persisted = self.read_persisted(now)?;

        Some(
            persisted
                .iter()
                .map(PersistedHealthRecord::to_health_record)
                .collect(),
        )
    }

    /// Reads the cached relay health in its persisted form.
    ///
    /// Entries with an invalid address or an unknown status are skipped.
    /// Entries whose newest event or update time is older than the TTL are
    /// dropped. The rest are deduplicated, ranked, and capped at the normal
    /// relay limit.
    ///
    /// Returns `None` if there is no cached value, or it can't be read or parsed.
    pub fn read_persisted(&self, now: DateTime<Utc>) -> Option<Vec<PersistedHealthRecord>> {
        let raw = match self.backend.get(&self.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(error) => {
                warn!(?error, "failed to read relay health cache");
                return None;
            }
        };

        let entries = match parse_entries(&raw) {
            Ok(entries) => entries,
            Err(error) => {
                warn!(?error, "ignoring malformed relay health cache");
                return None;
            }
        };

        let ttl = TimeDelta::from_std(self.ttl).unwrap_or(TimeDelta::MAX);
        let valid = entries.into_iter().filter_map(|entry| {
            let url = canonical_relay_url(entry.url.as_deref()?)?;
            let status = RelayStatus::from_name(entry.status.as_deref()?)?;

            let record = PersistedHealthRecord {
                url,
                status,
                last_error: entry.last_error,
                last_event_at: entry.last_event_at,
                updated_at: entry.updated_at,
            };

            if let Some(freshest) = record.freshest() {
                if now.signed_duration_since(freshest) > ttl {
                    return None;
                }
            }

            Some(record)
        });

        Some(dedupe_records(valid, self.max_relays))
    }
}

/// Parses the stored value into raw entries.
///
/// The value must be a JSON array. Elements that aren't entry objects are skipped.
fn parse_entries(raw: &str) -> Result<Vec<RawHealthEntry>, BackendError> {
    let values: Vec<serde_json::Value> = serde_json::from_str(raw)?;

    Ok(values
        .into_iter()
        .filter_map(|value| serde_json::from_value(value).ok())
        .collect())
}
