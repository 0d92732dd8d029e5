//! Storage-ready snapshots of the relay health list.

use std::{cmp::Reverse, collections::HashMap, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    dedupe_records, health::datetime_from_secs, HealthRecord, PersistedHealthRecord, RelayUrl,
};


/// The persisted form of the health list at a point in time.
///
/// Holds the ordered records, their serialized form, and a lookup table that
/// the next snapshot uses to decide whether each record changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    records: Vec<PersistedHealthRecord>,
    serialized: String,
    by_url: HashMap<RelayUrl, PersistedHealthRecord>,
}

impl Snapshot {
    /// Builds a snapshot of `records`, using the `previous` persisted records to
    /// decide which entries actually changed.
    ///
    /// Keeps at most `limit` of the most recently active relays, and drops
    /// relays whose freshest known time is more than `ttl` before `now`.
    ///
    /// A relay's `updated_at` is only moved to `now` if its status, error, or
    /// event time differs from its previous persisted record. Otherwise the
    /// previous `updated_at` is kept, so unchanged relays still age out.
    ///
    /// Records are ordered by event time, then `updated_at`, newest first,
    /// then by address. The order is total, so equal inputs always serialize
    /// to equal bytes.
    pub fn build(
        records: &[HealthRecord],
        previous: &HashMap<RelayUrl, PersistedHealthRecord>,
        limit: usize,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Snapshot {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);

        // `RelayUrl`s are canonical by construction.
        let ranked = dedupe_records(records.iter().cloned(), limit);

        let mut persisted: Vec<PersistedHealthRecord> = ranked
            .into_iter()
            .filter_map(|record| {
                let previous = previous.get(&record.url);

                let freshest = record.last_event_at.or_else(|| {
                    previous
                        .and_then(|previous| previous.updated_at)
                        .and_then(datetime_from_secs)
                });
                if let Some(freshest) = freshest {
                    if now.signed_duration_since(freshest) > ttl {
                        trace!(url = %record.url, ?freshest, "evicting expired relay health");
                        return None;
                    }
                }

                let last_event_at = record.last_event_at.map(|time| time.timestamp());
                let unchanged = previous.is_some_and(|previous| {
                    previous.status == record.status
                        && previous.last_error == record.last_error
                        && previous.last_event_at == last_event_at
                });

                let updated_at = match previous {
                    Some(previous) if unchanged => previous
                        .updated_at
                        .or(last_event_at)
                        .unwrap_or_else(|| now.timestamp()),
                    _ => now.timestamp(),
                };

                Some(PersistedHealthRecord {
                    url: record.url,
                    status: record.status,
                    last_error: record.last_error,
                    last_event_at,
                    updated_at: Some(updated_at),
                })
            })
            .collect();

        persisted.sort_by(|a, b| {
            Reverse(a.last_event_at)
                .cmp(&Reverse(b.last_event_at))
                .then_with(|| Reverse(a.updated_at).cmp(&Reverse(b.updated_at)))
                .then_with(|| a.url.cmp(&b.url))
        });

        Snapshot::from_ordered(persisted)
    }

    /// Returns a snapshot of `records`, which must already be in snapshot order.
    fn from_ordered(records: Vec<PersistedHealthRecord>) -> Snapshot {
        let serialized = serialize_records(&records);
        let by_url = records
            .iter()
            .map(|record| (record.url.clone(), record.clone()))
            .collect();

        Snapshot {
            records,
            serialized,
            by_url,
        }
    }

    /// Returns a copy of this snapshot with only its `limit` most recent records.
    pub fn truncated(&self, limit: usize) -> Snapshot {
        Snapshot::from_ordered(self.records.iter().take(limit).cloned().collect())
    }

    /// The persisted records, most recent first.
    pub fn records(&self) -> &[PersistedHealthRecord] {
        &self.records
    }

    /// The serialized form of the records, as stored in the cache.
    ///
    /// An empty snapshot serializes as `[]`.
    pub fn serialized(&self) -> &str {
        &self.serialized
    }

    /// The persisted records, keyed by relay.
    pub fn by_url(&self) -> &HashMap<RelayUrl, PersistedHealthRecord> {
        &self.by_url
    }

    /// Consumes the snapshot, returning its records keyed by relay.
    pub fn into_by_url(self) -> HashMap<RelayUrl, PersistedHealthRecord> {
        self.by_url
    }

    /// The number of persisted records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if there are no persisted records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot::from_ordered(Vec::new())
    }
}

/// Serializes `records` as a JSON array.
fn serialize_records(records: &[PersistedHealthRecord]) -> String {
    match serde_json::to_string(records) {
        Ok(serialized) => serialized,
        Err(error) => {
            // Every field is a string, an integer, or a unit enum.
            warn!(?error, "unexpected relay health serialization failure");
            "[]".to_string()
        }
    }
}
