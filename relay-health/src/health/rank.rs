//! Deduplication and recency ranking of health records.

use std::collections::{hash_map::Entry, HashMap};

use crate::{HealthRecord, PersistedHealthRecord, RelayUrl};

/// A record that can be deduplicated by relay and ranked by recency.
pub trait Ranked {
    /// The relay this record describes.
    fn relay_url(&self) -> &RelayUrl;

    /// The time of the record's most recent event, in milliseconds.
    ///
    /// Records without an event time rank as `0`.
    fn last_event_millis(&self) -> i64;
}

impl Ranked for HealthRecord {
    fn relay_url(&self) -> &RelayUrl {
        &self.url
    }

    fn last_event_millis(&self) -> i64 {
        self.last_event_at
            .map(|time| time.timestamp_millis())
            .unwrap_or(0)
    }
}

impl Ranked for PersistedHealthRecord {
    fn relay_url(&self) -> &RelayUrl {
        &self.url
    }

    fn last_event_millis(&self) -> i64 {
        self.last_event_at
            .map(|secs| secs.saturating_mul(1000))
            .unwrap_or(0)
    }
}

/// Keeps the freshest record for each relay, ranks them from most to least
/// recently active, and returns at most `limit` of them.
///
/// When two records describe the same relay, the one with the later event
/// time wins. If the times are equal, the first record wins. Relays with
/// equal event times are ordered by address, so the output only depends on
/// the input.
pub fn dedupe_records<R: Ranked>(records: impl IntoIterator<Item = R>, limit: usize) -> Vec<R> {
    let mut freshest: HashMap<RelayUrl, R> = HashMap::new();

    for record in records {
        match freshest.entry(record.relay_url().clone()) {
            Entry::Occupied(mut entry) => {
                if record.last_event_millis() > entry.get().last_event_millis() {
                    entry.insert(record);
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(record);
            }
        }
    }

    let mut ranked: Vec<R> = freshest.into_values().collect();
    ranked.sort_by(|a, b| {
        b.last_event_millis()
            .cmp(&a.last_event_millis())
            .then_with(|| a.relay_url().cmp(b.relay_url()))
    });
    ranked.truncate(limit);

    ranked
}
