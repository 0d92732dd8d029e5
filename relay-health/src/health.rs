//! Relay health records, the patches that update them, and their persisted form.

use chrono::{DateTime, TimeZone, Utc};

use crate::{constants::NOT_CONNECTED_MESSAGE, RelayUrl};

mod rank;

#[cfg(test)]
mod tests;

pub use rank::{dedupe_records, Ranked};

/// The connection status of a relay.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayStatus {
    /// A connection attempt is in progress.
    Connecting,

    /// The relay is connected and ready.
    Connected,

    /// The relay disconnected, failed, or has not been connected yet.
    Error,
}

impl RelayStatus {
    /// Returns the status with the persisted `name`, or `None` for unknown names.
    pub fn from_name(name: &str) -> Option<RelayStatus> {
        match name {
            "connecting" => Some(RelayStatus::Connecting),
            "connected" => Some(RelayStatus::Connected),
            "error" => Some(RelayStatus::Error),
            _ => None,
        }
    }
}

/// The in-memory health of a single relay.
///
/// This is the authoritative form: the list published by
/// [`HealthStore`](crate::HealthStore) holds at most one record per [`RelayUrl`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    /// The relay's canonical identity.
    pub url: RelayUrl,

    /// The relay's current connection status.
    pub status: RelayStatus,

    /// The most recent error or notice, cleared when the relay connects.
    pub last_error: Option<String>,

    /// When the most recent lifecycle event for this relay was observed.
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub last_event_at: Option<DateTime<Utc>>,
}

impl HealthRecord {
    /// Returns a record for a relay that was just observed, with no other information.
    pub fn new_observed(url: RelayUrl) -> HealthRecord {
        HealthRecord {
            url,
            status: RelayStatus::Connecting,
            last_error: None,
            last_event_at: None,
        }
    }

    /// Returns a placeholder record for a fallback relay that has never been observed.
    pub fn new_unconnected(url: RelayUrl) -> HealthRecord {
        HealthRecord {
            url,
            status: RelayStatus::Error,
            last_error: Some(NOT_CONNECTED_MESSAGE.to_string()),
            last_event_at: None,
        }
    }

    /// Applies the fields present in `patch` to this record.
    pub fn apply(&mut self, patch: &HealthPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(last_error) = &patch.last_error {
            self.last_error = last_error.clone();
        }
        if let Some(last_event_at) = patch.last_event_at {
            self.last_event_at = Some(last_event_at);
        }
    }
}

/// A partial update to a relay's health.
///
/// Absent fields leave the record unchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HealthPatch {
    /// The new status, if it changed.
    pub status: Option<RelayStatus>,

    /// The new error message: `Some(None)` clears the error.
    pub last_error: Option<Option<String>>,

    /// The time of the event that produced this patch.
    pub last_event_at: Option<DateTime<Utc>>,
}

impl HealthPatch {
    /// Merges a `later` patch into this one.
    ///
    /// Fields present in `later` win. Fields absent from `later` keep their
    /// earlier values.
    pub fn merge(&mut self, later: HealthPatch) {
        if later.status.is_some() {
            self.status = later.status;
        }
        if later.last_error.is_some() {
            self.last_error = later.last_error;
        }
        if later.last_event_at.is_some() {
            self.last_event_at = later.last_event_at;
        }
    }

    /// Returns true if this patch does not change anything.
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.last_error.is_none() && self.last_event_at.is_none()
    }
}

/// The durable form of a [`HealthRecord`].
///
/// Times are stored at second resolution. `updated_at` records when the
/// persisted record last changed, which is not the same as the last event:
/// repeated identical observations do not refresh it, so they do not keep
/// the record alive past the cache TTL.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedHealthRecord {
    /// The relay's canonical identity.
    pub url: RelayUrl,

    /// The relay's connection status when it was persisted.
    pub status: RelayStatus,

    /// The relay's error message when it was persisted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// When the most recent lifecycle event was observed, in seconds since the epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<i64>,

    /// When this persisted record last changed, in seconds since the epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl PersistedHealthRecord {
    /// Returns the newest of the event and update times, if either is known.
    pub fn freshest(&self) -> Option<DateTime<Utc>> {
        self.last_event_at
            .max(self.updated_at)
            .and_then(datetime_from_secs)
    }

    /// Returns the in-memory form of this record.
    ///
    /// Sub-second precision was dropped when the record was persisted, so the
    /// event time comes back truncated to the second.
    pub fn to_health_record(&self) -> HealthRecord {
        HealthRecord {
            url: self.url.clone(),
            status: self.status,
            last_error: self.last_error.clone(),
            last_event_at: self.last_event_at.and_then(datetime_from_secs),
        }
    }
}

/// Converts seconds since the epoch into a UTC time, if it is in range.
pub(crate) fn datetime_from_secs(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}
