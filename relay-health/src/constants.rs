//! Definitions of constants.

use std::time::Duration;

/// The storage key that holds the relay health cache.
///
/// This key is owned by this crate: nothing else reads or writes it.
/// The file backend stores it as `<key>.json`.
pub const HEALTH_CACHE_KEY: &str = "relay-health.v1";

/// The maximum number of relays kept in the health cache.
pub const MAX_CACHED_RELAYS: usize = 60;

/// The maximum number of relays kept in the health cache while the storage
/// backend reports critical quota pressure.
pub const CRITICAL_CACHED_RELAYS: usize = 24;

/// Cached health records older than this are evicted, regardless of status.
pub const HEALTH_CACHE_TTL: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// How long event patches wait before they are committed as a single batch.
///
/// This is one display frame at 60 Hz.
pub const COMMIT_FRAME: Duration = Duration::from_millis(16);

/// How long the health list must stay unchanged before it is written to the cache.
pub const WRITE_IDLE_DELAY: Duration = Duration::from_millis(1_500);

/// The minimum time between two cache writes.
pub const MIN_WRITE_INTERVAL: Duration = Duration::from_secs(15);

/// The error message recorded when a relay disconnects.
pub const DISCONNECTED_MESSAGE: &str = "Disconnected";

/// The error message for fallback relays that have never been observed.
pub const NOT_CONNECTED_MESSAGE: &str = "Not connected";

/// The size of the lifecycle event channel between the network collaborator
/// and the health store.
pub const EVENT_CHANNEL_SIZE: usize = 256;

/// File backends report [`QuotaPressure::Critical`](crate::QuotaPressure::Critical)
/// once this fraction of their byte quota is used.
pub const CRITICAL_QUOTA_RATIO: f64 = 0.9;

/// File backends report [`QuotaPressure::Elevated`](crate::QuotaPressure::Elevated)
/// once this fraction of their byte quota is used.
pub const ELEVATED_QUOTA_RATIO: f64 = 0.75;

/// The well-known relays that always have a health row, even before any
/// connection attempt.
pub const DEFAULT_FALLBACK_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.primal.net",
];

#[cfg(test)]
mod tests {
    use static_assertions::const_assert;

    use super::*;

    /// The critical cap must actually shrink the cache.
    #[test]
    fn critical_cache_limit_is_smaller() {
        const_assert!(CRITICAL_CACHED_RELAYS < MAX_CACHED_RELAYS);
        const_assert!(CRITICAL_CACHED_RELAYS > 0);
    }

    /// Writes must settle before they hit the rate limit, or every write
    /// would wait for the full interval.
    #[test]
    fn write_delays_are_consistent() {
        assert!(WRITE_IDLE_DELAY < MIN_WRITE_INTERVAL);
        assert!(COMMIT_FRAME < WRITE_IDLE_DELAY);
        assert!(ELEVATED_QUOTA_RATIO < CRITICAL_QUOTA_RATIO);
        assert!(CRITICAL_QUOTA_RATIO <= 1.0);
    }

    /// Fallback relays are stored in canonical form.
    #[test]
    fn fallback_relays_are_canonical() {
        for relay in DEFAULT_FALLBACK_RELAYS {
            assert_eq!(
                crate::canonical_relay_url(relay).as_deref(),
                Some(*relay),
                "fallback relays must not need normalization",
            );
        }
    }
}
