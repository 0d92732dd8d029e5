//! Configuration for relay health tracking and its cache.

use std::{path::PathBuf, sync::Arc, time::Duration};

use crate::{
    canonical_relay_url,
    constants::{
        COMMIT_FRAME, CRITICAL_CACHED_RELAYS, DEFAULT_FALLBACK_RELAYS, HEALTH_CACHE_TTL,
        MAX_CACHED_RELAYS, MIN_WRITE_INTERVAL, WRITE_IDLE_DELAY,
    },
    FileBackend, MemoryBackend, RelayUrl, StorageBackend,
};


/// Configuration for relay health tracking.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// The directory that holds the relay health cache file.
    ///
    /// The default directory is platform dependent, based on
    /// [`dirs::cache_dir()`](https://docs.rs/dirs/5.0.1/dirs/fn.cache_dir.html):
    ///
    /// |Platform | Value                                                         |
    /// | ------- | ------------------------------------------------------------- |
    /// | Linux   | `$XDG_CACHE_HOME/relay-health` or `$HOME/.cache/relay-health` |
    /// | macOS   | `$HOME/Library/Caches/relay-health`                           |
    /// | Windows | `{FOLDERID_LocalAppData}\relay-health`                        |
    /// | Other   | `./cache`                                                     |
    pub cache_dir: PathBuf,

    /// Whether to keep the cache in memory only.
    ///
    /// Set to `false` by default. If this is set to `true`, [`cache_dir`] is
    /// ignored, and relay health is not restored on the next start.
    ///
    /// [`cache_dir`]: struct.Config.html#structfield.cache_dir
    pub ephemeral: bool,

    /// Relays that always have a health row, even if they have never been observed.
    ///
    /// Invalid addresses are ignored.
    pub fallback_relays: Vec<String>,

    /// The maximum number of relays in the cache.
    pub max_cached_relays: usize,

    /// The maximum number of relays in the cache while storage is under
    /// critical quota pressure.
    pub critical_cached_relays: usize,

    /// The maximum number of bytes the cache directory can use.
    ///
    /// Set to `None` by default: the cache is only limited by
    /// [`max_cached_relays`](struct.Config.html#structfield.max_cached_relays).
    pub cache_quota_bytes: Option<u64>,

    /// Cached relays with no activity for this long are evicted.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,

    /// How long event updates are batched before they are committed.
    #[serde(with = "humantime_serde")]
    pub commit_frame: Duration,

    /// How long the health list must stay unchanged before it is written.
    #[serde(with = "humantime_serde")]
    pub write_idle_delay: Duration,

    /// The minimum time between cache writes.
    #[serde(with = "humantime_serde")]
    pub min_write_interval: Duration,
}

impl Config {
    /// Returns the storage backend for this config.
    pub fn storage_backend(&self) -> Arc<dyn StorageBackend> {
        if self.ephemeral {
            Arc::new(MemoryBackend::new())
        } else {
            Arc::new(FileBackend::new(
                self.cache_dir.clone(),
                self.cache_quota_bytes,
            ))
        }
    }

    /// Returns the canonical fallback relays, without duplicates, in config order.
    pub fn fallback_relay_urls(&self) -> Vec<RelayUrl> {
        let mut urls: Vec<RelayUrl> = Vec::with_capacity(self.fallback_relays.len());

        for raw in &self.fallback_relays {
            match canonical_relay_url(raw) {
                Some(url) if !urls.contains(&url) => urls.push(url),
                Some(_) => {}
                None => warn!(?raw, "ignoring invalid fallback relay address"),
            }
        }

        urls
    }
}

impl Default for Config {
    fn default() -> Self {
        let cache_dir = dirs::cache_dir()
            .map(|dir| dir.join("relay-health"))
            .unwrap_or_else(|| PathBuf::from("cache"));

        Self {
            cache_dir,
            ephemeral: false,
            fallback_relays: DEFAULT_FALLBACK_RELAYS
                .iter()
                .map(|relay| relay.to_string())
                .collect(),
            max_cached_relays: MAX_CACHED_RELAYS,
            critical_cached_relays: CRITICAL_CACHED_RELAYS,
            cache_quota_bytes: None,
            cache_ttl: HEALTH_CACHE_TTL,
            commit_frame: COMMIT_FRAME,
            write_idle_delay: WRITE_IDLE_DELAY,
            min_write_interval: MIN_WRITE_INTERVAL,
        }
    }
}
