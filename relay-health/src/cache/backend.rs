//! Storage backends for the relay health cache.

use std::{
    collections::HashMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use thiserror::Error;

use crate::constants::{CRITICAL_QUOTA_RATIO, ELEVATED_QUOTA_RATIO};

/// An error from a [`StorageBackend`].
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend has no space left for the value.
    #[error("storage quota exceeded")]
    QuotaExceeded,

    /// Reading or writing the backend failed.
    #[error("storage I/O error: {0}")]
    Io(io::Error),

    /// A value could not be encoded or decoded.
    #[error("storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<io::Error> for BackendError {
    fn from(error: io::Error) -> Self {
        if error.kind() == io::ErrorKind::StorageFull {
            BackendError::QuotaExceeded
        } else {
            BackendError::Io(error)
        }
    }
}

/// How close a [`StorageBackend`] is to running out of space.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QuotaPressure {
    /// There is plenty of space.
    #[default]
    Normal,

    /// Space is getting low.
    Elevated,

    /// Space is almost exhausted: callers should shrink what they store.
    Critical,
}

/// A string key-value store for the health cache.
///
/// Implementations must be cheap to call from the task that commits health
/// updates: they are only used for a single small value.
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Returns the value stored under `key`, or `None` if there is no value.
    fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<(), BackendError>;

    /// Removes any value stored under `key`. Removing a missing key succeeds.
    fn remove(&self, key: &str) -> Result<(), BackendError>;

    /// Returns the backend's current quota pressure.
    fn pressure(&self) -> QuotaPressure {
        QuotaPressure::Normal
    }

    /// Returns true if [`set`](StorageBackend::set) replaces the old value
    /// atomically, without holding both values at once.
    ///
    /// If this is false, callers remove the old value before writing the
    /// new one, so the backend never holds two copies.
    fn replaces_atomically(&self) -> bool {
        false
    }
}

/// A [`StorageBackend`] that stores each key as a JSON file in a directory.
///
/// Values are written to a temporary file in the same directory, then
/// renamed over the old file.
#[derive(Clone, Debug)]
pub struct FileBackend {
    dir: PathBuf,
    quota_bytes: Option<u64>,
}

impl FileBackend {
    /// Returns a backend that stores files in `dir`, using at most
    /// `quota_bytes` bytes for all of its files.
    ///
    /// The directory is created on the first write.
    pub fn new(dir: impl Into<PathBuf>, quota_bytes: Option<u64>) -> FileBackend {
        FileBackend {
            dir: dir.into(),
            quota_bytes,
        }
    }

    /// The directory this backend stores its files in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the file path for `key`.
    pub fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Returns the total size of the JSON files in the backend directory.
    fn used_bytes(&self) -> io::Result<u64> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(error) => return Err(error),
        };

        let mut used = 0;
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|extension| extension == "json") {
                used += fs::metadata(&path)?.len();
            }
        }

        Ok(used)
    }
}

impl StorageBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        match fs::read_to_string(self.path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        if let Some(quota) = self.quota_bytes {
            let path = self.path(key);
            let replaced = fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0);
            let other = self.used_bytes()?.saturating_sub(replaced);

            if other.saturating_add(value.len() as u64) > quota {
                return Err(BackendError::QuotaExceeded);
            }
        }

        fs::create_dir_all(&self.dir)?;

        // Create the temporary file next to the permanent file, hidden from
        // directory listings, so it can be renamed over it atomically.
        let mut tmp_file = tempfile::Builder::new()
            .prefix(&format!(".tmp.{key}."))
            .tempfile_in(&self.dir)?;

        tmp_file.write_all(value.as_bytes())?;
        tmp_file.as_file().sync_all()?;
        tmp_file
            .persist(self.path(key))
            .map_err(|error| BackendError::from(error.error))?;

        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), BackendError> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    fn pressure(&self) -> QuotaPressure {
        let Some(quota) = self.quota_bytes else {
            return QuotaPressure::Normal;
        };

        let used = match self.used_bytes() {
            Ok(used) => used,
            Err(error) => {
                debug!(?error, dir = ?self.dir, "could not measure relay health cache size");
                return QuotaPressure::Normal;
            }
        };

        let ratio = if quota == 0 {
            1.0
        } else {
            used as f64 / quota as f64
        };

        if ratio >= CRITICAL_QUOTA_RATIO {
            QuotaPressure::Critical
        } else if ratio >= ELEVATED_QUOTA_RATIO {
            QuotaPressure::Elevated
        } else {
            QuotaPressure::Normal
        }
    }

    fn replaces_atomically(&self) -> bool {
        true
    }
}

/// A failure that a [`MemoryBackend`] injects into its writes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InjectedFailure {
    /// Writes fail with [`BackendError::QuotaExceeded`].
    QuotaExceeded,

    /// Writes fail with [`BackendError::Io`].
    Io,
}

/// An in-memory [`StorageBackend`], used for ephemeral caches and tests.
///
/// Writes can be made to fail, and the reported quota pressure can be set.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    values: Mutex<HashMap<String, String>>,
    pressure: Mutex<QuotaPressure>,
    failure: Mutex<Option<InjectedFailure>>,
    writes: AtomicUsize,
}

impl MemoryBackend {
    /// Returns an empty in-memory backend.
    pub fn new() -> MemoryBackend {
        MemoryBackend::default()
    }

    /// Sets the quota pressure reported by [`StorageBackend::pressure`].
    pub fn set_pressure(&self, pressure: QuotaPressure) {
        *self.pressure.lock().expect("mutex should be unpoisoned") = pressure;
    }

    /// Makes every following write fail with `failure`, until it is cleared with `None`.
    pub fn set_failure(&self, failure: Option<InjectedFailure>) {
        *self.failure.lock().expect("mutex should be unpoisoned") = failure;
    }

    /// The number of successful [`set`](StorageBackend::set) calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Returns the value stored under `key`, bypassing error handling.
    pub fn value(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .expect("mutex should be unpoisoned")
            .get(key)
            .cloned()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        Ok(self.value(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        match *self.failure.lock().expect("mutex should be unpoisoned") {
            Some(InjectedFailure::QuotaExceeded) => return Err(BackendError::QuotaExceeded),
            Some(InjectedFailure::Io) => {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "injected failure").into())
            }
            None => {}
        }

        self.values
            .lock()
            .expect("mutex should be unpoisoned")
            .insert(key.to_string(), value.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);

        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), BackendError> {
        self.values
            .lock()
            .expect("mutex should be unpoisoned")
            .remove(key);

        Ok(())
    }

    fn pressure(&self) -> QuotaPressure {
        *self.pressure.lock().expect("mutex should be unpoisoned")
    }
}
