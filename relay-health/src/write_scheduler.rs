//! Debounced, rate-limited cache writes.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing_futures::Instrument;

use crate::{
    BoxError, Config, HealthCache, HealthRecord, HealthStore, PersistedHealthRecord,
    QuotaPressure, RelayUrl, Snapshot, WriteResult,
};


/// Returns how long to wait before writing a change, if the last write was
/// `since_last_write` ago.
///
/// Changes always settle for `idle_delay`, and writes are at least
/// `min_interval` apart.
pub fn next_write_delay(
    idle_delay: Duration,
    min_interval: Duration,
    since_last_write: Duration,
) -> Duration {
    idle_delay.max(min_interval.saturating_sub(since_last_write))
}

/// Turns health list changes into cache writes.
///
/// Each change builds a snapshot immediately, and replaces any snapshot that
/// is still waiting to be written. Only the latest snapshot is written.
#[derive(Debug)]
pub struct WriteScheduler {
    cache: Arc<HealthCache>,

    /// The records from the last successful write, used to keep `updatedAt`
    /// stable for unchanged relays.
    previous: HashMap<RelayUrl, PersistedHealthRecord>,

    /// The serialized form of the last successful write.
    last_signature: Option<String>,

    /// When the last write was attempted, or when the scheduler was created.
    last_write: Instant,

    /// The snapshot waiting to be written.
    pending: Option<Snapshot>,

    /// The current relay limit. Shrinks under quota pressure.
    limit: usize,

    max_relays: usize,
    critical_relays: usize,
    ttl: Duration,
    idle_delay: Duration,
    min_interval: Duration,
}

impl WriteScheduler {
    /// Returns a scheduler that writes to `cache`.
    ///
    /// The current cache contents are used as the previous write. The
    /// minimum write interval starts counting now, so the first write
    /// happens at least that long after startup.
    pub fn new(config: &Config, cache: Arc<HealthCache>) -> WriteScheduler {
        let previous = cache
            .read_persisted(Utc::now())
            .unwrap_or_default()
            .into_iter()
            .map(|record| (record.url.clone(), record))
            .collect();

        WriteScheduler {
            cache,
            previous,
            last_signature: None,
            last_write: Instant::now(),
            pending: None,
            limit: config.max_cached_relays,
            max_relays: config.max_cached_relays,
            critical_relays: config.critical_cached_relays,
            ttl: config.cache_ttl,
            idle_delay: config.write_idle_delay,
            min_interval: config.min_write_interval,
        }
    }

    /// Builds the snapshot for `records` and makes it the pending write.
    ///
    /// Returns when the pending write should happen.
    pub fn stage(
        &mut self,
        records: &[HealthRecord],
        now: DateTime<Utc>,
        instant: Instant,
    ) -> Instant {
        let snapshot = Snapshot::build(records, &self.previous, self.limit, self.ttl, now);

        if self.pending.is_some() {
            trace!("replacing pending relay health write");
        }
        self.pending = Some(snapshot);

        let delay = next_write_delay(
            self.idle_delay,
            self.min_interval,
            instant.saturating_duration_since(self.last_write),
        );
        debug!(?delay, limit = ?self.limit, "scheduled relay health write");

        instant + delay
    }

    /// Writes the pending snapshot, if there is one.
    ///
    /// Skips the write if the snapshot is the same as the last successful write.
    pub fn flush(&mut self, instant: Instant) -> Option<WriteResult> {
        let snapshot = self.pending.take()?;

        if self.last_signature.as_deref() == Some(snapshot.serialized()) {
            debug!("relay health is unchanged since the last write, skipping it");
            return None;
        }

        self.last_write = instant;
        let result = self.cache.write(&snapshot)?;

        if result.quota_limited {
            if self.limit != self.critical_relays {
                info!(
                    limit = ?self.critical_relays,
                    "shrinking relay health cache limit under storage pressure",
                );
            }
            self.limit = self.critical_relays;
        } else if result.pressure == QuotaPressure::Normal && self.limit != self.max_relays {
            info!(limit = ?self.max_relays, "restoring relay health cache limit");
            self.limit = self.max_relays;
        }

        debug!(?result, "wrote relay health cache");

        // Remember what was actually stored, not what was staged.
        let stored = if result.quota_limited {
            snapshot.truncated(result.persisted)
        } else {
            snapshot
        };

        self.last_signature = Some(stored.serialized().to_string());
        self.previous = stored.into_by_url();

        Some(result)
    }

    /// Returns true if a snapshot is waiting to be written.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// The current relay limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Spawns a task that writes the changes published by `store`.
    ///
    /// The task stops when the returned handle is shut down or dropped, or
    /// when the health store is dropped. Before it stops, it commits the
    /// store's pending patches, and writes any pending change.
    pub fn spawn(mut self, store: &HealthStore) -> WriteSchedulerHandle {
        let mut records_rx = store.subscribe();
        let commit_pending = store.commit_hook();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let writer = async move {
            let mut deadline: Option<Instant> = None;

            loop {
                tokio::select! {
                    changed = records_rx.changed() => {
                        if changed.is_err() {
                            debug!("health store dropped, stopping relay health writes");
                            break;
                        }

                        let records = records_rx.borrow_and_update().clone();
                        deadline = Some(self.stage(&records, Utc::now(), Instant::now()));
                    }

                    _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        deadline = None;
                        self.flush(Instant::now());
                    }

                    _ = &mut shutdown_rx => break,
                }
            }

            // Patches still waiting for their frame would otherwise be lost.
            commit_pending();

            // Pick up changes that were committed after the last stage.
            if records_rx.has_changed().unwrap_or(false) {
                let records = records_rx.borrow_and_update().clone();
                self.stage(&records, Utc::now(), Instant::now());
            }

            if self.has_pending() {
                debug!("flushing pending relay health write before shutdown");
                self.flush(Instant::now());
            }
        };

        let task = tokio::spawn(writer.instrument(info_span!("relay_health_writer")));

        WriteSchedulerHandle {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }
}

/// A handle to a spawned [`WriteScheduler`] task.
///
/// Dropping the handle stops the task, after it writes any pending change.
#[derive(Debug)]
pub struct WriteSchedulerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl WriteSchedulerHandle {
    /// Stops the task, and waits for it to write any pending change.
    pub async fn shutdown(mut self) -> Result<(), BoxError> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            // The task might already have stopped.
            let _ = shutdown_tx.send(());
        }

        (&mut self.task).await?;

        Ok(())
    }

    /// Returns true if the task has stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
