//! The relay health store: the in-memory health list, and the events that update it.

use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, Weak},
};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing_futures::Instrument;

use crate::{
    canonical_relay_url, constants::DISCONNECTED_MESSAGE, BoxError, CommitScheduler, Config,
    HealthCache, HealthPatch, HealthRecord, RelayStatus, RelayUrl, UpdateBatcher,
};


/// A lifecycle event for a single relay, reported by the network collaborator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayEvent {
    /// The relay's address, as the collaborator knows it.
    ///
    /// Addresses are canonicalized by the store.
    pub relay: String,

    /// What happened to the relay.
    pub kind: RelayEventKind,
}

/// The kinds of [`RelayEvent`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayEventKind {
    /// A connection attempt started.
    Connecting {
        /// When the event was observed.
        at: DateTime<Utc>,
    },

    /// The connection was established.
    Connected {
        /// When the event was observed.
        at: DateTime<Utc>,
    },

    /// The connection is ready for requests.
    ///
    /// Treated the same as [`RelayEventKind::Connected`].
    Ready {
        /// When the event was observed.
        at: DateTime<Utc>,
    },

    /// The connection closed or failed.
    Disconnected {
        /// When the event was observed.
        at: DateTime<Utc>,
    },

    /// The relay sent a human-readable notice.
    Notice {
        /// The notice text.
        message: String,
    },
}

impl RelayEvent {
    /// Returns a [`RelayEventKind::Connecting`] event for `relay`.
    pub fn connecting(relay: impl Into<String>, at: DateTime<Utc>) -> RelayEvent {
        RelayEvent {
            relay: relay.into(),
            kind: RelayEventKind::Connecting { at },
        }
    }

    /// Returns a [`RelayEventKind::Connected`] event for `relay`.
    pub fn connected(relay: impl Into<String>, at: DateTime<Utc>) -> RelayEvent {
        RelayEvent {
            relay: relay.into(),
            kind: RelayEventKind::Connected { at },
        }
    }

    /// Returns a [`RelayEventKind::Ready`] event for `relay`.
    pub fn ready(relay: impl Into<String>, at: DateTime<Utc>) -> RelayEvent {
        RelayEvent {
            relay: relay.into(),
            kind: RelayEventKind::Ready { at },
        }
    }

    /// Returns a [`RelayEventKind::Disconnected`] event for `relay`.
    pub fn disconnected(relay: impl Into<String>, at: DateTime<Utc>) -> RelayEvent {
        RelayEvent {
            relay: relay.into(),
            kind: RelayEventKind::Disconnected { at },
        }
    }

    /// Returns a [`RelayEventKind::Notice`] event for `relay`.
    pub fn notice(relay: impl Into<String>, message: impl Into<String>) -> RelayEvent {
        RelayEvent {
            relay: relay.into(),
            kind: RelayEventKind::Notice {
                message: message.into(),
            },
        }
    }
}

/// The error the event listener task exits with, once every event sender is dropped.
#[derive(Copy, Clone, Debug, Error, Eq, PartialEq, Hash)]
#[error("all relay event senders are closed")]
pub struct AllEventSendersClosed;

/// The number of relays in each status.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct HealthSummary {
    /// Relays with a connection attempt in progress.
    pub connecting: usize,

    /// Connected relays.
    pub connected: usize,

    /// Relays that disconnected, failed, or were never connected.
    pub error: usize,
}

impl HealthSummary {
    /// The total number of relays.
    pub fn total(&self) -> usize {
        self.connecting + self.connected + self.error
    }
}

impl fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} connected, {} connecting, {} failed",
            self.connected, self.connecting, self.error,
        )
    }
}

/// Returns the startup health list: the `loaded` cache records, followed by
/// a placeholder for each fallback relay that isn't in the cache.
///
/// Fallback placeholders have [`RelayStatus::Error`], the "Not connected"
/// message, and no event time.
pub fn seed_records(loaded: Option<Vec<HealthRecord>>, fallbacks: &[RelayUrl]) -> Vec<HealthRecord> {
    let mut records = loaded.unwrap_or_default();
    let mut seen: HashSet<RelayUrl> = records.iter().map(|record| record.url.clone()).collect();

    for url in fallbacks {
        if seen.insert(url.clone()) {
            records.push(HealthRecord::new_unconnected(url.clone()));
        }
    }

    records
}

/// The owner of the in-memory relay health list.
///
/// Events are mapped to patches, batched by the [`CommitScheduler`], and
/// committed together. Every commit publishes the new list to subscribers.
///
/// Cloning the store returns another handle to the same list.
#[derive(Clone)]
pub struct HealthStore {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<StoreState>,
    records_tx: watch::Sender<Arc<[HealthRecord]>>,
    scheduler: Arc<dyn CommitScheduler>,
}

struct StoreState {
    /// The committed records, at most one per relay.
    records: IndexMap<RelayUrl, HealthRecord>,

    batcher: UpdateBatcher,

    /// The number of state transitions published since the store was created.
    commit_count: usize,
}

impl fmt::Debug for HealthStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();

        f.debug_struct("HealthStore")
            .field("records", &state.records.len())
            .field("pending", &state.batcher.len())
            .field("commit_count", &state.commit_count)
            .field("scheduler", &self.shared.scheduler)
            .finish()
    }
}

impl HealthStore {
    /// Returns a store that starts with the `initial` records, and batches
    /// updates using `scheduler`.
    ///
    /// If `initial` has more than one record for a relay, the first one is kept.
    pub fn new(initial: Vec<HealthRecord>, scheduler: Arc<dyn CommitScheduler>) -> HealthStore {
        let mut records = IndexMap::with_capacity(initial.len());
        for record in initial {
            records.entry(record.url.clone()).or_insert(record);
        }

        let (records_tx, _records_rx) = watch::channel(published(&records));

        HealthStore {
            shared: Arc::new(Shared {
                state: Mutex::new(StoreState {
                    records,
                    batcher: UpdateBatcher::new(),
                    commit_count: 0,
                }),
                records_tx,
                scheduler,
            }),
        }
    }

    /// Returns a store seeded from `cache`, with placeholders for the
    /// configured fallback relays.
    pub fn load(
        config: &Config,
        cache: &HealthCache,
        scheduler: Arc<dyn CommitScheduler>,
    ) -> HealthStore {
        let loaded = cache.read(Utc::now());
        info!(
            cached_relays = ?loaded.as_ref().map(Vec::len),
            fallback_relays = ?config.fallback_relays.len(),
            "loaded relay health cache",
        );

        HealthStore::new(
            seed_records(loaded, &config.fallback_relay_urls()),
            scheduler,
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.shared
            .state
            .lock()
            .expect("mutex should be unpoisoned")
    }

    /// Records a lifecycle event.
    ///
    /// The change becomes visible at the next commit. Events for relays that
    /// aren't in the list add them. Invalid addresses are ignored.
    pub fn observe(&self, event: RelayEvent) {
        let Some(url) = canonical_relay_url(&event.relay) else {
            warn!(relay = ?event.relay, "ignoring event for invalid relay address");
            return;
        };

        let must_schedule = {
            let mut state = self.lock();

            let Some(patch) = state.event_patch(&url, event.kind) else {
                trace!(%url, "ignoring repeated relay notice");
                return;
            };

            trace!(%url, ?patch, "observed relay health change");
            state.batcher.observe(url, patch)
        };

        // The lock must be released here, because commits can run synchronously.
        if must_schedule {
            let shared = Arc::downgrade(&self.shared);
            self.shared
                .scheduler
                .schedule(Box::new(move || commit_shared(&shared)));
        }
    }

    /// Applies all pending patches, and publishes the new list if anything changed.
    ///
    /// Scheduled commits call this automatically. Calling it with no
    /// pending patches does nothing.
    pub fn commit(&self) {
        self.shared.commit();
    }

    /// Removes the records for relays that aren't in `relays`, and publishes
    /// the new list if anything was removed.
    ///
    /// Pending patches for removed relays are dropped.
    pub fn retain_relays(&self, relays: impl IntoIterator<Item = RelayUrl>) {
        let relays: HashSet<RelayUrl> = relays.into_iter().collect();
        let mut state = self.lock();

        state.batcher.retain(|url| relays.contains(url));

        let before = state.records.len();
        state.records.retain(|url, _| relays.contains(url));
        let removed = before - state.records.len();

        if removed > 0 {
            debug!(?removed, "removed relays from the health list");
            state.commit_count += 1;
            self.shared
                .records_tx
                .send_replace(published(&state.records));
        }
    }

    /// Returns a function that commits this store's pending patches.
    ///
    /// The function does not keep the store alive: once every handle is
    /// dropped, it does nothing.
    pub fn commit_hook(&self) -> impl Fn() + Send + Sync + 'static {
        let shared = Arc::downgrade(&self.shared);
        move || commit_shared(&shared)
    }

    /// Returns a receiver for the health list, which is updated after every commit.
    pub fn subscribe(&self) -> watch::Receiver<Arc<[HealthRecord]>> {
        self.shared.records_tx.subscribe()
    }

    /// Returns the latest committed health list.
    pub fn records(&self) -> Arc<[HealthRecord]> {
        self.shared.records_tx.borrow().clone()
    }

    /// The number of state transitions since the store was created.
    pub fn commit_count(&self) -> usize {
        self.lock().commit_count
    }

    /// Returns true if there are uncommitted patches.
    pub fn has_pending(&self) -> bool {
        !self.lock().batcher.is_empty()
    }

    /// Returns the number of committed relays in each status.
    pub fn summary(&self) -> HealthSummary {
        let state = self.lock();

        state
            .records
            .values()
            .fold(HealthSummary::default(), |mut summary, record| {
                match record.status {
                    RelayStatus::Connecting => summary.connecting += 1,
                    RelayStatus::Connected => summary.connected += 1,
                    RelayStatus::Error => summary.error += 1,
                }
                summary
            })
    }
}

impl Shared {
    fn commit(&self) {
        let mut state = self.state.lock().expect("mutex should be unpoisoned");

        let pending = state.batcher.take_pending();
        if pending.is_empty() {
            return;
        }

        let relays = pending.len();
        for (url, patch) in pending {
            state
                .records
                .entry(url.clone())
                .or_insert_with(|| HealthRecord::new_observed(url))
                .apply(&patch);
        }

        state.commit_count += 1;
        trace!(?relays, commit = ?state.commit_count, "committed relay health");

        // Published under the lock, so subscribers see commits in order.
        self.records_tx.send_replace(published(&state.records));
    }
}

impl StoreState {
    /// Maps `kind` to a patch for `url`.
    ///
    /// Returns `None` if the event doesn't change anything: a notice that
    /// repeats the relay's current error.
    fn event_patch(&self, url: &RelayUrl, kind: RelayEventKind) -> Option<HealthPatch> {
        let patch = match kind {
            RelayEventKind::Connecting { at } => HealthPatch {
                status: Some(RelayStatus::Connecting),
                last_error: None,
                last_event_at: Some(at),
            },
            RelayEventKind::Connected { at } | RelayEventKind::Ready { at } => HealthPatch {
                status: Some(RelayStatus::Connected),
                last_error: Some(None),
                last_event_at: Some(at),
            },
            RelayEventKind::Disconnected { at } => HealthPatch {
                status: Some(RelayStatus::Error),
                last_error: Some(Some(DISCONNECTED_MESSAGE.to_string())),
                last_event_at: Some(at),
            },
            RelayEventKind::Notice { message } => {
                // Pending errors win over committed ones.
                let current = match self
                    .batcher
                    .pending_patch(url)
                    .and_then(|patch| patch.last_error.as_ref())
                {
                    Some(pending) => pending.as_deref(),
                    None => self
                        .records
                        .get(url)
                        .and_then(|record| record.last_error.as_deref()),
                };

                if current == Some(message.as_str()) {
                    return None;
                }

                HealthPatch {
                    last_error: Some(Some(message)),
                    ..HealthPatch::default()
                }
            }
        };

        Some(patch)
    }
}

fn commit_shared(shared: &Weak<Shared>) {
    match shared.upgrade() {
        Some(shared) => shared.commit(),
        None => trace!("health store dropped before its scheduled commit"),
    }
}

fn published(records: &IndexMap<RelayUrl, HealthRecord>) -> Arc<[HealthRecord]> {
    records.values().cloned().collect()
}

/// Spawns a task that feeds the events from `events` into `store`.
///
/// The task exits with [`AllEventSendersClosed`] once every sender is dropped.
pub fn spawn_event_listener(
    store: HealthStore,
    mut events: mpsc::Receiver<RelayEvent>,
) -> JoinHandle<Result<(), BoxError>> {
    let listener = async move {
        info!("starting the relay event listener");

        while let Some(event) = events.recv().await {
            trace!(?event, "got relay event");
            store.observe(event);
        }

        let error: Result<(), BoxError> = Err(AllEventSendersClosed.into());
        info!(?error, summary = %store.summary(), "stopping the relay event listener");
        error
    };

    tokio::spawn(listener.instrument(info_span!("relay_events")))
}
