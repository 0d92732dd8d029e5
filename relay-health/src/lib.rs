//! Connection health tracking for relays, with a bounded local cache.
//!
//! ## Design
//!
//! Relay connections are owned by a network collaborator, which reports
//! discrete lifecycle events for each relay: connecting, connected (or ready),
//! disconnected, and free-text notices. Events can arrive in bursts that are
//! much faster than any consumer wants to redraw, and the health list should
//! be visible immediately on the next start, before any connection succeeds.
//!
//! This crate turns that event stream into a consistent, read-only list of
//! [`HealthRecord`]s, and keeps a durable copy of that list in a single
//! storage slot.
//!
//! ### Components
//!
//! [`RelayUrl`]:
//!  * the canonical identity of a relay, so the same relay is never tracked twice
//!
//! [`dedupe_records`]:
//!  * keeps the freshest record for each relay, and ranks relays by recency
//!
//! [`Snapshot`]:
//!  * the storage-ready form of the health list
//!  * applies the cache TTL and keeps `updatedAt` stable for unchanged relays
//!
//! [`HealthCache`]:
//!  * reads and writes the storage slot through a [`StorageBackend`]
//!  * shrinks the stored list under quota pressure, and stops writing for the
//!    rest of the session once the quota is exhausted
//!
//! [`UpdateBatcher`] and [`CommitScheduler`]:
//!  * coalesce bursts of per-relay patches into one commit per frame
//!
//! [`WriteScheduler`]:
//!  * debounces cache writes, enforces a minimum interval between writes,
//!    and flushes on shutdown
//!
//! [`HealthStore`]:
//!  * owns the in-memory list, maps lifecycle events to patches, and
//!    publishes every commit to subscribers
//!
//! [`init`] is the main entry point: it loads the cache, seeds the store with
//! the fallback relays, and starts the event listener and write scheduler tasks.
//!
//! ### Failure model
//!
//! Nothing in this crate returns a storage error to its caller. A malformed
//! cache reads as empty, a failed write is logged and skipped, and an
//! exhausted quota disables writes for the rest of the session. Live health
//! keeps working in memory in every case.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

#[macro_use]
extern crate serde;
#[macro_use]
extern crate tracing;

/// A boxed [`std::error::Error`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub mod config;
pub mod constants;

mod batcher;
mod cache;
mod health;
mod relay_url;
mod snapshot;
mod store;
mod write_scheduler;

use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinHandle};

pub use crate::{
    batcher::{Commit, CommitScheduler, FrameCommit, ImmediateCommit, UpdateBatcher},
    cache::{
        BackendError, FileBackend, HealthCache, InjectedFailure, MemoryBackend, QuotaPressure,
        StorageBackend, WriteResult,
    },
    config::Config,
    health::{
        dedupe_records, HealthPatch, HealthRecord, PersistedHealthRecord, Ranked, RelayStatus,
    },
    relay_url::{canonical_relay_url, RelayUrl},
    snapshot::Snapshot,
    store::{
        seed_records, spawn_event_listener, AllEventSendersClosed, HealthStore, HealthSummary,
        RelayEvent, RelayEventKind,
    },
    write_scheduler::{next_write_delay, WriteScheduler, WriteSchedulerHandle},
};

/// Loads the health cache, seeds a [`HealthStore`], and spawns its background tasks.
///
/// Returns handles for:
/// - the health store, for subscribing to the health list,
/// - the event sender, for the network collaborator's lifecycle events,
/// - the write scheduler, which must be shut down to flush pending writes, and
/// - the event listener task.
///
/// The event listener exits with [`AllEventSendersClosed`] once every clone
/// of the returned sender is dropped. Shutting down the write scheduler
/// commits any events still waiting for their frame, then writes them.
///
/// Must be called from within a tokio runtime.
pub fn init(
    config: &Config,
) -> (
    HealthStore,
    mpsc::Sender<RelayEvent>,
    WriteSchedulerHandle,
    JoinHandle<Result<(), BoxError>>,
) {
    let cache = Arc::new(HealthCache::new(config.storage_backend(), config));
    let scheduler = Arc::new(FrameCommit::new(config.commit_frame));
    let store = HealthStore::load(config, &cache, scheduler);

    let (event_tx, event_rx) = mpsc::channel(constants::EVENT_CHANNEL_SIZE);
    let listener = spawn_event_listener(store.clone(), event_rx);

    let writer = WriteScheduler::new(config, cache).spawn(&store);

    (store, event_tx, writer, listener)
}
