//! Tests for patch batching and commit scheduling.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{TimeZone, Utc};

use crate::{canonical_relay_url, HealthPatch, RelayStatus, RelayUrl};

use super::{CommitScheduler, FrameCommit, ImmediateCommit, UpdateBatcher};

fn url(raw: &str) -> RelayUrl {
    canonical_relay_url(raw).expect("fixture relays are canonical")
}

#[test]
fn first_patch_schedules_commit() {
    let _init_guard = relay_health_test::init();

    let mut batcher = UpdateBatcher::new();
    assert!(!batcher.is_scheduled());

    let connecting = HealthPatch {
        status: Some(RelayStatus::Connecting),
        ..HealthPatch::default()
    };

    assert!(batcher.observe(url("wss://a.example"), connecting.clone()));
    assert!(!batcher.observe(url("wss://b.example"), connecting.clone()));
    assert!(!batcher.observe(url("wss://a.example"), connecting.clone()));
    assert!(batcher.is_scheduled());
    assert_eq!(batcher.len(), 2);

    let pending = batcher.take_pending();
    assert_eq!(
        pending.keys().cloned().collect::<Vec<_>>(),
        vec![url("wss://a.example"), url("wss://b.example")],
    );
    assert!(!batcher.is_scheduled());
    assert!(batcher.is_empty());

    // The next patch starts a new batch
    assert!(batcher.observe(url("wss://a.example"), connecting));
}

#[test]
fn empty_patches_are_ignored() {
    let _init_guard = relay_health_test::init();

    let mut batcher = UpdateBatcher::new();

    assert!(!batcher.observe(url("wss://a.example"), HealthPatch::default()));
    assert!(!batcher.is_scheduled());
    assert!(batcher.is_empty());
}

/// Later fields win, and absent fields don't clobber earlier ones.
#[test]
fn patches_merge_in_call_order() {
    let _init_guard = relay_health_test::init();

    let mut batcher = UpdateBatcher::new();
    let relay = url("wss://a.example");
    let first = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
    let second = Utc.timestamp_opt(1_700_000_005, 0).unwrap();

    batcher.observe(
        relay.clone(),
        HealthPatch {
            status: Some(RelayStatus::Error),
            last_error: Some(Some("Disconnected".to_string())),
            last_event_at: Some(first),
        },
    );
    batcher.observe(
        relay.clone(),
        HealthPatch {
            last_error: Some(Some("rate limited".to_string())),
            ..HealthPatch::default()
        },
    );
    batcher.observe(
        relay.clone(),
        HealthPatch {
            status: Some(RelayStatus::Connecting),
            last_event_at: Some(second),
            ..HealthPatch::default()
        },
    );

    assert_eq!(
        batcher.pending_patch(&relay),
        Some(&HealthPatch {
            status: Some(RelayStatus::Connecting),
            last_error: Some(Some("rate limited".to_string())),
            last_event_at: Some(second),
        }),
    );
}

#[test]
fn immediate_commit_runs_synchronously() {
    let _init_guard = relay_health_test::init();

    let runs = Arc::new(AtomicUsize::new(0));
    let commit_runs = runs.clone();

    ImmediateCommit.schedule(Box::new(move || {
        commit_runs.fetch_add(1, Ordering::SeqCst);
    }));

    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn frame_commit_without_runtime_runs_synchronously() {
    let _init_guard = relay_health_test::init();

    let runs = Arc::new(AtomicUsize::new(0));
    let commit_runs = runs.clone();

    FrameCommit::new(Duration::from_millis(16)).schedule(Box::new(move || {
        commit_runs.fetch_add(1, Ordering::SeqCst);
    }));

    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn frame_commit_waits_one_frame() {
    let _init_guard = relay_health_test::init();

    let runs = Arc::new(AtomicUsize::new(0));
    let commit_runs = runs.clone();

    FrameCommit::new(Duration::from_millis(16)).schedule(Box::new(move || {
        commit_runs.fetch_add(1, Ordering::SeqCst);
    }));
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}
