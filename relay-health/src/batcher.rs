//! Coalescing bursts of relay health patches into single commits.

use std::{fmt, time::Duration};

use indexmap::IndexMap;
use tokio::runtime::Handle;
use tracing_futures::Instrument;

use crate::{HealthPatch, RelayUrl};

#[cfg(test)]
mod tests;

/// A deferred commit of the pending health patches.
pub type Commit = Box<dyn FnOnce() + Send + 'static>;

/// Decides when a pending commit runs.
///
/// A scheduler is asked to run at most one commit at a time: the batcher
/// does not schedule another commit until the previous one has taken its
/// pending patches.
pub trait CommitScheduler: Send + Sync + fmt::Debug {
    /// Runs `commit` once, now or later.
    fn schedule(&self, commit: Commit);
}

/// Runs each commit synchronously, as soon as it is scheduled.
///
/// Every observed event is committed on its own.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ImmediateCommit;

impl CommitScheduler for ImmediateCommit {
    fn schedule(&self, commit: Commit) {
        commit()
    }
}

/// Runs each commit one frame after it is scheduled, on the current tokio runtime.
///
/// Events that arrive within the frame are committed together. Outside a
/// tokio runtime, commits run synchronously, like [`ImmediateCommit`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FrameCommit {
    frame: Duration,
}

impl FrameCommit {
    /// Returns a scheduler that delays commits by `frame`.
    pub fn new(frame: Duration) -> FrameCommit {
        FrameCommit { frame }
    }

    /// The batching window.
    pub fn frame(&self) -> Duration {
        self.frame
    }
}

impl CommitScheduler for FrameCommit {
    fn schedule(&self, commit: Commit) {
        let Ok(runtime) = Handle::try_current() else {
            trace!("no tokio runtime, committing relay health synchronously");
            return commit();
        };

        let frame = self.frame;
        runtime.spawn(
            async move {
                tokio::time::sleep(frame).await;
                commit();
            }
            .in_current_span(),
        );
    }
}

/// Pending health patches, merged per relay until the next commit.
///
/// Relays keep the order they were first observed in since the last commit.
#[derive(Clone, Debug, Default)]
pub struct UpdateBatcher {
    pending: IndexMap<RelayUrl, HealthPatch>,
    scheduled: bool,
}

impl UpdateBatcher {
    /// Returns an empty batcher.
    pub fn new() -> UpdateBatcher {
        UpdateBatcher::default()
    }

    /// Adds `patch` to the pending patch for `url`.
    ///
    /// Fields in `patch` replace the pending fields, absent fields keep the
    /// pending values.
    ///
    /// Returns true if the caller must schedule a commit. Returns false if a
    /// commit is already scheduled, or the patch is empty.
    pub fn observe(&mut self, url: RelayUrl, patch: HealthPatch) -> bool {
        if patch.is_empty() {
            return false;
        }

        self.pending.entry(url).or_default().merge(patch);

        let must_schedule = !self.scheduled;
        self.scheduled = true;

        must_schedule
    }

    /// Returns the pending patch for `url`, if there is one.
    pub fn pending_patch(&self, url: &RelayUrl) -> Option<&HealthPatch> {
        self.pending.get(url)
    }

    /// Takes all the pending patches, in observation order, and clears the
    /// scheduled flag.
    pub fn take_pending(&mut self) -> IndexMap<RelayUrl, HealthPatch> {
        self.scheduled = false;
        std::mem::take(&mut self.pending)
    }

    /// Drops the pending patches for relays that `keep` rejects.
    pub fn retain(&mut self, mut keep: impl FnMut(&RelayUrl) -> bool) {
        self.pending.retain(|url, _| keep(url));
    }

    /// Returns true if a commit is scheduled and hasn't run yet.
    pub fn is_scheduled(&self) -> bool {
        self.scheduled
    }

    /// The number of relays with pending patches.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if there are no pending patches.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
