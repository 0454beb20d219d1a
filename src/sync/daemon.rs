//! Standalone batch updater.
//!
//! Runs every configured feed once, sequentially, each under its
//! `<cachepath>.lock` marker so that concurrent daemons (cron overlap, a
//! manual run during a scheduled one) never work on the same feed.

use std::path::Path;
use std::time::Duration;

use crate::config::FeedDescriptor;
use crate::feed::{CycleOutcome, FetchCapability, FetchScheduler};
use crate::storage::{
    CacheFile, DirectoryReconciler, Entry, LockAttempt, LockFile, ReconcileReport, StoreError,
    STALE_LOCK_AGE,
};

/// Counts of per-feed outcomes for one daemon run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DaemonReport {
    pub reconcile: ReconcileReport,
    pub updated: usize,
    pub not_due: usize,
    /// Skipped because another process held the lock marker or file lock
    pub locked: usize,
    pub corrupt: usize,
    /// Fetch or store failures
    pub failed: usize,
    /// Recoverable parse warnings among the updated feeds
    pub warnings: usize,
}

impl DaemonReport {
    fn record(&mut self, outcome: &CycleOutcome) {
        match outcome {
            CycleOutcome::NotDue => self.not_due += 1,
            CycleOutcome::Updated { warning, .. } => {
                self.updated += 1;
                if warning.is_some() {
                    self.warnings += 1;
                }
            }
            CycleOutcome::LockUnavailable => self.locked += 1,
            CycleOutcome::Corrupt(_) => self.corrupt += 1,
            CycleOutcome::Failed(_) | CycleOutcome::StoreFailed(_) => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.updated + self.not_due + self.locked + self.corrupt + self.failed
    }
}

/// What [`guarded_update`] did for one feed.
#[derive(Debug)]
pub enum GuardedUpdate {
    /// The cycle ran to any outcome other than not due.
    Cycle(CycleOutcome),
    /// Not due. Pending state was flushed under the marker; holds the cache
    /// as read or written, `None` when there is no usable cache file.
    Synced(Option<CacheFile>),
    /// Not due, and flushing pending state failed.
    SyncFailed(StoreError),
}

fn acquire_marker(
    feed: &FeedDescriptor,
    path: &Path,
    stale_after: Duration,
) -> Result<LockFile, CycleOutcome> {
    match LockFile::acquire_with(path, stale_after) {
        Ok(LockAttempt::Acquired(lock)) => Ok(lock),
        Ok(LockAttempt::Held { age }) => {
            tracing::info!(
                feed = %feed.url,
                age_secs = age.as_secs(),
                "Failed to get lock, skipping feed"
            );
            Err(CycleOutcome::LockUnavailable)
        }
        Err(e) => {
            tracing::warn!(feed = %feed.url, error = %e, "Failed to create lock marker");
            Err(CycleOutcome::StoreFailed(StoreError::io(path, e)))
        }
    }
}

fn release_marker(feed: &FeedDescriptor, lock: LockFile) {
    if let Err(e) = lock.release() {
        tracing::warn!(feed = %feed.url, error = %e, "Failed to remove lock marker");
    }
}

async fn cycle<F: FetchCapability>(
    scheduler: &FetchScheduler<F>,
    feed: &FeedDescriptor,
    pending: &[Entry],
    now: i64,
    force: bool,
) -> CycleOutcome {
    if force {
        scheduler.run_forced(feed, pending, now).await
    } else {
        scheduler.run_cycle(feed, pending, now).await
    }
}

/// Run one cycle for `feed` while holding its lock marker.
///
/// A live marker held by someone else yields
/// [`CycleOutcome::LockUnavailable`] without touching the cache. The marker
/// is removed however the cycle ends.
pub async fn guarded_cycle<F: FetchCapability>(
    scheduler: &FetchScheduler<F>,
    feed: &FeedDescriptor,
    pending: &[Entry],
    now: i64,
    force: bool,
    stale_after: Duration,
) -> CycleOutcome {
    let path = feed.cache_path(scheduler.cache_dir());
    let lock = match acquire_marker(feed, &path, stale_after) {
        Ok(lock) => lock,
        Err(outcome) => return outcome,
    };

    let outcome = cycle(scheduler, feed, pending, now, force).await;
    release_marker(feed, lock);
    outcome
}

/// [`guarded_cycle`] for a reader holding `pending` changes: when the feed
/// is not due, the changes are written back before the marker is released.
pub async fn guarded_update<F: FetchCapability>(
    scheduler: &FetchScheduler<F>,
    feed: &FeedDescriptor,
    pending: &[Entry],
    now: i64,
    force: bool,
    stale_after: Duration,
) -> GuardedUpdate {
    let path = feed.cache_path(scheduler.cache_dir());
    let lock = match acquire_marker(feed, &path, stale_after) {
        Ok(lock) => lock,
        Err(outcome) => return GuardedUpdate::Cycle(outcome),
    };

    let update = match cycle(scheduler, feed, pending, now, force).await {
        CycleOutcome::NotDue => match scheduler.sync_pending(feed, pending) {
            Ok(cache) => GuardedUpdate::Synced(cache),
            Err(e) => GuardedUpdate::SyncFailed(e),
        },
        outcome => GuardedUpdate::Cycle(outcome),
    };
    release_marker(feed, lock);
    update
}

/// One pass over all feeds.
pub struct BatchDaemon<F> {
    scheduler: FetchScheduler<F>,
    feeds: Vec<FeedDescriptor>,
    stale_after: Duration,
}

impl<F: FetchCapability> BatchDaemon<F> {
    pub fn new(scheduler: FetchScheduler<F>, feeds: Vec<FeedDescriptor>) -> Self {
        Self {
            scheduler,
            feeds,
            stale_after: STALE_LOCK_AGE,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn feeds(&self) -> &[FeedDescriptor] {
        &self.feeds
    }

    /// Reconcile the cache directory, then update every feed.
    ///
    /// Only a cache directory that cannot be created or listed is an error.
    /// Per-feed problems are counted in the report and never stop the run.
    pub async fn run(&self, now: i64) -> Result<DaemonReport, StoreError> {
        let reconcile = DirectoryReconciler::new(self.scheduler.cache_dir(), &self.feeds).reconcile()?;
        let mut report = DaemonReport {
            reconcile,
            ..Default::default()
        };

        for feed in &self.feeds {
            let outcome =
                guarded_cycle(&self.scheduler, feed, &[], now, false, self.stale_after).await;
            tracing::debug!(feed = %feed.url, outcome = outcome.kind(), "Feed cycle finished");
            report.record(&outcome);
        }

        tracing::info!(
            updated = report.updated,
            not_due = report.not_due,
            locked = report.locked,
            corrupt = report.corrupt,
            failed = report.failed,
            "Batch update complete"
        );
        Ok(report)
    }
}
