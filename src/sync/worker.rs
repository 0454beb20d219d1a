//! In-process background updates for the interactive reader.
//!
//! Each feed has an [`UpdateWorker`] driven by [`Session::tick`]. When a
//! worker's countdown runs out it spawns a tokio task that runs the fetch
//! cycle and reports back over an mpsc channel. The session applies those
//! messages on the caller's task, so feeds are only ever mutated there.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::daemon::{guarded_update, GuardedUpdate};
use super::feed::{diff_entries, Feed};
use crate::config::{ContentFilter, FeedDescriptor};
use crate::feed::{CycleOutcome, FetchCapability, FetchScheduler};
use crate::storage::{Entry, STALE_LOCK_AGE};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    /// Fetch cycle in flight
    Updating,
    /// Cycle finished, computing the new/old diff
    Filtering,
    /// Report ready to be taken
    Done,
}

/// Result of one background update, taken with [`Session::take_report`].
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub feed: usize,
    /// [`CycleOutcome::kind`] of the cycle, or `"synced"` when the feed was
    /// not due and only pending state was written.
    pub outcome: &'static str,
    /// Entries that became visible under the active filter
    pub added: Vec<Entry>,
    /// Entries that stopped being visible under the active filter
    pub removed: Vec<Entry>,
}

/// Messages from update tasks to the session.
#[derive(Debug)]
pub enum WorkerMessage {
    Progress {
        feed: usize,
        state: WorkerState,
    },
    Completed {
        feed: usize,
        /// True when the countdown should restart from the feed's rate
        succeeded: bool,
        tag: Option<String>,
        /// Cache content to absorb, when any was read or written
        entries: Option<Vec<Entry>>,
        report: WorkerReport,
    },
}

/// Per-feed countdown and state machine.
#[derive(Debug, Clone)]
pub struct UpdateWorker {
    state: WorkerState,
    /// Ticks until the next update. Starts at 1 so the first tick updates.
    countdown: u64,
    rate: u64,
    forced: bool,
    report: Option<WorkerReport>,
}

impl UpdateWorker {
    pub fn new(rate: u64) -> Self {
        Self {
            state: WorkerState::Idle,
            countdown: 1,
            rate,
            forced: false,
            report: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn countdown(&self) -> u64 {
        self.countdown
    }

    /// Advance one tick. Returns true when an update should start now.
    pub fn tick(&mut self) -> bool {
        self.countdown = self.countdown.saturating_sub(1);
        self.countdown == 0 && self.state == WorkerState::Idle
    }

    fn start(&mut self) -> bool {
        self.state = WorkerState::Updating;
        std::mem::take(&mut self.forced)
    }

    fn force(&mut self) {
        self.countdown = 0;
        self.forced = true;
    }

    fn finish(&mut self, succeeded: bool, report: WorkerReport) {
        if succeeded {
            self.countdown = self.rate;
        }
        self.report = Some(report);
        self.state = WorkerState::Done;
    }

    fn take_report(&mut self) -> Option<WorkerReport> {
        if self.state != WorkerState::Done {
            return None;
        }
        self.state = WorkerState::Idle;
        self.report.take()
    }
}

/// Owns the reader's feeds and drives their background updates.
pub struct Session<F> {
    scheduler: Arc<FetchScheduler<F>>,
    feeds: Vec<Feed>,
    workers: Vec<UpdateWorker>,
    filters: Vec<Option<ContentFilter>>,
    active_filter: usize,
    stale_after: Duration,
    tx: mpsc::Sender<WorkerMessage>,
    rx: mpsc::Receiver<WorkerMessage>,
}

impl<F: FetchCapability> Session<F> {
    /// `filters` are the selectable view filters; `None` shows everything.
    /// An empty list gets a single `None`. An out-of-range `active_filter`
    /// starts at 0.
    pub fn new(
        scheduler: Arc<FetchScheduler<F>>,
        descriptors: Vec<FeedDescriptor>,
        mut filters: Vec<Option<ContentFilter>>,
        active_filter: usize,
    ) -> Self {
        if filters.is_empty() {
            filters.push(None);
        }
        let active_filter = if active_filter < filters.len() {
            active_filter
        } else {
            0
        };
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let workers = descriptors.iter().map(|d| UpdateWorker::new(d.rate)).collect();
        let feeds = descriptors.into_iter().map(Feed::new).collect();

        Self {
            scheduler,
            feeds,
            workers,
            filters,
            active_filter,
            stale_after: STALE_LOCK_AGE,
            tx,
            rx,
        }
    }

    pub fn feeds(&self) -> &[Feed] {
        &self.feeds
    }

    pub fn feed_mut(&mut self, index: usize) -> Option<&mut Feed> {
        self.feeds.get_mut(index)
    }

    pub fn worker(&self, index: usize) -> Option<&UpdateWorker> {
        self.workers.get(index)
    }

    pub fn active_filter(&self) -> Option<&ContentFilter> {
        self.filters.get(self.active_filter).and_then(Option::as_ref)
    }

    pub fn active_filter_index(&self) -> usize {
        self.active_filter
    }

    /// Select the next view filter, wrapping around.
    pub fn next_filter(&mut self) -> Option<&ContentFilter> {
        self.active_filter = (self.active_filter + 1) % self.filters.len();
        self.active_filter()
    }

    /// Select the previous view filter, wrapping around.
    pub fn prev_filter(&mut self) -> Option<&ContentFilter> {
        self.active_filter = self
            .active_filter
            .checked_sub(1)
            .unwrap_or(self.filters.len() - 1);
        self.active_filter()
    }

    /// Make every feed update on the next tick, ignoring rate limits.
    pub fn force_update(&mut self) {
        for worker in &mut self.workers {
            worker.force();
        }
    }

    /// True while any update task is in flight.
    pub fn is_busy(&self) -> bool {
        self.workers
            .iter()
            .any(|w| matches!(w.state, WorkerState::Updating | WorkerState::Filtering))
    }

    /// Advance every worker one tick, spawning updates that are due.
    /// Returns how many were spawned.
    pub fn tick(&mut self) -> usize {
        let mut spawned = 0;
        for index in 0..self.workers.len() {
            if self.workers[index].tick() {
                let forced = self.workers[index].start();
                self.spawn_update(index, forced);
                spawned += 1;
            }
        }
        spawned
    }

    fn spawn_update(&self, index: usize, forced: bool) {
        let scheduler = Arc::clone(&self.scheduler);
        let tx = self.tx.clone();
        let feed = &self.feeds[index];
        let descriptor = feed.descriptor().clone();
        let snapshot: Vec<Entry> = feed.visible(self.active_filter()).cloned().collect();
        let pending: Vec<Entry> = feed.entries().to_vec();
        let hard_filter = descriptor.filter.clone();
        let view_filter = self.active_filter().cloned();
        let stale_after = self.stale_after;

        tracing::debug!(feed = %descriptor.url, forced, "Starting background update");
        tokio::spawn(async move {
            let now = chrono::Utc::now().timestamp();
            let update =
                guarded_update(&scheduler, &descriptor, &pending, now, forced, stale_after).await;

            let (label, succeeded, tag, cache) = match update {
                GuardedUpdate::Cycle(CycleOutcome::Updated { cache, tag, .. }) => {
                    ("updated", true, Some(tag), Some(cache))
                }
                GuardedUpdate::Cycle(other) => (other.kind(), false, None, None),
                GuardedUpdate::Synced(cache) => ("synced", true, None, cache),
                GuardedUpdate::SyncFailed(e) => {
                    tracing::info!(feed = %descriptor.url, error = %e, "Could not sync pending state");
                    ("not_due", false, None, None)
                }
            };

            // Receiver gone means the session was dropped
            let _ = tx
                .send(WorkerMessage::Progress {
                    feed: index,
                    state: WorkerState::Filtering,
                })
                .await;

            let tag = tag.or_else(|| cache.as_ref().and_then(|c| c.feed.title.clone()));
            let entries: Option<Vec<Entry>> = cache.map(|c| {
                c.entries
                    .into_iter()
                    .filter(|e| hard_filter.as_ref().map_or(true, |f| f.matches(e)))
                    .collect()
            });
            let (added, removed) = match &entries {
                Some(new) => diff_entries(&snapshot, new, view_filter.as_ref()),
                None => (Vec::new(), Vec::new()),
            };

            let _ = tx
                .send(WorkerMessage::Completed {
                    feed: index,
                    succeeded,
                    tag,
                    entries,
                    report: WorkerReport {
                        feed: index,
                        outcome: label,
                        added,
                        removed,
                    },
                })
                .await;
        });
    }

    fn apply(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Progress { feed, state } => {
                if let Some(worker) = self.workers.get_mut(feed) {
                    worker.state = state;
                }
            }
            WorkerMessage::Completed {
                feed,
                succeeded,
                tag,
                entries,
                report,
            } => {
                if let Some(target) = self.feeds.get_mut(feed) {
                    if target.descriptor().tag.is_none() {
                        if let Some(tag) = tag {
                            target.set_tag(tag);
                        }
                    }
                    if let Some(entries) = entries {
                        target.absorb(entries);
                    }
                }
                if let Some(worker) = self.workers.get_mut(feed) {
                    worker.finish(succeeded, report);
                }
            }
        }
    }

    /// Apply every message already sent by update tasks without waiting.
    /// Returns how many were applied.
    pub fn poll(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(message) = self.rx.try_recv() {
            self.apply(message);
            applied += 1;
        }
        applied
    }

    /// Wait until no update task is in flight, applying messages as they
    /// arrive.
    pub async fn settle(&mut self) {
        while self.is_busy() {
            match self.rx.recv().await {
                Some(message) => self.apply(message),
                None => break,
            }
        }
    }

    /// Take the finished report for `feed`, returning its worker to idle.
    pub fn take_report(&mut self, feed: usize) -> Option<WorkerReport> {
        self.workers.get_mut(feed)?.take_report()
    }

    /// Take every finished report.
    pub fn take_reports(&mut self) -> Vec<WorkerReport> {
        self.workers
            .iter_mut()
            .filter_map(UpdateWorker::take_report)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::test_support::{feed_of, item, ScriptedFetcher};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;

    fn session(
        dir: &std::path::Path,
        fetcher: ScriptedFetcher,
        filters: Vec<Option<ContentFilter>>,
    ) -> Session<ScriptedFetcher> {
        let scheduler = Arc::new(FetchScheduler::new(fetcher, dir));
        let feeds = vec![FeedDescriptor::new("https://example.com/rss", 3, 10).with_tag("F")];
        Session::new(scheduler, feeds, filters, 0)
    }

    #[test]
    fn test_worker_countdown() {
        let mut worker = UpdateWorker::new(3);
        assert!(worker.tick(), "first tick updates");
        worker.start();
        assert!(!worker.tick(), "busy worker never restarts");
        worker.finish(
            true,
            WorkerReport {
                feed: 0,
                outcome: "updated",
                added: Vec::new(),
                removed: Vec::new(),
            },
        );
        assert_eq!(worker.countdown(), 3);
        assert!(worker.take_report().is_some());
        assert_eq!(worker.state(), WorkerState::Idle);
        assert!(!worker.tick());
        assert!(!worker.tick());
        assert!(worker.tick());
    }

    #[test]
    fn test_failed_update_keeps_countdown_at_zero() {
        let mut worker = UpdateWorker::new(3);
        worker.tick();
        worker.start();
        worker.finish(
            false,
            WorkerReport {
                feed: 0,
                outcome: "failed",
                added: Vec::new(),
                removed: Vec::new(),
            },
        );
        worker.take_report();
        assert!(worker.tick(), "retried on the next tick");
    }

    #[tokio::test]
    async fn test_session_update_and_diff() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher =
            ScriptedFetcher::serving(feed_of(Some("F"), vec![item("1", "one"), item("2", "two")]));
        let mut s = session(dir.path(), fetcher, vec![None]);

        assert_eq!(s.tick(), 1);
        assert!(s.is_busy());
        s.settle().await;

        assert_eq!(s.worker(0).unwrap().state(), WorkerState::Done);
        let report = s.take_report(0).unwrap();
        assert_eq!(report.outcome, "updated");
        assert_eq!(report.added.len(), 2);
        assert!(report.removed.is_empty());
        assert_eq!(s.feeds()[0].len(), 2);
        assert_eq!(s.worker(0).unwrap().state(), WorkerState::Idle);
        assert!(s.take_report(0).is_none());
    }

    #[tokio::test]
    async fn test_local_change_persisted_by_next_update() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::serving(feed_of(Some("F"), vec![item("1", "one")]));
        let mut s = session(dir.path(), fetcher, vec![None, Some(ContentFilter::Unread)]);
        s.tick();
        s.settle().await;
        s.take_reports();

        s.feed_mut(0).unwrap().entry_mut(0).unwrap().mark_read();
        assert!(s.feeds()[0].has_pending());

        // Not due yet; the pending change is flushed without a fetch
        assert_eq!(s.tick(), 0);
        assert_eq!(s.tick(), 0);
        assert_eq!(s.tick(), 1);
        s.settle().await;
        assert_eq!(s.take_report(0).unwrap().outcome, "synced");
        assert!(!s.feeds()[0].has_pending());

        let stored = crate::storage::CacheStore::new()
            .load(&s.feeds()[0].descriptor().cache_path(dir.path()))
            .unwrap()
            .into_cache()
            .unwrap();
        assert!(!stored.entries[0].is_unread());
    }

    #[tokio::test]
    async fn test_forced_update_refetches() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::serving(feed_of(Some("F"), vec![item("1", "one")]));
        let mut s = session(dir.path(), fetcher, vec![None]);
        s.tick();
        s.settle().await;
        s.take_reports();

        s.force_update();
        s.tick();
        s.settle().await;
        assert_eq!(s.take_report(0).unwrap().outcome, "updated");
        assert_eq!(s.scheduler.fetcher().calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_filter_cycling_wraps() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = session(
            dir.path(),
            ScriptedFetcher::default(),
            vec![None, Some(ContentFilter::Unread), Some(ContentFilter::Starred)],
        );
        assert_eq!(s.active_filter(), None);
        assert_eq!(s.next_filter(), Some(&ContentFilter::Unread));
        assert_eq!(s.next_filter(), Some(&ContentFilter::Starred));
        assert_eq!(s.next_filter(), None);
        assert_eq!(s.prev_filter(), Some(&ContentFilter::Starred));
    }

    #[test]
    fn test_out_of_range_filter_index_resets() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Arc::new(FetchScheduler::new(ScriptedFetcher::default(), dir.path()));
        let s = Session::new(scheduler, Vec::new(), vec![None, Some(ContentFilter::Unread)], 7);
        assert_eq!(s.active_filter_index(), 0);
    }
}
