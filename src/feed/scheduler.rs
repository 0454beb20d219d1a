use std::path::{Path, PathBuf};

use super::fetcher::{FetchCapability, FetchError};
use super::merge::{overlay_pending, EntryMerger};
use crate::config::FeedDescriptor;
use crate::storage::{
    remove_legacy_layout, CacheFile, CacheStore, CorruptReason, Entry, LoadOutcome, StoreError,
};

/// What one fetch cycle did for one feed.
#[derive(Debug)]
pub enum CycleOutcome {
    /// Rate limit not yet elapsed; nothing fetched or written.
    NotDue,
    /// Fetched, merged and persisted.
    Updated {
        cache: CacheFile,
        tag: String,
        /// Recoverable parse diagnostic from the fetch, never persisted.
        warning: Option<String>,
    },
    /// Another process holds the cache file. Skipped this cycle.
    LockUnavailable,
    /// Cache file exists but is unusable. Left untouched.
    Corrupt(CorruptReason),
    /// Fetch failed. Cache left untouched.
    Failed(FetchError),
    /// Cache file could not be read or written for a reason other than
    /// contention.
    StoreFailed(StoreError),
}

impl CycleOutcome {
    /// Short label for log lines and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            CycleOutcome::NotDue => "not_due",
            CycleOutcome::Updated { .. } => "updated",
            CycleOutcome::LockUnavailable => "lock_unavailable",
            CycleOutcome::Corrupt(_) => "corrupt",
            CycleOutcome::Failed(_) => "failed",
            CycleOutcome::StoreFailed(_) => "store_failed",
        }
    }
}

/// Runs the load → fetch → merge → store pipeline for single feeds.
#[derive(Debug)]
pub struct FetchScheduler<F> {
    fetcher: F,
    store: CacheStore,
    cache_dir: PathBuf,
    force: bool,
}

impl<F: FetchCapability> FetchScheduler<F> {
    pub fn new(fetcher: F, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            fetcher,
            store: CacheStore::new(),
            cache_dir: cache_dir.into(),
            force: false,
        }
    }

    /// Ignore rate limits on every cycle.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Run one cycle for `feed` at unix time `now`.
    ///
    /// `pending` holds the caller's in-memory entries; any that are dirty
    /// override the state read from disk before merging.
    pub async fn run_cycle(
        &self,
        feed: &FeedDescriptor,
        pending: &[Entry],
        now: i64,
    ) -> CycleOutcome {
        self.run_cycle_inner(feed, pending, now, self.force).await
    }

    /// Same as [`run_cycle`](Self::run_cycle) but ignores the rate limit.
    pub async fn run_forced(
        &self,
        feed: &FeedDescriptor,
        pending: &[Entry],
        now: i64,
    ) -> CycleOutcome {
        self.run_cycle_inner(feed, pending, now, true).await
    }

    /// Read the cache without fetching and write back any dirty `pending`
    /// state. Used between fetches so reader changes reach disk.
    ///
    /// Returns `None` when there is no usable cache file.
    pub fn sync_pending(
        &self,
        feed: &FeedDescriptor,
        pending: &[Entry],
    ) -> Result<Option<CacheFile>, StoreError> {
        let path = feed.cache_path(&self.cache_dir);
        let mut cache = match self.store.load(&path)? {
            LoadOutcome::Current(cache) | LoadOutcome::Migrated { cache, .. } => cache,
            LoadOutcome::NotFound => return Ok(None),
            LoadOutcome::Corrupt(reason) => {
                tracing::error!(feed = %feed.url, reason = %reason, "Cache file is corrupt");
                return Ok(None);
            }
        };

        if overlay_pending(&mut cache.entries, pending) > 0 {
            self.store.store(&path, &mut cache)?;
            tracing::debug!(feed = %feed.url, "Flushed pending state changes");
        }
        Ok(Some(cache))
    }

    async fn run_cycle_inner(
        &self,
        feed: &FeedDescriptor,
        pending: &[Entry],
        now: i64,
        force: bool,
    ) -> CycleOutcome {
        let path = feed.cache_path(&self.cache_dir);

        match remove_legacy_layout(&path) {
            Ok(true) => tracing::info!(feed = %feed.url, "Removed legacy cache layout"),
            Ok(false) => {}
            Err(e) => {
                return CycleOutcome::StoreFailed(StoreError::io(&path, e));
            }
        }

        let previous = match self.store.load(&path) {
            Ok(LoadOutcome::Current(cache)) | Ok(LoadOutcome::Migrated { cache, .. }) => cache,
            Ok(LoadOutcome::NotFound) => CacheFile::empty(),
            Ok(LoadOutcome::Corrupt(reason)) => {
                tracing::error!(
                    feed = %feed.url,
                    path = %path.display(),
                    reason = %reason,
                    "Cache file is corrupt, skipping feed"
                );
                return CycleOutcome::Corrupt(reason);
            }
            Err(StoreError::LockUnavailable(_)) => {
                tracing::info!(feed = %feed.url, "Cache file locked, skipping update");
                return CycleOutcome::LockUnavailable;
            }
            Err(e) => {
                tracing::warn!(feed = %feed.url, error = %e, "Failed to load cache");
                return CycleOutcome::StoreFailed(e);
            }
        };

        if !previous.is_due(feed.rate, now, force) {
            tracing::debug!(feed = %feed.url, "Not due for update");
            return CycleOutcome::NotDue;
        }

        tracing::debug!(feed = %feed.url, "Fetching feed");
        let fetched = match self
            .fetcher
            .fetch(&feed.url, feed.credentials.as_deref())
            .await
        {
            Ok(fetched) => fetched,
            Err(e) => {
                tracing::warn!(feed = %feed.url, error = %e, "Fetch failed");
                return CycleOutcome::Failed(e);
            }
        };

        if let Some(warning) = &fetched.warning {
            tracing::warn!(feed = %feed.url, warning = %warning, "Feed parsed with warnings");
        }

        let mut meta = fetched.meta;
        let resolved = feed
            .tag
            .clone()
            .or_else(|| previous.feed.title.clone())
            .or_else(|| meta.title.clone());
        let tag = match resolved {
            Some(tag) => tag,
            None => {
                tracing::warn!(
                    feed = %feed.url,
                    "Feed has no tag or title, using URL. No guarantees of uniqueness"
                );
                meta.title = Some(feed.url.clone());
                feed.url.clone()
            }
        };

        let CacheFile {
            state,
            entries: mut previous_entries,
            ..
        } = previous;
        let applied = overlay_pending(&mut previous_entries, pending);
        if applied > 0 {
            tracing::debug!(feed = %feed.url, count = applied, "Applied pending state changes");
        }

        let tags = [tag.clone()];
        let fetched_entries = fetched.entries.into_iter().map(Entry::from_fields).collect();
        let entries = EntryMerger::new(&tags, feed.keep).merge(previous_entries, fetched_entries);

        let mut cache = CacheFile {
            feed: meta,
            state,
            last_update: now,
            entries,
            ..CacheFile::empty()
        };

        match self.store.store(&path, &mut cache) {
            Ok(()) => {}
            Err(StoreError::LockUnavailable(_)) => {
                tracing::info!(feed = %feed.url, "Cache file locked, discarding update");
                return CycleOutcome::LockUnavailable;
            }
            Err(e) => {
                tracing::warn!(feed = %feed.url, error = %e, "Failed to store cache");
                return CycleOutcome::StoreFailed(e);
            }
        }

        tracing::info!(
            feed = %feed.url,
            tag = %tag,
            entries = cache.entries.len(),
            "Updated feed"
        );
        CycleOutcome::Updated {
            cache,
            tag,
            warning: fetched.warning,
        }
    }
}
