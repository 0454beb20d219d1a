//! On-disk cache of feed state.
//!
//! - [`cache_store`] - locked load/store of one feed's cache file
//! - [`lock_file`] - batch daemon lock markers with staleness reaping
//! - [`reconcile`] - cache directory housekeeping
//! - [`types`] - cache file records, entries and load classification

mod cache_store;
mod lock_file;
mod reconcile;
mod types;

pub use cache_store::CacheStore;
pub use lock_file::{LockAttempt, LockFile, STALE_LOCK_AGE};
pub use reconcile::{remove_legacy_layout, DirectoryReconciler, ReconcileReport};
pub use types::{
    CacheFile, CorruptReason, Entry, FeedMeta, FormatVersion, LoadOutcome, StoreError,
    STATE_NEW, STATE_READ, STATE_STARRED, STATE_UNREAD,
};
