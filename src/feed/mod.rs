//! Fetching feeds and folding the results into the cache.
//!
//! - [`parser`] - RSS/Atom bytes to opaque entry maps using `feed-rs`
//! - [`fetcher`] - the [`FetchCapability`] boundary and its HTTP implementation
//! - [`merge`] - identity matching, state carry-over and retention
//! - [`scheduler`] - the per-feed load → fetch → merge → store cycle
//!
//! # Example
//!
//! ```ignore
//! use feedsync::feed::{FetchScheduler, HttpFetcher};
//!
//! let scheduler = FetchScheduler::new(HttpFetcher::default(), cache_dir);
//! let outcome = scheduler.run_cycle(&feed, &[], chrono::Utc::now().timestamp()).await;
//! ```

mod fetcher;
mod merge;
mod parser;
mod scheduler;

pub use fetcher::{FetchCapability, FetchError, FetchedFeed, HttpFetcher};
pub use merge::{overlay_pending, EntryMerger};
pub use parser::parse_feed;
pub use scheduler::{CycleOutcome, FetchScheduler};

#[cfg(test)]
pub(crate) use scheduler::tests as test_support;
