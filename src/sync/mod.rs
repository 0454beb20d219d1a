//! Coordinating updates between the interactive reader and the batch daemon.
//!
//! Both drive the same [`FetchScheduler`](crate::feed::FetchScheduler)
//! cycle. The reader does so from background tasks owned by a [`Session`];
//! the daemon runs feeds one after another under lock markers. Either may
//! run while the other is active: lock markers serialize cycles on a feed
//! and `flock` on the cache file protects individual reads and writes.

mod daemon;
mod feed;
mod worker;

pub use daemon::{guarded_cycle, guarded_update, BatchDaemon, DaemonReport, GuardedUpdate};
pub use feed::{diff_entries, Feed};
pub use worker::{Session, UpdateWorker, WorkerMessage, WorkerReport, WorkerState};
