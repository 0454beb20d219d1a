//! Feed cache synchronization: fetch feeds on a schedule, merge new entries
//! with the reader's sticky per-entry state, and persist one JSON cache file
//! per feed with locking safe against concurrent processes.

pub mod config;
pub mod feed;
pub mod storage;
pub mod sync;
pub mod util;
