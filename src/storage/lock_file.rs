//! Per-feed lock markers for the batch daemon.
//!
//! A marker is a zero-byte `<cachepath>.lock` created with `O_EXCL`. Its
//! existence is the lock; its mtime is its creation time. `flock` cannot say
//! how long a lock has been held, so a crashed daemon is detected by marker
//! age instead.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::util::lock_path;

/// Markers older than this are presumed abandoned.
pub const STALE_LOCK_AGE: Duration = Duration::from_secs(120);

/// Outcome of trying to take a feed's lock marker.
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(LockFile),
    /// A live marker exists; the feed should be skipped this run.
    Held { age: Duration },
}

/// An owned lock marker. Removed on [`LockFile::release`] or drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    held: bool,
}

fn create_marker(path: &Path) -> io::Result<()> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map(drop)
}

fn marker_age(path: &Path) -> io::Result<Duration> {
    let created = fs::metadata(path)?.modified()?;
    Ok(SystemTime::now()
        .duration_since(created)
        .unwrap_or(Duration::ZERO))
}

impl LockFile {
    /// Take the marker for `cache_path` with the standard staleness threshold.
    pub fn acquire(cache_path: &Path) -> io::Result<LockAttempt> {
        Self::acquire_with(cache_path, STALE_LOCK_AGE)
    }

    /// Take the marker for `cache_path`.
    ///
    /// If a marker exists and is older than `stale_after` it is deleted and
    /// creation is retried once. A marker that is younger, or that someone
    /// else recreates in between, yields [`LockAttempt::Held`].
    pub fn acquire_with(cache_path: &Path, stale_after: Duration) -> io::Result<LockAttempt> {
        let path = lock_path(cache_path);

        match create_marker(&path) {
            Ok(()) => return Ok(LockAttempt::Acquired(Self::owned(path))),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }

        let age = match marker_age(&path) {
            Ok(age) => age,
            // Released between our create and stat
            Err(e) if e.kind() == io::ErrorKind::NotFound => stale_after + Duration::from_secs(1),
            Err(e) => return Err(e),
        };
        if age <= stale_after {
            return Ok(LockAttempt::Held { age });
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(
                    lock = %path.display(),
                    age_secs = age.as_secs(),
                    "Deleted stale lock"
                );
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        match create_marker(&path) {
            Ok(()) => Ok(LockAttempt::Acquired(Self::owned(path))),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                tracing::info!(lock = %path.display(), "Lock retaken by another process");
                Ok(LockAttempt::Held {
                    age: Duration::ZERO,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn owned(path: PathBuf) -> Self {
        Self { path, held: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the marker.
    pub fn release(mut self) -> io::Result<()> {
        self.held = false;
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if self.held {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn backdate(path: &Path, by: Duration) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("feed");

        let lock = match LockFile::acquire(&cache).unwrap() {
            LockAttempt::Acquired(lock) => lock,
            other => panic!("Expected Acquired, got {:?}", other),
        };
        assert!(lock.path().exists());
        assert_eq!(fs::metadata(lock.path()).unwrap().len(), 0);

        let marker = lock.path().to_path_buf();
        lock.release().unwrap();
        assert!(!marker.exists());
    }

    #[test]
    fn test_fresh_lock_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("feed");
        let marker = lock_path(&cache);
        fs::write(&marker, b"").unwrap();
        backdate(&marker, Duration::from_secs(10));

        match LockFile::acquire(&cache).unwrap() {
            LockAttempt::Held { age } => assert!(age >= Duration::from_secs(9)),
            other => panic!("Expected Held, got {:?}", other),
        }
        assert!(marker.exists(), "a live lock must not be removed");
    }

    #[test]
    fn test_stale_lock_is_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("feed");
        let marker = lock_path(&cache);
        fs::write(&marker, b"").unwrap();
        backdate(&marker, Duration::from_secs(121));

        match LockFile::acquire(&cache).unwrap() {
            LockAttempt::Acquired(lock) => {
                assert!(marker_age(lock.path()).unwrap() < Duration::from_secs(5));
            }
            other => panic!("Expected Acquired, got {:?}", other),
        }
        assert!(!marker.exists(), "dropped lock removes its marker");
    }

    #[test]
    fn test_second_acquire_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("feed");
        let _first = LockFile::acquire(&cache).unwrap();
        assert!(matches!(
            LockFile::acquire(&cache).unwrap(),
            LockAttempt::Held { .. }
        ));
    }
}
