//! Locked reads and crash-safe writes of a single feed's cache file.
//!
//! Readers take a shared `flock`, writers an exclusive one. Both are
//! non-blocking: a contended lock is reported as
//! [`StoreError::LockUnavailable`] and the caller skips the cycle instead of
//! waiting on another process.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;

use super::types::{CacheFile, CorruptReason, FormatVersion, LoadOutcome, StoreError};
use crate::util::TEMP_INFIX;

/// Releases an advisory lock when dropped, on every exit path.
struct LockGuard<'a> {
    file: &'a File,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(self.file) {
            tracing::debug!(error = %e, "Failed to release cache file lock");
        }
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || (e.raw_os_error().is_some()
            && e.raw_os_error() == fs2::lock_contended_error().raw_os_error())
}

fn lock_error(path: &Path, e: io::Error) -> StoreError {
    if is_contended(&e) {
        StoreError::LockUnavailable(path.to_path_buf())
    } else {
        StoreError::io(path, e)
    }
}

/// Reads and writes [`CacheFile`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStore;

impl CacheStore {
    pub fn new() -> Self {
        Self
    }

    /// Load the cache file at `path` under a shared lock.
    ///
    /// A missing file is [`LoadOutcome::NotFound`]; content problems are
    /// [`LoadOutcome::Corrupt`]. Only lock contention and I/O failures are
    /// errors.
    pub fn load(&self, path: &Path) -> Result<LoadOutcome, StoreError> {
        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LoadOutcome::NotFound),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        if !metadata.is_file() {
            return Ok(LoadOutcome::Corrupt(CorruptReason::NotRegularFile));
        }

        let file = match File::open(path) {
            Ok(f) => f,
            // Removed between metadata and open
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LoadOutcome::NotFound),
            Err(e) => return Err(StoreError::io(path, e)),
        };

        FileExt::try_lock_shared(&file).map_err(|e| lock_error(path, e))?;
        let guard = LockGuard { file: &file };

        let mut bytes = Vec::new();
        (&file)
            .read_to_end(&mut bytes)
            .map_err(|e| StoreError::io(path, e))?;
        drop(guard);

        let outcome = CacheFile::decode(&bytes);
        if let LoadOutcome::Migrated { from, .. } = &outcome {
            tracing::info!(
                path = %path.display(),
                from = %from,
                to = %FormatVersion::CURRENT,
                "Loaded cache file written by an older release"
            );
        }
        Ok(outcome)
    }

    /// Persist `cache` at `path`.
    ///
    /// The existing file (if any) stays exclusively locked for the whole
    /// write. New content goes to a sibling temp file which is fsynced and
    /// renamed over the target, so the path always holds either the old or
    /// the new record. On success the record is stamped with the current
    /// format version and every entry's dirty flag is cleared.
    pub fn store(&self, path: &Path, cache: &mut CacheFile) -> Result<(), StoreError> {
        let existing = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => Some(f),
            // First write for this feed: nothing to lock, the rename creates it
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(StoreError::io(path, e)),
        };

        let _guard = match &existing {
            Some(file) => {
                FileExt::try_lock_exclusive(file).map_err(|e| lock_error(path, e))?;
                Some(LockGuard { file })
            }
            None => None,
        };

        let previous_version = cache.version;
        cache.version = FormatVersion::CURRENT;
        let bytes = match cache.encode() {
            Ok(b) => b,
            Err(e) => {
                cache.version = previous_version;
                return Err(StoreError::Serialize(e));
            }
        };

        if let Err(e) = write_atomic(path, &bytes) {
            cache.version = previous_version;
            return Err(e);
        }

        for entry in &mut cache.entries {
            entry.dirty = false;
        }
        Ok(())
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    // Randomized suffix: a predictable name could be pre-created by another process
    let random_suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut name = path.as_os_str().to_owned();
    name.push(format!("{}{:016x}", TEMP_INFIX, random_suffix));
    PathBuf::from(name)
}

/// Write-to-temp-then-rename. The destination is never left partial.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let temp_path = temp_path_for(path);

    let mut temp_file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)
        .map_err(|e| StoreError::io(&temp_path, e))?;

    let written = temp_file
        .write_all(bytes)
        .and_then(|()| temp_file.sync_all());
    drop(temp_file);

    if let Err(e) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(StoreError::io(&temp_path, e));
    }

    // POSIX rename is atomic on the same filesystem
    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        StoreError::io(path, e)
    })
}
