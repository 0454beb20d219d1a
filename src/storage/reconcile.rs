//! Cache directory housekeeping, run once per invocation before any fetch.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use super::lock_file::STALE_LOCK_AGE;
use super::types::StoreError;
use crate::config::FeedDescriptor;
use crate::util::{legacy_file_name, LOCK_SUFFIX, TEMP_INFIX};

/// What a reconciliation pass changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// `(old name, new name)` pairs of legacy tag-named files
    pub renamed: Vec<(String, String)>,
    /// Non-file cache paths of configured feeds that were deleted
    pub legacy_layouts: Vec<String>,
    /// Orphaned entries that were deleted
    pub removed: Vec<String>,
    /// Deletions or renames that failed (logged, not fatal)
    pub failures: usize,
}

/// Delete `path` if it exists but is not a regular file.
///
/// Very old releases kept a directory per feed. Such a path cannot hold a
/// cache file, so it is removed (recursively) and the feed is treated as
/// never fetched. Returns whether anything was removed.
pub fn remove_legacy_layout(path: &Path) -> io::Result<bool> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if metadata.is_file() {
        return Ok(false);
    }

    tracing::warn!(path = %path.display(), "Cache path is not a regular file, old format? Deleting");
    if metadata.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(true)
}

/// Scans one cache directory against the configured feeds.
pub struct DirectoryReconciler<'a> {
    dir: &'a Path,
    feeds: &'a [FeedDescriptor],
    temp_grace: Duration,
}

impl<'a> DirectoryReconciler<'a> {
    pub fn new(dir: &'a Path, feeds: &'a [FeedDescriptor]) -> Self {
        Self {
            dir,
            feeds,
            temp_grace: STALE_LOCK_AGE,
        }
    }

    /// Run every housekeeping step in order: ensure the directory, rename
    /// legacy files, drop legacy layouts, delete orphans.
    ///
    /// Only failure to create or list the directory is an error; per-file
    /// failures are logged and counted.
    pub fn reconcile(&self) -> Result<ReconcileReport, StoreError> {
        self.ensure_dir()?;

        let mut report = ReconcileReport::default();
        self.migrate_legacy_names(&mut report)?;
        self.remove_legacy_layouts(&mut report);
        self.remove_orphans(&mut report)?;

        if !report.renamed.is_empty() || !report.removed.is_empty() {
            tracing::info!(
                dir = %self.dir.display(),
                renamed = report.renamed.len(),
                removed = report.removed.len(),
                failures = report.failures,
                "Reconciled cache directory"
            );
        }
        Ok(report)
    }

    fn ensure_dir(&self) -> Result<(), StoreError> {
        match fs::metadata(self.dir) {
            Ok(m) if m.is_dir() => return Ok(()),
            Ok(_) => {
                tracing::warn!(path = %self.dir.display(), "Cache directory path is a file, replacing");
                fs::remove_file(self.dir).map_err(|e| StoreError::io(self.dir, e))?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(self.dir, e)),
        }
        fs::create_dir_all(self.dir).map_err(|e| StoreError::io(self.dir, e))
    }

    fn list(&self) -> Result<Vec<String>, StoreError> {
        let entries = fs::read_dir(self.dir).map_err(|e| StoreError::io(self.dir, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(self.dir, e))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn valid_names(&self) -> HashSet<String> {
        self.feeds.iter().map(FeedDescriptor::cache_file_name).collect()
    }

    fn migrate_legacy_names(&self, report: &mut ReconcileReport) -> Result<(), StoreError> {
        let valid = self.valid_names();
        let names: HashSet<String> = self.list()?.into_iter().collect();

        for feed in self.feeds {
            let Some(tag) = feed.tag.as_deref() else {
                continue;
            };
            let legacy = legacy_file_name(tag);
            if valid.contains(&legacy) || !names.contains(&legacy) {
                continue;
            }

            let current = feed.cache_file_name();
            let target = self.dir.join(&current);
            if target.exists() {
                tracing::warn!(
                    legacy = %legacy,
                    current = %current,
                    "Legacy cache file shadowed by current one, leaving it for cleanup"
                );
                continue;
            }

            tracing::info!(from = %legacy, to = %current, "Detected old disk format, converting");
            match fs::rename(self.dir.join(&legacy), &target) {
                Ok(()) => report.renamed.push((legacy, current)),
                Err(e) => {
                    tracing::warn!(file = %legacy, error = %e, "Failed to rename legacy cache file");
                    report.failures += 1;
                }
            }
        }
        Ok(())
    }

    fn remove_legacy_layouts(&self, report: &mut ReconcileReport) {
        for feed in self.feeds {
            let path = feed.cache_path(self.dir);
            match remove_legacy_layout(&path) {
                Ok(true) => report.legacy_layouts.push(feed.cache_file_name()),
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to delete legacy layout");
                    report.failures += 1;
                }
            }
        }
    }

    fn is_young_temp(&self, valid: &HashSet<String>, name: &str, path: &Path) -> bool {
        let Some((base, _)) = name.rsplit_once(TEMP_INFIX) else {
            return false;
        };
        if !valid.contains(base) {
            return false;
        }
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| SystemTime::now().duration_since(t).ok())
            .is_some_and(|age| age < self.temp_grace)
    }

    fn remove_orphans(&self, report: &mut ReconcileReport) -> Result<(), StoreError> {
        let valid = self.valid_names();

        for name in self.list()? {
            let base = name.strip_suffix(LOCK_SUFFIX).unwrap_or(&name);
            if valid.contains(base) {
                continue;
            }
            let path: PathBuf = self.dir.join(&name);
            if self.is_young_temp(&valid, &name, &path) {
                continue;
            }

            let result = match fs::symlink_metadata(&path) {
                Ok(m) if m.is_dir() => fs::remove_dir_all(&path),
                Ok(_) => fs::remove_file(&path),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    tracing::info!(file = %name, "Deleted extraneous file");
                    report.removed.push(name);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(file = %name, error = %e, "Failed to delete extraneous file");
                    report.failures += 1;
                }
            }
        }
        Ok(())
    }
}
