use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// State Tags
// ============================================================================

/// Entry has not been read.
pub const STATE_UNREAD: &str = "unread";
/// Entry has been read.
pub const STATE_READ: &str = "read";
/// Entry is starred. Absence means unstarred.
pub const STATE_STARRED: &str = "starred";
/// Entry first appeared in the most recent fetch that saw it.
pub const STATE_NEW: &str = "new";

// ============================================================================
// Error Types
// ============================================================================

/// Cache store errors that are not classifications of file content.
///
/// Content problems (bad JSON, wrong version) are reported through
/// [`LoadOutcome::Corrupt`] instead, so callers cannot mistake them for I/O.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another process holds a conflicting lock on the cache file
    #[error("Cache file is locked by another process: {0}")]
    LockUnavailable(PathBuf),

    /// Filesystem operation failed
    #[error("Cache I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Cache file could not be serialized
    #[error("Failed to serialize cache file: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Why a cache file could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorruptReason {
    /// Written by a release whose format can no longer be read
    TooOld { found: Option<FormatVersion> },
    /// Written by a newer, incompatible release
    TooNew { found: FormatVersion },
    /// Bytes are not a cache file at all
    Unreadable(String),
    /// Path exists but is a directory or special file
    NotRegularFile,
}

impl fmt::Display for CorruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorruptReason::TooOld { found: Some(v) } => {
                write!(f, "format {} is too old (need {}.x)", v, FormatVersion::CURRENT.major)
            }
            CorruptReason::TooOld { found: None } => write!(f, "unversioned legacy format"),
            CorruptReason::TooNew { found } => write!(
                f,
                "format {} is newer than supported {}",
                found,
                FormatVersion::CURRENT
            ),
            CorruptReason::Unreadable(msg) => write!(f, "unreadable: {}", msg),
            CorruptReason::NotRegularFile => write!(f, "not a regular file"),
        }
    }
}

/// Result of loading a cache file.
///
/// `NotFound` is the normal state of a feed that was never fetched and is
/// not an error. `Corrupt` means user data is present but unusable; callers
/// must skip the feed rather than overwrite it.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Current(CacheFile),
    /// Older minor version of the current major format. Loadable as is;
    /// rewritten at the current version on the next store.
    Migrated {
        cache: CacheFile,
        from: FormatVersion,
    },
    NotFound,
    Corrupt(CorruptReason),
}

impl LoadOutcome {
    /// Usable cache content, if any.
    pub fn into_cache(self) -> Option<CacheFile> {
        match self {
            LoadOutcome::Current(cache) | LoadOutcome::Migrated { cache, .. } => Some(cache),
            LoadOutcome::NotFound | LoadOutcome::Corrupt(_) => None,
        }
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// On-disk format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FormatVersion {
    pub major: u32,
    pub minor: u32,
}

impl FormatVersion {
    pub const CURRENT: FormatVersion = FormatVersion { major: 1, minor: 1 };
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Feed-level metadata. `title` is the only field the engine reads; the rest
/// is carried verbatim from the fetch result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Persisted state of one feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheFile {
    pub version: FormatVersion,
    #[serde(default)]
    pub feed: FeedMeta,
    /// Feed-level state list, carried across fetches.
    #[serde(default)]
    pub state: Vec<String>,
    /// Unix seconds of the last successful fetch. 0 = never.
    #[serde(default)]
    pub last_update: i64,
    #[serde(default)]
    pub entries: Vec<Entry>,
}

/// Only the version field, decoded before the full record so a format
/// change in a later major release is classified instead of failing as
/// unreadable.
#[derive(Deserialize)]
struct VersionProbe {
    version: Option<FormatVersion>,
}

impl Default for CacheFile {
    fn default() -> Self {
        Self::empty()
    }
}

impl CacheFile {
    /// Skeleton for a feed that has never been fetched.
    pub fn empty() -> Self {
        Self {
            version: FormatVersion::CURRENT,
            feed: FeedMeta::default(),
            state: Vec::new(),
            last_update: 0,
            entries: Vec::new(),
        }
    }

    /// Classify and decode raw cache bytes.
    pub fn decode(bytes: &[u8]) -> LoadOutcome {
        let probe: VersionProbe = match serde_json::from_slice(bytes) {
            Ok(p) => p,
            Err(e) => return LoadOutcome::Corrupt(CorruptReason::Unreadable(e.to_string())),
        };

        let found = match probe.version {
            Some(v) => v,
            None => return LoadOutcome::Corrupt(CorruptReason::TooOld { found: None }),
        };
        if found.major < FormatVersion::CURRENT.major {
            return LoadOutcome::Corrupt(CorruptReason::TooOld { found: Some(found) });
        }
        if found.major > FormatVersion::CURRENT.major {
            return LoadOutcome::Corrupt(CorruptReason::TooNew { found });
        }

        let cache: CacheFile = match serde_json::from_slice(bytes) {
            Ok(c) => c,
            Err(e) => return LoadOutcome::Corrupt(CorruptReason::Unreadable(e.to_string())),
        };

        if found.minor < FormatVersion::CURRENT.minor {
            LoadOutcome::Migrated { cache, from: found }
        } else {
            LoadOutcome::Current(cache)
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Whether a feed with `rate_minutes` should be refetched at `now`.
    pub fn is_due(&self, rate_minutes: u64, now: i64, force: bool) -> bool {
        if force {
            return true;
        }
        let interval = i64::try_from(rate_minutes.saturating_mul(60)).unwrap_or(i64::MAX);
        now.saturating_sub(self.last_update) >= interval
    }
}

/// One feed item.
///
/// Identity is `id` alone. Content lives in `fields` as opaque JSON and is
/// replaced wholesale on every fetch; `state` is owned by the user and
/// survives fetches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub state: Vec<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    /// State changed locally and not yet persisted.
    #[serde(skip)]
    pub dirty: bool,
}

impl Entry {
    /// Build an entry from fetched fields, resolving identity from the
    /// explicit `id`, else `link`, else `title`.
    ///
    /// A fetched `state` key would collide with the entry's own state on
    /// disk, so it is kept as `content_state` instead.
    pub fn from_fields(mut fields: Map<String, Value>) -> Self {
        let explicit = match fields.remove("id") {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
            _ => None,
        };
        if let Some(value) = fields.remove("state") {
            let mut key = String::from("content_state");
            while fields.contains_key(&key) {
                key.insert(0, '_');
            }
            fields.insert(key, value);
        }
        let mut entry = Self {
            id: explicit,
            state: Vec::new(),
            fields,
            dirty: false,
        };
        if entry.id.is_none() {
            entry.id = entry.derived_id();
        }
        entry
    }

    /// Fill in a missing identity from `link` or `title`.
    pub(crate) fn ensure_identity(&mut self) {
        if self.id.as_deref().map_or(true, |id| id.trim().is_empty()) {
            self.id = self.derived_id();
        }
    }

    fn derived_id(&self) -> Option<String> {
        self.field_str("link")
            .or_else(|| self.field_str("title"))
            .map(str::to_owned)
    }

    /// String value of a content field, ignoring empty strings.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn title(&self) -> Option<&str> {
        self.field_str("title")
    }

    pub fn link(&self) -> Option<&str> {
        self.field_str("link")
    }

    /// Both entries have an identity and it is the same.
    pub fn same_identity(&self, other: &Entry) -> bool {
        matches!((&self.id, &other.id), (Some(a), Some(b)) if a == b)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.state.iter().any(|t| t == tag)
    }

    /// Add a tag without marking the entry dirty. Returns whether it was added.
    pub(crate) fn insert_tag(&mut self, tag: &str) -> bool {
        if self.has_tag(tag) {
            return false;
        }
        self.state.push(tag.to_owned());
        true
    }

    fn drop_tag(&mut self, tag: &str) -> bool {
        let before = self.state.len();
        self.state.retain(|t| t != tag);
        self.state.len() != before
    }

    /// User action: add a tag.
    pub fn add_tag(&mut self, tag: &str) {
        if self.insert_tag(tag) {
            self.dirty = true;
        }
    }

    /// User action: remove a tag.
    pub fn remove_tag(&mut self, tag: &str) {
        if self.drop_tag(tag) {
            self.dirty = true;
        }
    }

    pub fn is_unread(&self) -> bool {
        self.has_tag(STATE_UNREAD)
    }

    pub fn is_starred(&self) -> bool {
        self.has_tag(STATE_STARRED)
    }

    pub fn mark_read(&mut self) {
        let changed = self.drop_tag(STATE_UNREAD) | self.insert_tag(STATE_READ);
        self.dirty |= changed;
    }

    pub fn mark_unread(&mut self) {
        let changed = self.drop_tag(STATE_READ) | self.insert_tag(STATE_UNREAD);
        self.dirty |= changed;
    }

    pub fn set_starred(&mut self, starred: bool) {
        if starred {
            self.add_tag(STATE_STARRED);
        } else {
            self.remove_tag(STATE_STARRED);
        }
    }

    /// Clear the `new` marker once the reader has shown the entry.
    pub fn clear_new(&mut self) {
        self.remove_tag(STATE_NEW);
    }
}
