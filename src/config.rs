//! Configuration file parser for ~/.config/feedsync/config.toml, plus the
//! serialized feed list handed to the batch daemon.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are ignored by serde, though we log a warning when the file
//! contains potential typos. Once loaded, configuration is immutable and is
//! passed by reference to each component constructor.
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::storage::Entry;
use crate::util::{cache_file_name, cache_path, validate_feed_url, UrlValidationError};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid feed URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: UrlValidationError,
    },

    #[error("Feed configured twice: {0}")]
    DuplicateFeed(String),

    /// Two distinct URLs derive the same cache file name.
    #[error("Feeds '{first}' and '{second}' map to the same cache file '{name}'")]
    FilenameCollision {
        first: String,
        second: String,
        name: String,
    },

    #[error("Invalid feed list: {0}")]
    FeedList(#[from] serde_json::Error),
}

// ============================================================================
// Content Filters
// ============================================================================

/// Declarative entry predicate.
///
/// Used both as a feed's hard filter (entries failing it are never shown for
/// that feed) and as the reader's selectable view filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentFilter {
    Unread,
    Starred,
    Tagged { tag: String },
    /// Case-insensitive substring match on the title.
    TitleContains { text: String },
    Not { filter: Box<ContentFilter> },
}

impl ContentFilter {
    pub fn matches(&self, entry: &Entry) -> bool {
        match self {
            ContentFilter::Unread => entry.is_unread(),
            ContentFilter::Starred => entry.is_starred(),
            ContentFilter::Tagged { tag } => entry.has_tag(tag),
            ContentFilter::TitleContains { text } => entry
                .title()
                .is_some_and(|t| t.to_lowercase().contains(&text.to_lowercase())),
            ContentFilter::Not { filter } => !filter.matches(entry),
        }
    }
}

// ============================================================================
// Feed Descriptors
// ============================================================================

/// HTTP basic auth for a feed. `Debug` never prints the password.
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// One configured feed, with defaults resolved.
#[derive(Debug, Clone)]
pub struct FeedDescriptor {
    /// Display label. `None` means derive it from the feed title at fetch time.
    pub tag: Option<String>,
    pub url: String,
    /// Minutes between refetches.
    pub rate: u64,
    /// Maximum entries retained.
    pub keep: usize,
    pub credentials: Option<Arc<Credentials>>,
    pub filter: Option<ContentFilter>,
}

impl FeedDescriptor {
    pub fn new(url: impl Into<String>, rate: u64, keep: usize) -> Self {
        Self {
            tag: None,
            url: url.into(),
            rate,
            keep,
            credentials: None,
            filter: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn cache_file_name(&self) -> String {
        cache_file_name(&self.url)
    }

    pub fn cache_path(&self, cache_dir: &Path) -> PathBuf {
        cache_path(cache_dir, &self.url)
    }

    /// Label for log lines: the tag when known, else the URL.
    pub fn label(&self) -> &str {
        self.tag.as_deref().unwrap_or(&self.url)
    }
}

/// Reject malformed URLs, duplicate URLs and URLs whose cache file names
/// collide.
pub fn validate_descriptors(feeds: &[FeedDescriptor]) -> Result<(), ConfigError> {
    let mut by_name: HashMap<String, &str> = HashMap::new();
    for feed in feeds {
        validate_feed_url(&feed.url).map_err(|source| ConfigError::InvalidUrl {
            url: feed.url.clone(),
            source,
        })?;
        let name = feed.cache_file_name();
        if let Some(first) = by_name.insert(name.clone(), &feed.url) {
            if first == feed.url {
                return Err(ConfigError::DuplicateFeed(feed.url.clone()));
            }
            return Err(ConfigError::FilenameCollision {
                first: first.to_owned(),
                second: feed.url.clone(),
                name,
            });
        }
    }
    Ok(())
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// A `[[feeds]]` table as written by the user.
#[derive(Clone, Deserialize)]
pub struct FeedConfig {
    pub url: String,
    pub tag: Option<String>,
    pub rate: Option<u64>,
    pub keep: Option<usize>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub filter: Option<ContentFilter>,
}

/// Mask password in Debug output.
impl std::fmt::Debug for FeedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedConfig")
            .field("url", &self.url)
            .field("tag", &self.tag)
            .field("rate", &self.rate)
            .field("keep", &self.keep)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("filter", &self.filter)
            .finish()
    }
}

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding one cache file per feed.
    pub cache_dir: Option<PathBuf>,

    /// Where the serialized feed list for the batch daemon lives.
    pub feed_list: Option<PathBuf>,

    /// Refetch interval in minutes for feeds without `rate`.
    pub default_rate: u64,

    /// Retention limit for feeds without `keep`.
    pub default_keep: usize,

    /// Seconds per worker tick in watch mode. Feed rates count in ticks.
    pub tick_seconds: u64,

    /// Selectable reader view filters. Index 0 is always "no filter".
    pub filters: Vec<ContentFilter>,

    /// Initially active view filter (0 = none, n = `filters[n - 1]`).
    pub active_filter: usize,

    pub feeds: Vec<FeedConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: None,
            feed_list: None,
            default_rate: 5,
            default_keep: 40,
            tick_seconds: 60,
            filters: Vec::new(),
            active_filter: 0,
            feeds: Vec::new(),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 8] = [
        "cache_dir",
        "feed_list",
        "default_rate",
        "default_keep",
        "tick_seconds",
        "filters",
        "active_filter",
        "feeds",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check size before reading to avoid loading a huge corrupted file
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::parse(&content)
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        tracing::info!(feeds = config.feeds.len(), "Loaded configuration");
        Ok(config)
    }

    /// Resolve `[[feeds]]` into validated descriptors, in declaration order.
    pub fn feeds(&self) -> Result<Vec<FeedDescriptor>, ConfigError> {
        let mut feeds = Vec::with_capacity(self.feeds.len());
        for fc in &self.feeds {
            let credentials = match (&fc.username, &fc.password) {
                (Some(user), Some(pass)) => Some(Arc::new(Credentials::new(user, pass))),
                (Some(user), None) => Some(Arc::new(Credentials::new(user, ""))),
                (None, Some(_)) => {
                    tracing::warn!(feed = %fc.url, "Password without username, ignoring");
                    None
                }
                (None, None) => None,
            };

            feeds.push(FeedDescriptor {
                tag: fc.tag.clone().filter(|t| !t.is_empty()),
                url: fc.url.clone(),
                rate: fc.rate.unwrap_or(self.default_rate),
                keep: fc.keep.unwrap_or(self.default_keep),
                credentials,
                filter: fc.filter.clone(),
            });
        }
        validate_descriptors(&feeds)?;
        Ok(feeds)
    }

    /// View filters with the implicit "no filter" in slot 0.
    pub fn view_filters(&self) -> Vec<Option<ContentFilter>> {
        std::iter::once(None)
            .chain(self.filters.iter().cloned().map(Some))
            .collect()
    }

    /// Active view filter index, reset to 0 when out of range.
    pub fn active_filter_index(&self) -> usize {
        if self.active_filter > self.filters.len() {
            tracing::warn!(
                active = self.active_filter,
                available = self.filters.len(),
                "active_filter out of range, using no filter"
            );
            return 0;
        }
        self.active_filter
    }
}

// ============================================================================
// Feed List
// ============================================================================

/// One row of the batch daemon's input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedListEntry {
    pub tag: Option<String>,
    pub url: String,
    pub rate: u64,
    pub keep: usize,
}

/// The serialized `{tag, url, rate, keep}` list shared with the batch daemon.
///
/// Deliberately narrower than [`Config`]: no credentials, no filters. The
/// interactive side regenerates it every time the configuration loads.
pub struct FeedList;

impl FeedList {
    pub fn entries(feeds: &[FeedDescriptor]) -> Vec<FeedListEntry> {
        feeds
            .iter()
            .map(|f| FeedListEntry {
                tag: f.tag.clone(),
                url: f.url.clone(),
                rate: f.rate,
                keep: f.keep,
            })
            .collect()
    }

    /// Atomically write the list for `feeds` to `path`.
    pub fn write(path: &Path, feeds: &[FeedDescriptor]) -> Result<(), ConfigError> {
        let json = serde_json::to_vec_pretty(&Self::entries(feeds))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension("tmp");
        let mut file = std::fs::File::create(&temp_path)?;
        let written = file.write_all(&json).and_then(|()| file.sync_all());
        drop(file);
        if let Err(e) = written.and_then(|()| std::fs::rename(&temp_path, path)) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(ConfigError::Io(e));
        }
        Ok(())
    }

    /// Read and validate the list at `path`.
    pub fn read(path: &Path) -> Result<Vec<FeedDescriptor>, ConfigError> {
        let bytes = std::fs::read(path)?;
        Self::decode(&bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Vec<FeedDescriptor>, ConfigError> {
        let entries: Vec<FeedListEntry> = serde_json::from_slice(bytes)?;
        let feeds: Vec<FeedDescriptor> = entries
            .into_iter()
            .map(|e| FeedDescriptor {
                tag: e.tag.filter(|t| !t.is_empty()),
                url: e.url,
                rate: e.rate,
                keep: e.keep,
                credentials: None,
                filter: None,
            })
            .collect();
        validate_descriptors(&feeds)?;
        Ok(feeds)
    }
}

// ============================================================================
// Tests
// ============================================================================
