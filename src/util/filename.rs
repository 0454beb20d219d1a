use std::path::{Path, PathBuf};

/// Character substituted for path separators in derived file names.
pub const SEPARATOR_SUBSTITUTE: char = ' ';

/// Suffix of the batch daemon's per-feed lock marker.
pub const LOCK_SUFFIX: &str = ".lock";

/// Infix of in-flight temp files written by the cache store.
pub const TEMP_INFIX: &str = ".tmp.";

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' => SEPARATOR_SUBSTITUTE,
            c => c,
        })
        .collect()
}

/// Cache file name for a feed, derived from its URL.
///
/// ```
/// use feedsync::util::cache_file_name;
///
/// assert_eq!(
///     cache_file_name("http://example.com/rss"),
///     "http:  example.com rss"
/// );
/// ```
pub fn cache_file_name(url: &str) -> String {
    sanitize(url)
}

/// File name used by old releases, which keyed cache files by feed tag.
pub fn legacy_file_name(tag: &str) -> String {
    sanitize(tag)
}

/// `<cache_dir>/<derived name>` for a feed URL.
pub fn cache_path(cache_dir: &Path, url: &str) -> PathBuf {
    cache_dir.join(cache_file_name(url))
}

/// `<cache path>.lock`
pub fn lock_path(cache_path: &Path) -> PathBuf {
    let mut name = cache_path.as_os_str().to_owned();
    name.push(LOCK_SUFFIX);
    PathBuf::from(name)
}
