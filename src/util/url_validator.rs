use thiserror::Error;
use url::Url;

/// Errors that can occur while validating a configured feed URL.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme the fetcher cannot speak.
    #[error("Unsupported scheme: {0} (only http, https and file allowed)")]
    UnsupportedScheme(String),
    /// An http(s) URL without a host.
    #[error("URL has no host: {0}")]
    MissingHost(String),
}

/// Validates a URL string for use as a feed source.
///
/// Feeds are declared by the user, so unlike a discovery flow there is no
/// private-address policy here: local feeds (`file://`, intranet hosts) are
/// legitimate. Only malformed URLs and unusable schemes are rejected.
///
/// # Examples
///
/// ```
/// use feedsync::util::validate_feed_url;
///
/// let url = validate_feed_url("https://example.com/feed.xml").unwrap();
/// assert_eq!(url.host_str(), Some("example.com"));
///
/// assert!(validate_feed_url("ftp://example.com/feed").is_err());
/// assert!(validate_feed_url("not a url").is_err());
/// ```
pub fn validate_feed_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str)?;

    match url.scheme() {
        "http" | "https" => {
            if url.host_str().map_or(true, str::is_empty) {
                return Err(UrlValidationError::MissingHost(url_str.to_owned()));
            }
        }
        "file" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_urls() {
        assert!(validate_feed_url("https://example.com/feed.xml").is_ok());
        assert!(validate_feed_url("http://news.example.org").is_ok());
        assert!(validate_feed_url("http://127.0.0.1:8080/rss").is_ok());
    }

    #[test]
    fn test_file_scheme_accepted() {
        assert!(validate_feed_url("file:///home/user/feed.xml").is_ok());
    }

    #[test]
    fn test_invalid_schemes() {
        let err = validate_feed_url("ftp://example.com").unwrap_err();
        assert!(matches!(err, UrlValidationError::UnsupportedScheme(s) if s == "ftp"));
        assert!(validate_feed_url("gopher://example.com").is_err());
    }

    #[test]
    fn test_unparseable_rejected() {
        let err = validate_feed_url("example.com/feed").unwrap_err();
        assert!(matches!(err, UrlValidationError::InvalidUrl(_)));
    }
}
