use futures::StreamExt;
use serde_json::{Map, Value};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;

use super::parser::parse_feed;
use crate::config::Credentials;
use crate::storage::FeedMeta;

const MAX_RETRIES: u32 = 3;
const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that abort a feed's fetch cycle.
///
/// Any of these leaves the feed's cache file untouched; the feed is retried
/// on its next scheduled cycle.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the timeout
    #[error("Request timed out")]
    Timeout,
    /// Feed content could not be parsed as RSS or Atom
    #[error("Parse error: {0}")]
    Parse(String),
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// Local `file://` feed could not be read
    #[error("Failed to read local feed: {0}")]
    Io(#[from] std::io::Error),
}

/// Structured result of a successful fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchedFeed {
    pub meta: FeedMeta,
    /// Entries as opaque key/value content. Only identity fields (`id`,
    /// `link`, `title`) are interpreted by the engine.
    pub entries: Vec<Map<String, Value>>,
    /// Set when the content was malformed but usable. Logged, never persisted.
    pub warning: Option<String>,
}

/// The boundary to whatever retrieves and parses feeds.
pub trait FetchCapability: Send + Sync + 'static {
    fn fetch(
        &self,
        url: &str,
        credentials: Option<&Credentials>,
    ) -> impl Future<Output = Result<FetchedFeed, FetchError>> + Send;
}

/// HTTP(S) and `file://` fetcher backed by `reqwest` and `feed-rs`.
///
/// # Behavior
///
/// - Each request has a 30-second timeout
/// - Rate limiting (HTTP 429), server errors and truncated bodies trigger
///   exponential backoff with up to 3 retries
/// - Response bodies are limited to 10MB
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff_base: Duration,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            backoff_base: Duration::from_secs(1),
        }
    }

    /// First retry waits `2 * base`, then `4 * base`, `8 * base`.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    fn backoff(&self, retry_count: u32) -> Duration {
        self.backoff_base * 2u32.pow(retry_count + 1)
    }

    async fn fetch_bytes(
        &self,
        url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Vec<u8>, FetchError> {
        let mut retry_count = 0;

        loop {
            let mut request = self.client.get(url);
            if let Some(creds) = credentials {
                request = request.basic_auth(&creds.username, Some(creds.password()));
            }

            let response = tokio::time::timeout(REQUEST_TIMEOUT, request.send())
                .await
                .map_err(|_| FetchError::Timeout)?
                .map_err(FetchError::Network)?;

            let status = response.status();
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                if retry_count >= MAX_RETRIES {
                    return Err(if status.is_server_error() {
                        FetchError::HttpStatus(status.as_u16())
                    } else {
                        FetchError::RateLimited(MAX_RETRIES)
                    });
                }

                let delay = self.backoff(retry_count);
                tracing::warn!(
                    feed = %url,
                    status = %status,
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Server refused request, backing off"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            // 4xx errors fail immediately
            if !status.is_success() {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }

            match read_limited_bytes(response, MAX_FEED_SIZE).await {
                Ok(bytes) => return Ok(bytes),
                Err(FetchError::IncompleteResponse { expected, received })
                    if retry_count < MAX_RETRIES =>
                {
                    let delay = self.backoff(retry_count);
                    tracing::debug!(
                        feed = %url,
                        expected = expected,
                        received = received,
                        attempt = retry_count + 1,
                        "Retrying incomplete download"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl FetchCapability for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<FetchedFeed, FetchError> {
        let bytes = match url::Url::parse(url) {
            Ok(parsed) if parsed.scheme() == "file" => {
                let path = parsed
                    .to_file_path()
                    .map_err(|()| FetchError::Parse(format!("Not a local path: {}", url)))?;
                read_limited_file(&path, MAX_FEED_SIZE).await?
            }
            _ => self.fetch_bytes(url, credentials).await?,
        };

        parse_feed(&bytes).map_err(|e| FetchError::Parse(e.to_string()))
    }
}

async fn read_limited_file(path: &Path, limit: usize) -> Result<Vec<u8>, FetchError> {
    let file = tokio::fs::File::open(path).await?;
    if file.metadata().await?.len() > limit as u64 {
        return Err(FetchError::ResponseTooLarge);
    }

    // The file may grow between the size check and the read
    let mut bytes = Vec::new();
    file.take(limit as u64 + 1).read_to_end(&mut bytes).await?;
    if bytes.len() > limit {
        return Err(FetchError::ResponseTooLarge);
    }
    Ok(bytes)
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
