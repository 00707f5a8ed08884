//! Byte sources the fetcher streams from.
//!
//! `StreamSource` is the seam between the fetcher and the network. The
//! production implementation streams a format's direct URL over HTTP and
//! maps statuses onto the fetch error taxonomy:
//! - 429 -> `QuotaOrRateLimited` (with `Retry-After` when present)
//! - 5xx and transport errors -> `NetworkInterrupted` (retried)
//! - any other non-success status -> `Rejected` (fatal)

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::StatusCode;
use std::time::Duration;

use crate::core::config;
use crate::download::error::FetchError;
use crate::download::model::FormatOption;

/// An opened remote stream.
pub struct ByteStream {
    /// Advertised length, if the server sent one
    pub total: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, FetchError>>,
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream").field("total", &self.total).finish_non_exhaustive()
    }
}

#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Opens the stream behind `format`.
    async fn open(&self, format: &FormatOption) -> Result<ByteStream, FetchError>;
}

/// Streams formats straight from their CDN URL.
pub struct HttpStreamSource {
    client: reqwest::Client,
}

impl HttpStreamSource {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpStreamSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-format headers reported by the extraction backend.
fn header_map(headers: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => log::debug!("Skipping unusable header {:?}", name),
        }
    }
    map
}

/// `Retry-After` in its delta-seconds form, capped at the longest cooldown we honor.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs.min(config::download::MAX_RATE_LIMIT_COOLDOWN_SECS)))
}

/// Maps a non-success HTTP status onto a fetch error.
pub fn status_error(status: StatusCode, headers: &HeaderMap) -> FetchError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        FetchError::QuotaOrRateLimited {
            retry_after: parse_retry_after(headers),
        }
    } else if status.is_server_error() {
        FetchError::network(format!("HTTP {}", status.as_u16()))
    } else {
        FetchError::Rejected { status: status.as_u16() }
    }
}

fn transport_error(err: reqwest::Error) -> FetchError {
    FetchError::network(err.to_string())
}

#[async_trait]
impl StreamSource for HttpStreamSource {
    async fn open(&self, format: &FormatOption) -> Result<ByteStream, FetchError> {
        let response = self
            .client
            .get(&format.url)
            .headers(header_map(&format.http_headers))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            log::warn!("HTTP {} for format {}", status, format.id);
            return Err(status_error(status, response.headers()));
        }

        let total = response.content_length();
        let body = response.bytes_stream().map_err(transport_error).boxed();
        Ok(ByteStream { total, body })
    }
}
