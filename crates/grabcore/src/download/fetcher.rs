//! Fetcher: streams one format to a local temp file.
//!
//! Interrupted transfers are retried with exponential backoff. Every
//! attempt starts from an empty file (the `.part` file of an aborted
//! attempt is removed first), and the final name only appears once the
//! whole body has been written.

use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::core::metrics;
use crate::core::retry::{RetryConfig, Retryable};
use crate::download::error::FetchError;
use crate::download::model::FormatOption;
use crate::download::source::StreamSource;

/// Progress callback: bytes received so far in this attempt, advertised total.
pub type FetchProgress<'a> = dyn Fn(u64, Option<u64>) + Send + Sync + 'a;

pub struct Fetcher {
    source: Arc<dyn StreamSource>,
    retry: RetryConfig,
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

async fn remove_if_exists(path: &Path) {
    match fs_err::tokio::remove_file(path).await {
        Ok(()) => log::debug!("Removed partial file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove {}: {}", path.display(), e),
    }
}

impl Fetcher {
    pub fn new(source: Arc<dyn StreamSource>, retry: RetryConfig) -> Self {
        Self { source, retry }
    }

    /// Streams `format` into `dest`.
    ///
    /// Returns `dest` once the full body is on disk. `NetworkInterrupted`
    /// is only returned after the retry budget is spent; other errors are
    /// returned immediately. No partial file survives a failed call.
    pub async fn fetch(
        &self,
        format: &FormatOption,
        dest: &Path,
        on_progress: &FetchProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, FetchError> {
        let part = part_path(dest);
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            remove_if_exists(&part).await;
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            let outcome = self.attempt(format, &part, on_progress, cancel).await;
            match outcome {
                Ok(bytes) => {
                    fs_err::tokio::rename(&part, dest).await?;
                    metrics::record_fetched_bytes(bytes);
                    metrics::record_stage_duration("fetch", started.elapsed().as_secs_f64());
                    log::info!(
                        "Fetched format {} ({} bytes, {} attempt(s)) -> {}",
                        format.id,
                        bytes,
                        attempt + 1,
                        dest.display()
                    );
                    return Ok(dest.to_path_buf());
                }
                Err(err) => {
                    remove_if_exists(&part).await;
                    attempt += 1;

                    if !err.is_retryable() {
                        log::warn!("Fetch of format {} failed: {}", format.id, err);
                        return Err(err);
                    }
                    let message = match &err {
                        FetchError::NetworkInterrupted { message, .. } => message.clone(),
                        other => other.to_string(),
                    };
                    if attempt >= self.retry.max_attempts {
                        log::error!(
                            "Fetch of format {} gave up after {} attempt(s): {}",
                            format.id,
                            attempt,
                            message
                        );
                        return Err(FetchError::NetworkInterrupted {
                            attempts: attempt,
                            message,
                        });
                    }

                    let delay = self.retry.delay_for_attempt(attempt - 1);
                    log::warn!(
                        "Fetch of format {} interrupted (attempt {}/{}): {}. Retrying in {:?}",
                        format.id,
                        attempt,
                        self.retry.max_attempts,
                        message,
                        delay
                    );
                    metrics::record_fetch_retry();
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One transfer attempt into `part`. Returns the number of bytes written.
    async fn attempt(
        &self,
        format: &FormatOption,
        part: &Path,
        on_progress: &FetchProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64, FetchError> {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            opened = self.source.open(format) => opened?,
        };
        let total = stream.total;
        let mut body = stream.body;
        let mut file = fs_err::tokio::File::create(part).await?;
        let mut received: u64 = 0;
        on_progress(0, total);

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                chunk = body.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    file.write_all(&bytes).await?;
                    received += bytes.len() as u64;
                    on_progress(received, total);
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }
        file.flush().await?;

        if let Some(expected) = total {
            if received < expected {
                return Err(FetchError::network(format!(
                    "body ended after {} of {} bytes",
                    received, expected
                )));
            }
        }
        Ok(received)
    }
}
