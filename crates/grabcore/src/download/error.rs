//! Typed errors for each pipeline stage.
//!
//! Every variant carries owned strings rather than source errors so the
//! terminal reason can live inside `JobState` (which is cloned into watch
//! channels and state histories).

use std::time::Duration;
use thiserror::Error;

use crate::conversion::ProcessingError;
use crate::core::retry::Retryable;
use crate::core::utils::format_bytes;

/// Failures of the format resolver.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolutionError {
    /// The URL yields no playable media
    #[error("no playable media found: {0}")]
    NotFound(String),

    /// The source is recognized but cannot be downloaded (DRM, live, ...)
    #[error("media is not downloadable: {0}")]
    Unsupported(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("extraction backend timed out after {0}s")]
    Timeout(u64),

    /// Any other backend failure (network, bot detection, bad output)
    #[error("extraction backend failed: {0}")]
    Backend(String),
}

impl ResolutionError {
    pub fn user_message(&self) -> String {
        match self {
            ResolutionError::NotFound(_) => {
                "❌ No downloadable media found at this link.\n\nCheck that the URL is correct and public.".to_string()
            }
            ResolutionError::Unsupported(reason) => format!(
                "❌ This media can't be downloaded ({}).\n\nLive streams and DRM-protected videos are not supported.",
                reason
            ),
            ResolutionError::InvalidUrl(_) => "❌ That doesn't look like a valid http(s) link.".to_string(),
            ResolutionError::Timeout(_) => "❌ The video site took too long to answer.\n\nTry again in a minute.".to_string(),
            ResolutionError::Backend(_) => "❌ Failed to analyze the link.\n\nTry again later.".to_string(),
        }
    }
}

/// Failures of the fetch stage.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Transport interruption; retried with backoff inside the fetcher
    #[error("network interrupted after {attempts} attempt(s): {message}")]
    NetworkInterrupted { attempts: u32, message: String },

    /// The remote side throttled us; the job goes back to the queue
    #[error("rate limited by the remote server")]
    QuotaOrRateLimited { retry_after: Option<Duration> },

    /// Non-retryable HTTP status (403, 404, 410, ...)
    #[error("remote server rejected the request with HTTP {status}")]
    Rejected { status: u16 },

    #[error("fetch cancelled")]
    Cancelled,

    #[error("temp storage error: {0}")]
    Io(String),
}

impl FetchError {
    pub fn network(message: impl Into<String>) -> Self {
        FetchError::NetworkInterrupted {
            attempts: 1,
            message: message.into(),
        }
    }
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        matches!(self, FetchError::NetworkInterrupted { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::QuotaOrRateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::Io(err.to_string())
    }
}

/// Failures of the delivery adapter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeliveryError {
    /// Artifact is larger than the transport accepts; nothing was sent
    #[error("file is {size} bytes but the limit is {limit} bytes")]
    SizeExceeded { size: u64, limit: u64 },

    /// The transport refused or failed the upload (after the single retry)
    #[error("transport rejected the file: {0}")]
    TransportRejected(String),

    #[error("artifact missing: {0}")]
    Io(String),
}

/// Why a job ended in `Failed`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobFailure {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// Fetching or Muxing ran past the job deadline
    #[error("job exceeded its deadline of {0}s")]
    Timeout(u64),

    #[error("internal error: {0}")]
    Internal(String),
}

impl JobFailure {
    /// Metrics label for the failure.
    pub fn category(&self) -> &'static str {
        match self {
            JobFailure::Fetch(FetchError::NetworkInterrupted { .. }) => "network",
            JobFailure::Fetch(FetchError::QuotaOrRateLimited { .. }) => "rate_limited",
            JobFailure::Fetch(FetchError::Rejected { .. }) => "rejected",
            JobFailure::Fetch(FetchError::Cancelled) => "cancelled",
            JobFailure::Fetch(FetchError::Io(_)) => "io",
            JobFailure::Processing(err) => err.category(),
            JobFailure::Delivery(DeliveryError::SizeExceeded { .. }) => "size_exceeded",
            JobFailure::Delivery(DeliveryError::TransportRejected(_)) => "transport",
            JobFailure::Delivery(DeliveryError::Io(_)) => "io",
            JobFailure::Timeout(_) => "timeout",
            JobFailure::Internal(_) => "internal",
        }
    }

    /// Specific, actionable text for the chat.
    pub fn user_message(&self) -> String {
        match self {
            JobFailure::Fetch(FetchError::NetworkInterrupted { attempts, .. }) => format!(
                "❌ Download kept getting interrupted ({} attempts).\n\nTry again in a minute.",
                attempts
            ),
            JobFailure::Fetch(FetchError::QuotaOrRateLimited { .. }) => {
                "❌ The video site is rate limiting downloads right now.\n\nTry again later.".to_string()
            }
            JobFailure::Fetch(FetchError::Rejected { status }) => format!(
                "❌ The video site refused the download (HTTP {}).\n\nThe link may have expired; send it again.",
                status
            ),
            JobFailure::Fetch(FetchError::Cancelled) => "Download cancelled.".to_string(),
            JobFailure::Fetch(FetchError::Io(_)) | JobFailure::Delivery(DeliveryError::Io(_)) => {
                "❌ The server ran into a storage problem.\n\nTry again later.".to_string()
            }
            JobFailure::Processing(err) => err.user_message(),
            JobFailure::Delivery(DeliveryError::SizeExceeded { size, limit }) => format!(
                "❌ The file is {} but the maximum I can send is {}.\n\nPick a lower quality.",
                format_bytes(*size),
                format_bytes(*limit)
            ),
            JobFailure::Delivery(DeliveryError::TransportRejected(_)) => {
                "❌ Telegram refused the upload.\n\nTry again or pick a lower quality.".to_string()
            }
            JobFailure::Timeout(secs) => format!(
                "❌ The download took longer than {} minutes and was stopped.\n\nPick a lower quality.",
                secs / 60
            ),
            JobFailure::Internal(_) => "❌ Something went wrong on our side.\n\nTry again later.".to_string(),
        }
    }
}

/// Why `submit` refused a job.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SubmitError {
    /// The session already has a job that hasn't finished
    #[error("session already has an active job ({0})")]
    SessionBusy(String),

    /// The request already has a job that hasn't finished
    #[error("request already has an active job ({0})")]
    RequestActive(String),

    #[error("queue is full ({0} jobs)")]
    QueueFull(usize),

    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    #[error("job queue is shutting down")]
    ShuttingDown,
}

impl SubmitError {
    pub fn user_message(&self) -> String {
        match self {
            SubmitError::SessionBusy(_) | SubmitError::RequestActive(_) => {
                "⏳ You already have a download in progress.\n\nWait for it to finish or send /cancel.".to_string()
            }
            SubmitError::QueueFull(_) => "❌ Too many downloads in the queue right now.\n\nTry again later.".to_string(),
            SubmitError::InvalidSelection(_) => "❌ That option is no longer available. Send the link again.".to_string(),
            SubmitError::ShuttingDown => "❌ The bot is restarting. Try again in a minute.".to_string(),
        }
    }
}
