use thiserror::Error;

/// Plumbing failures outside the job taxonomy: subprocess handling and
/// other IO at the edges. Stages map these onto their own error types.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    /// JSON decoding errors (yt-dlp output)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// External process exceeded its time budget
    #[error("Process timed out after {0}s")]
    Timeout(u64),
}
