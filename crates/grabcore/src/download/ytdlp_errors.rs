//! Classification of yt-dlp failures
//!
//! yt-dlp reports everything on stderr as free text. This module maps that
//! text onto the resolver's error taxonomy so the chat gets a specific
//! message instead of a generic failure.

use crate::download::error::ResolutionError;

/// yt-dlp error categories
#[derive(Debug, Clone, PartialEq)]
pub enum YtDlpErrorType {
    /// Video is private, removed, geo-blocked, or the URL isn't media at all
    VideoUnavailable,
    /// Recognized but not downloadable (DRM, upcoming/live broadcast)
    NotDownloadable,
    /// Site detected automation or wants a login
    BotDetection,
    /// Timeouts, DNS, connection resets
    NetworkError,
    Unknown,
}

/// Analyzes yt-dlp stderr and determines the error type
pub fn analyze_ytdlp_error(stderr: &str) -> YtDlpErrorType {
    let stderr_lower = stderr.to_lowercase();

    if stderr_lower.contains("drm protected")
        || stderr_lower.contains("this live event will begin")
        || stderr_lower.contains("premieres in")
        || stderr_lower.contains("is a live stream")
        || stderr_lower.contains("live streams are not supported")
    {
        return YtDlpErrorType::NotDownloadable;
    }

    if stderr_lower.contains("unsupported url")
        || stderr_lower.contains("private video")
        || stderr_lower.contains("video unavailable")
        || stderr_lower.contains("this video is not available")
        || stderr_lower.contains("video has been removed")
        || stderr_lower.contains("this video does not exist")
        || stderr_lower.contains("http error 404")
        || stderr_lower.contains("no video formats found")
    {
        return YtDlpErrorType::VideoUnavailable;
    }

    if stderr_lower.contains("sign in to confirm you're not a bot")
        || stderr_lower.contains("please sign in")
        || stderr_lower.contains("http error 403")
        || stderr_lower.contains("http error 429")
        || stderr_lower.contains("unable to extract")
    {
        return YtDlpErrorType::BotDetection;
    }

    if stderr_lower.contains("timed out")
        || stderr_lower.contains("connection")
        || stderr_lower.contains("network is unreachable")
        || stderr_lower.contains("name or service not known")
        || stderr_lower.contains("temporary failure in name resolution")
    {
        return YtDlpErrorType::NetworkError;
    }

    YtDlpErrorType::Unknown
}

/// Maps yt-dlp stderr onto a resolver error.
pub fn to_resolution_error(stderr: &str) -> ResolutionError {
    let summary = last_error_line(stderr);
    match analyze_ytdlp_error(stderr) {
        YtDlpErrorType::VideoUnavailable => ResolutionError::NotFound(summary),
        YtDlpErrorType::NotDownloadable => ResolutionError::Unsupported(summary),
        YtDlpErrorType::BotDetection | YtDlpErrorType::NetworkError | YtDlpErrorType::Unknown => {
            ResolutionError::Backend(summary)
        }
    }
}

/// Whether the administrator should look at this failure
pub fn should_notify_admin(error_type: &YtDlpErrorType) -> bool {
    matches!(error_type, YtDlpErrorType::BotDetection | YtDlpErrorType::Unknown)
}

/// The last `ERROR:` line of the output, or the last non-empty line.
fn last_error_line(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    lines
        .iter()
        .rev()
        .find(|l| l.starts_with("ERROR:"))
        .or_else(|| lines.last())
        .map(|l| l.trim_start_matches("ERROR:").trim().to_string())
        .unwrap_or_else(|| "yt-dlp exited without output".to_string())
}
