//! Process execution utilities with timeout support
//!
//! Helpers for running short-lived external processes (yt-dlp metadata
//! queries, ffprobe) with a time budget so a hung process cannot block a
//! worker. Children are spawned with `kill_on_drop`, so a timed-out process
//! is reaped instead of lingering.

use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

use crate::core::error::AppError;

/// Default timeout for ffprobe metadata queries (30 seconds)
pub const FFPROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Run an async Command with a timeout.
///
/// Returns the process Output on success, or an AppError on timeout/IO failure.
/// A missing binary surfaces as `AppError::Io` with `ErrorKind::NotFound`.
pub async fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<Output, AppError> {
    cmd.kill_on_drop(true);
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(AppError::Io(e)),
        Err(_) => Err(AppError::Timeout(timeout.as_secs())),
    }
}

/// True when the error means the binary itself could not be started.
pub fn is_spawn_failure(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
    )
}
