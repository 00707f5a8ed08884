//! ffmpeg/ffprobe implementation of [`MediaTool`].

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{Invocation, MediaTool, ProcessingError, ProcessingResult, ToolParams, ToolProgress};
use crate::core::config;
use crate::core::error::AppError;
use crate::core::process::{is_spawn_failure, run_with_timeout, FFPROBE_TIMEOUT};

/// How long ffmpeg gets to finish after receiving `q` before it is killed
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Only the tail of stderr is kept for error messages
const STDERR_TAIL_BYTES: usize = 2000;

pub struct FfmpegTool {
    ffmpeg: String,
    ffprobe: String,
}

impl Default for FfmpegTool {
    fn default() -> Self {
        Self::new(config::FFMPEG_BIN.as_str(), config::FFPROBE_BIN.as_str())
    }
}

impl FfmpegTool {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    fn build_command(&self, invocation: &Invocation) -> Command {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-hide_banner", "-loglevel", "error", "-nostats", "-y", "-progress", "pipe:1"]);
        for input in &invocation.inputs {
            cmd.arg("-i").arg(input);
        }

        match &invocation.params {
            ToolParams::Mux { container } => {
                cmd.args(["-map", "0:v:0", "-map", "1:a:0", "-c", "copy"]);
                if matches!(container.as_str(), "mp4" | "mov") {
                    cmd.args(["-movflags", "+faststart"]);
                }
            }
            ToolParams::ExtractAudio { codec, bitrate_kbps } => {
                cmd.args(["-vn", "-map", "0:a:0", "-c:a", codec.encoder()]);
                cmd.arg("-b:a").arg(format!("{}k", bitrate_kbps));
            }
        }

        cmd.arg(&invocation.output);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn unavailable(&self, binary: &str, err: &std::io::Error) -> ProcessingError {
        ProcessingError::ExternalToolUnavailable(format!("{}: {}", binary, err))
    }
}

/// Parses a `-progress` line into processed seconds.
///
/// Both `out_time_us` and `out_time_ms` are reported in microseconds.
fn parse_progress_line(line: &str) -> Option<f64> {
    let (key, value) = line.split_once('=')?;
    match key.trim() {
        "out_time_us" | "out_time_ms" => value.trim().parse::<i64>().ok().map(|us| us.max(0) as f64 / 1_000_000.0),
        _ => None,
    }
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_TAIL_BYTES {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_TAIL_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

#[async_trait]
impl MediaTool for FfmpegTool {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn is_available(&self) -> bool {
        for binary in [&self.ffmpeg, &self.ffprobe] {
            let mut cmd = Command::new(binary);
            cmd.arg("-version");
            match run_with_timeout(&mut cmd, Duration::from_secs(10)).await {
                Ok(output) if output.status.success() => {}
                Ok(output) => {
                    log::error!("{} -version exited with {}", binary, output.status);
                    return false;
                }
                Err(e) => {
                    log::error!("{} is not available: {}", binary, e);
                    return false;
                }
            }
        }
        true
    }

    async fn invoke(
        &self,
        invocation: &Invocation,
        on_progress: &ToolProgress<'_>,
        cancel: &CancellationToken,
    ) -> ProcessingResult<()> {
        let mut child = match self.build_command(invocation).spawn() {
            Ok(child) => child,
            Err(e) if is_spawn_failure(&e) => return Err(self.unavailable(&self.ffmpeg, &e)),
            Err(e) => return Err(e.into()),
        };

        let mut stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProcessingError::Io("ffmpeg stdout not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProcessingError::Io("ffmpeg stderr not captured".to_string()))?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut cancelled = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let (Some(done), Some(total)) = (parse_progress_line(&line), invocation.expected_duration) {
                            if total > 0.0 {
                                on_progress((done / total).clamp(0.0, 1.0));
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("Failed to read ffmpeg progress: {}", e);
                        break;
                    }
                },
            }
        }

        if cancelled {
            log::info!("Stopping ffmpeg for {}", invocation.output.display());
            if let Some(stdin) = stdin.as_mut() {
                let _ = stdin.write_all(b"q\n").await;
                let _ = stdin.flush().await;
            }
            if tokio::time::timeout(CANCEL_GRACE, child.wait()).await.is_err() {
                log::warn!("ffmpeg ignored q, killing it");
                let _ = child.kill().await;
            }
            stderr_task.abort();
            return Err(ProcessingError::Cancelled);
        }

        drop(stdin);
        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            log::error!("ffmpeg failed ({}): {}", status, stderr.trim());
            return Err(ProcessingError::ToolFailed {
                tool: "ffmpeg".to_string(),
                message: stderr_tail(&stderr),
            });
        }
        on_progress(1.0);
        Ok(())
    }

    async fn probe_duration(&self, path: &Path) -> ProcessingResult<f64> {
        let mut cmd = Command::new(&self.ffprobe);
        cmd.args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path);

        let output = match run_with_timeout(&mut cmd, FFPROBE_TIMEOUT).await {
            Ok(output) => output,
            Err(AppError::Io(e)) if is_spawn_failure(&e) => return Err(self.unavailable(&self.ffprobe, &e)),
            Err(e) => {
                return Err(ProcessingError::ToolFailed {
                    tool: "ffprobe".to_string(),
                    message: e.to_string(),
                })
            }
        };

        if !output.status.success() {
            return Err(ProcessingError::ToolFailed {
                tool: "ffprobe".to_string(),
                message: stderr_tail(&String::from_utf8_lossy(&output.stderr)),
            });
        }

        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<f64>()
            .map_err(|_| ProcessingError::ToolFailed {
                tool: "ffprobe".to_string(),
                message: format!("no duration reported for {}", path.display()),
            })
    }
}
