//! Transcode/mux stage.
//!
//! Turns the fetched input stream(s) into exactly one deliverable file:
//! - separate video + audio streams are muxed with stream copy (never re-encoded)
//! - audio targets are extracted and encoded to the requested codec/bitrate
//! - inputs that already are the deliverable are passed through untouched
//!
//! The external binary sits behind the [`MediaTool`] trait; [`ffmpeg::FfmpegTool`]
//! is the production implementation.

pub mod ffmpeg;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::utils::sanitize_filename;
use crate::download::model::{mime_for_container, ArtifactKind, AudioCodec, DeliveredArtifact, TargetKind};

pub use ffmpeg::FfmpegTool;

/// Errors of the transcode/mux stage
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessingError {
    /// The tool binary could not be started. Fatal, never retried.
    #[error("external tool unavailable: {0}")]
    ExternalToolUnavailable(String),

    #[error("{container} cannot carry video codec {video} with audio codec {audio}")]
    IncompatibleCodecs {
        container: String,
        video: String,
        audio: String,
    },

    #[error("{tool} exited with an error: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("input file missing: {0}")]
    MissingInput(String),

    #[error("output is {output:.1}s long but the input is {input:.1}s")]
    DurationMismatch { input: f64, output: f64 },

    #[error("processing cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(String),
}

impl ProcessingError {
    /// Metrics label for the failure.
    pub fn category(&self) -> &'static str {
        match self {
            ProcessingError::ExternalToolUnavailable(_) => "tool_unavailable",
            ProcessingError::IncompatibleCodecs { .. } => "incompatible_codecs",
            ProcessingError::ToolFailed { .. } => "tool_failed",
            ProcessingError::MissingInput(_) => "missing_input",
            ProcessingError::DurationMismatch { .. } => "duration_mismatch",
            ProcessingError::Cancelled => "cancelled",
            ProcessingError::Io(_) => "io",
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            ProcessingError::ExternalToolUnavailable(_) => {
                "❌ Media processing is unavailable on the server right now.\n\nTry the audio option or a quality that doesn't need merging.".to_string()
            }
            ProcessingError::IncompatibleCodecs { container, .. } => format!(
                "❌ These streams can't be combined into {} without re-encoding.\n\nPick another quality.",
                container
            ),
            ProcessingError::DurationMismatch { .. } => {
                "❌ The merged file came out broken (video and audio lengths differ).\n\nPick another quality.".to_string()
            }
            ProcessingError::Cancelled => "Processing cancelled.".to_string(),
            ProcessingError::ToolFailed { .. } | ProcessingError::MissingInput(_) | ProcessingError::Io(_) => {
                "❌ Failed to process the media.\n\nTry again or pick another quality.".to_string()
            }
        }
    }
}

impl From<std::io::Error> for ProcessingError {
    fn from(err: std::io::Error) -> Self {
        ProcessingError::Io(err.to_string())
    }
}

pub type ProcessingResult<T> = Result<T, ProcessingError>;

/// What the tool should do with its inputs.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolParams {
    /// Combine the first video stream of input 0 with the first audio stream
    /// of input 1 into `container`, copying both streams.
    Mux { container: String },
    /// Drop video and encode the first audio stream.
    ExtractAudio { codec: AudioCodec, bitrate_kbps: u32 },
}

/// One tool run: inputs, output path and parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub params: ToolParams,
    /// Expected output duration, used to turn tool progress into a fraction
    pub expected_duration: Option<f64>,
}

/// Callback receiving the tool's progress as a fraction in `[0, 1]`.
pub type ToolProgress<'a> = dyn Fn(f64) + Send + Sync + 'a;

/// Narrow contract of the external media tool.
#[async_trait]
pub trait MediaTool: Send + Sync {
    /// Tool name for logs and errors.
    fn name(&self) -> &str;

    /// Whether the binary can be started at all.
    async fn is_available(&self) -> bool;

    /// Runs the tool. Must stop promptly once `cancel` fires.
    async fn invoke(
        &self,
        invocation: &Invocation,
        on_progress: &ToolProgress<'_>,
        cancel: &CancellationToken,
    ) -> ProcessingResult<()>;

    /// Container duration in seconds.
    async fn probe_duration(&self, path: &Path) -> ProcessingResult<f64>;
}

/// A fetched input stream on local disk.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFile {
    pub path: PathBuf,
    pub container: String,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    /// Duration the resolver reported for the stream
    pub duration_secs: Option<f64>,
    /// True when the file carries only audio
    pub audio_only: bool,
}

/// Normalized codec family used by the compatibility table.
fn codec_family(codec: &str) -> String {
    let lower = codec.to_ascii_lowercase();
    let head = lower.split('.').next().unwrap_or_default();
    match head {
        "avc1" | "avc3" | "h264" => "h264",
        "hvc1" | "hev1" | "hevc" | "h265" => "hevc",
        "av01" | "av1" => "av1",
        "vp09" | "vp9" => "vp9",
        "vp08" | "vp8" => "vp8",
        "mp4a" | "aac" => "aac",
        "mp3" => "mp3",
        "opus" => "opus",
        "vorbis" => "vorbis",
        "ac-3" | "ac3" => "ac3",
        "ec-3" | "eac3" => "eac3",
        "flac" => "flac",
        other => other,
    }
    .to_string()
}

/// Checks that both streams can be stream-copied into `container`.
///
/// Unknown codecs are rejected: muxing is never allowed to fall back to
/// re-encoding.
pub fn check_mux_compatibility(container: &str, video_codec: &str, audio_codec: &str) -> ProcessingResult<()> {
    let video = codec_family(video_codec);
    let audio = codec_family(audio_codec);
    let (video_ok, audio_ok): (&[&str], &[&str]) = match container.to_ascii_lowercase().as_str() {
        "mp4" | "mov" => (&["h264", "hevc", "av1", "vp9"], &["aac", "mp3", "opus", "ac3", "eac3", "flac"]),
        "webm" => (&["vp8", "vp9", "av1"], &["opus", "vorbis"]),
        "mkv" => (
            &["h264", "hevc", "av1", "vp8", "vp9"],
            &["aac", "mp3", "opus", "vorbis", "ac3", "eac3", "flac"],
        ),
        _ => (&[], &[]),
    };

    if video_ok.contains(&video.as_str()) && audio_ok.contains(&audio.as_str()) {
        Ok(())
    } else {
        Err(ProcessingError::IncompatibleCodecs {
            container: container.to_string(),
            video: video_codec.to_string(),
            audio: audio_codec.to_string(),
        })
    }
}

/// Drives one job's transcode/mux step.
pub struct Processor {
    tool: Arc<dyn MediaTool>,
    duration_tolerance_secs: f64,
}

impl Processor {
    pub fn new(tool: Arc<dyn MediaTool>, duration_tolerance_secs: f64) -> Self {
        Self {
            tool,
            duration_tolerance_secs,
        }
    }

    pub fn tool(&self) -> &Arc<dyn MediaTool> {
        &self.tool
    }

    /// Fails fast with `ExternalToolUnavailable` when the tool can't start.
    pub async fn ensure_available(&self) -> ProcessingResult<()> {
        if self.tool.is_available().await {
            Ok(())
        } else {
            Err(ProcessingError::ExternalToolUnavailable(self.tool.name().to_string()))
        }
    }

    /// Produces the single deliverable for `target` from the fetched inputs.
    ///
    /// Input files are removed on every exit path; a passed-through input
    /// becomes the output instead.
    #[allow(clippy::too_many_arguments)]
    pub async fn process(
        &self,
        video: Option<StreamFile>,
        audio: Option<StreamFile>,
        target: TargetKind,
        title: Option<&str>,
        out_dir: &Path,
        on_progress: &ToolProgress<'_>,
        cancel: &CancellationToken,
    ) -> ProcessingResult<DeliveredArtifact> {
        let inputs: Vec<PathBuf> = video.iter().chain(audio.iter()).map(|s| s.path.clone()).collect();
        let stem = sanitize_filename(title.unwrap_or("media"));

        let result = match target {
            TargetKind::Video => self.produce_video(video, audio, &stem, out_dir, on_progress, cancel).await,
            TargetKind::Audio { codec, bitrate_kbps } => {
                let source = audio.or(video);
                self.produce_audio(source, codec, bitrate_kbps, &stem, out_dir, on_progress, cancel)
                    .await
            }
        };

        remove_files(&inputs).await;

        result.map(|mut artifact| {
            artifact.title = title.map(str::to_string);
            artifact
        })
    }

    async fn produce_video(
        &self,
        video: Option<StreamFile>,
        audio: Option<StreamFile>,
        stem: &str,
        out_dir: &Path,
        on_progress: &ToolProgress<'_>,
        cancel: &CancellationToken,
    ) -> ProcessingResult<DeliveredArtifact> {
        let video = video.ok_or_else(|| ProcessingError::MissingInput("video stream".to_string()))?;
        ensure_exists(&video.path).await?;
        let output = out_dir.join(format!("{}.{}", stem, video.container));

        let Some(audio) = audio else {
            // Muxed source: the fetched file already is the deliverable
            return passthrough(&video, &output, ArtifactKind::Video).await;
        };
        ensure_exists(&audio.path).await?;

        check_mux_compatibility(
            &video.container,
            video.video_codec.as_deref().unwrap_or("unknown"),
            audio.audio_codec.as_deref().unwrap_or("unknown"),
        )?;

        let video_duration = self.input_duration(&video).await;
        let audio_duration = self.input_duration(&audio).await;

        let invocation = Invocation {
            inputs: vec![video.path.clone(), audio.path.clone()],
            output: output.clone(),
            params: ToolParams::Mux {
                container: video.container.clone(),
            },
            expected_duration: video_duration.or(audio_duration),
        };
        self.run(&invocation, on_progress, cancel).await?;

        let output_duration = match self.tool.probe_duration(&output).await {
            Ok(d) => d,
            Err(e) => {
                remove_files(std::slice::from_ref(&output)).await;
                return Err(e);
            }
        };
        for input in [video_duration, audio_duration].into_iter().flatten() {
            if (output_duration - input).abs() > self.duration_tolerance_secs {
                log::warn!(
                    "Muxed duration {:.2}s deviates from input {:.2}s: {}",
                    output_duration,
                    input,
                    output.display()
                );
                remove_files(std::slice::from_ref(&output)).await;
                return Err(ProcessingError::DurationMismatch {
                    input,
                    output: output_duration,
                });
            }
        }

        let size_bytes = file_size(&output).await?;
        Ok(DeliveredArtifact {
            mime: mime_for_container(&video.container).to_string(),
            path: output,
            size_bytes,
            kind: ArtifactKind::Video,
            duration_secs: Some(output_duration),
            title: None,
            uploader: None,
            resolution: None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn produce_audio(
        &self,
        source: Option<StreamFile>,
        codec: AudioCodec,
        bitrate_kbps: u32,
        stem: &str,
        out_dir: &Path,
        on_progress: &ToolProgress<'_>,
        cancel: &CancellationToken,
    ) -> ProcessingResult<DeliveredArtifact> {
        let source = source.ok_or_else(|| ProcessingError::MissingInput("audio source".to_string()))?;
        ensure_exists(&source.path).await?;
        let output = out_dir.join(format!("{}.{}", stem, codec.extension()));

        if source.audio_only && codec.matches_source(&source.container, source.audio_codec.as_deref()) {
            let mut artifact = passthrough(&source, &output, ArtifactKind::Audio).await?;
            artifact.mime = codec.mime().to_string();
            return Ok(artifact);
        }

        let invocation = Invocation {
            inputs: vec![source.path.clone()],
            output: output.clone(),
            params: ToolParams::ExtractAudio { codec, bitrate_kbps },
            expected_duration: source.duration_secs,
        };
        self.run(&invocation, on_progress, cancel).await?;

        let duration_secs = match self.tool.probe_duration(&output).await {
            Ok(d) => Some(d),
            Err(e) => {
                log::warn!("Could not probe {}: {}", output.display(), e);
                source.duration_secs
            }
        };
        let size_bytes = file_size(&output).await?;
        Ok(DeliveredArtifact {
            path: output,
            size_bytes,
            kind: ArtifactKind::Audio,
            mime: codec.mime().to_string(),
            duration_secs,
            title: None,
            uploader: None,
            resolution: None,
        })
    }

    /// Runs the tool and removes a partial output on failure.
    async fn run(
        &self,
        invocation: &Invocation,
        on_progress: &ToolProgress<'_>,
        cancel: &CancellationToken,
    ) -> ProcessingResult<()> {
        if cancel.is_cancelled() {
            return Err(ProcessingError::Cancelled);
        }
        log::info!(
            "Running {} ({:?}) -> {}",
            self.tool.name(),
            invocation.params,
            invocation.output.display()
        );
        match self.tool.invoke(invocation, on_progress, cancel).await {
            Ok(()) => {
                if fs_err::tokio::metadata(&invocation.output).await.is_err() {
                    return Err(ProcessingError::ToolFailed {
                        tool: self.tool.name().to_string(),
                        message: "no output file was written".to_string(),
                    });
                }
                Ok(())
            }
            Err(e) => {
                remove_files(std::slice::from_ref(&invocation.output)).await;
                Err(e)
            }
        }
    }

    /// Probed duration of an input, falling back to the resolver's value.
    async fn input_duration(&self, stream: &StreamFile) -> Option<f64> {
        match self.tool.probe_duration(&stream.path).await {
            Ok(d) => Some(d),
            Err(e) => {
                log::debug!("Probe of {} failed ({}), using reported duration", stream.path.display(), e);
                stream.duration_secs
            }
        }
    }
}

async fn passthrough(stream: &StreamFile, output: &Path, kind: ArtifactKind) -> ProcessingResult<DeliveredArtifact> {
    if stream.path != output {
        fs_err::tokio::rename(&stream.path, output).await?;
    }
    let size_bytes = file_size(output).await?;
    Ok(DeliveredArtifact {
        path: output.to_path_buf(),
        size_bytes,
        kind,
        mime: mime_for_container(&stream.container).to_string(),
        duration_secs: stream.duration_secs,
        title: None,
        uploader: None,
        resolution: None,
    })
}

async fn ensure_exists(path: &Path) -> ProcessingResult<()> {
    match fs_err::tokio::metadata(path).await {
        Ok(_) => Ok(()),
        Err(_) => Err(ProcessingError::MissingInput(path.display().to_string())),
    }
}

async fn file_size(path: &Path) -> ProcessingResult<u64> {
    Ok(fs_err::tokio::metadata(path).await?.len())
}

/// Best-effort removal; missing files are fine.
pub(crate) async fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        match fs_err::tokio::remove_file(path).await {
            Ok(()) => log::debug!("Removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
}
