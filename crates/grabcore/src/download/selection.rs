//! Turning a user's choice into the streams a job has to fetch.

use crate::conversion::check_mux_compatibility;
use crate::download::error::SubmitError;
use crate::download::model::{AudioCodec, FormatKind, FormatOption, TargetKind};

/// Which input a fetched file feeds into the mux stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum StreamRole {
    Video,
    Audio,
}

/// The confirmed choice a job is created from.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// A single stream that already carries video and audio
    Muxed { format: FormatOption },
    /// Separate video-only and audio-only streams muxed after fetching
    Split { video: FormatOption, audio: FormatOption },
    /// Audio track from `source`, delivered as `codec`
    Audio {
        source: FormatOption,
        codec: AudioCodec,
        bitrate_kbps: u32,
    },
}

impl Selection {
    /// Video selection for `format`. Video-only variants are paired with the
    /// best audio-only stream that can be stream-copied into their container.
    pub fn video(format: &FormatOption, available: &[FormatOption]) -> Result<Self, SubmitError> {
        match format.kind {
            FormatKind::VideoAudio => Ok(Selection::Muxed { format: format.clone() }),
            FormatKind::VideoOnly => {
                let audio = best_audio_for_video(format, available).ok_or_else(|| {
                    SubmitError::InvalidSelection(format!("no audio stream to pair with format {}", format.id))
                })?;
                Ok(Selection::Split {
                    video: format.clone(),
                    audio: audio.clone(),
                })
            }
            FormatKind::AudioOnly => Err(SubmitError::InvalidSelection(format!(
                "format {} has no video",
                format.id
            ))),
        }
    }

    /// Audio selection at `codec`/`bitrate_kbps`, picking the cheapest source.
    pub fn audio(available: &[FormatOption], codec: AudioCodec, bitrate_kbps: u32) -> Result<Self, SubmitError> {
        let source = best_audio_source(available, codec)
            .ok_or_else(|| SubmitError::InvalidSelection("no stream carries audio".to_string()))?;
        Ok(Selection::Audio {
            source: source.clone(),
            codec,
            bitrate_kbps,
        })
    }

    pub fn target(&self) -> TargetKind {
        match self {
            Selection::Muxed { .. } | Selection::Split { .. } => TargetKind::Video,
            Selection::Audio {
                codec, bitrate_kbps, ..
            } => TargetKind::Audio {
                codec: *codec,
                bitrate_kbps: *bitrate_kbps,
            },
        }
    }

    /// Streams to fetch, in fetch order.
    pub fn fetch_list(&self) -> Vec<(StreamRole, &FormatOption)> {
        match self {
            Selection::Muxed { format } => vec![(StreamRole::Video, format)],
            Selection::Split { video, audio } => vec![(StreamRole::Video, video), (StreamRole::Audio, audio)],
            Selection::Audio { source, .. } => {
                let role = if source.kind == FormatKind::AudioOnly {
                    StreamRole::Audio
                } else {
                    StreamRole::Video
                };
                vec![(role, source)]
            }
        }
    }

    /// Whether the external tool has to run (the job passes through `Muxing`).
    pub fn needs_processing(&self) -> bool {
        match self {
            Selection::Muxed { .. } => false,
            Selection::Split { .. } => true,
            Selection::Audio { source, codec, .. } => {
                !(source.kind == FormatKind::AudioOnly
                    && codec.matches_source(&source.container, source.audio_codec.as_deref()))
            }
        }
    }

    /// Resolution of the delivered video, e.g. `1080p`. None for audio.
    pub fn resolution_label(&self) -> Option<String> {
        match self {
            Selection::Muxed { format } | Selection::Split { video: format, .. } => format.resolution_label(),
            Selection::Audio { .. } => None,
        }
    }

    /// Sum of the known estimated sizes of all fetched streams.
    pub fn estimated_size(&self) -> Option<u64> {
        self.fetch_list()
            .iter()
            .map(|(_, f)| f.estimated_size)
            .try_fold(0u64, |acc, size| size.map(|s| acc + s))
    }

    /// Structural checks run by `submit`.
    pub fn validate(&self) -> Result<(), SubmitError> {
        let invalid = |msg: String| Err(SubmitError::InvalidSelection(msg));
        for (_, format) in self.fetch_list() {
            if format.url.trim().is_empty() {
                return invalid(format!("format {} has no stream URL", format.id));
            }
        }
        match self {
            Selection::Muxed { format } if format.kind != FormatKind::VideoAudio => {
                invalid(format!("format {} is not a muxed stream", format.id))
            }
            Selection::Split { video, audio }
                if video.kind != FormatKind::VideoOnly || audio.kind != FormatKind::AudioOnly =>
            {
                invalid(format!("formats {} + {} cannot be split-muxed", video.id, audio.id))
            }
            Selection::Audio { source, bitrate_kbps, .. } => {
                if !source.kind.has_audio() {
                    invalid(format!("format {} has no audio", source.id))
                } else if *bitrate_kbps == 0 {
                    invalid("audio bitrate must be positive".to_string())
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    /// Short description for logs.
    pub fn describe(&self) -> String {
        match self {
            Selection::Muxed { format } => format!("muxed {}", format.label()),
            Selection::Split { video, audio } => format!("split {} + {}", video.label(), audio.label()),
            Selection::Audio {
                source,
                codec,
                bitrate_kbps,
            } => format!("audio {} {}k from {}", codec, bitrate_kbps, source.id),
        }
    }
}

/// Highest-bitrate audio-only stream that `video`'s container can carry.
pub fn best_audio_for_video<'a>(video: &FormatOption, available: &'a [FormatOption]) -> Option<&'a FormatOption> {
    let video_codec = video.video_codec.as_deref().unwrap_or("unknown");
    let audio_only = available.iter().filter(|f| f.kind == FormatKind::AudioOnly);
    let compatible = audio_only
        .clone()
        .filter(|f| {
            check_mux_compatibility(&video.container, video_codec, f.audio_codec.as_deref().unwrap_or("unknown"))
                .is_ok()
        })
        .max_by(|a, b| bitrate(a).total_cmp(&bitrate(b)));
    // An incompatible pairing still produces a job; it fails with
    // IncompatibleCodecs before anything is fetched.
    compatible.or_else(|| audio_only.max_by(|a, b| bitrate(a).total_cmp(&bitrate(b))))
}

/// Cheapest way to get an audio track for `codec`: a passthrough-able
/// audio-only stream first, then the best audio-only stream, then the
/// smallest muxed stream.
pub fn best_audio_source(available: &[FormatOption], codec: AudioCodec) -> Option<&FormatOption> {
    let audio_only = || available.iter().filter(|f| f.kind == FormatKind::AudioOnly);
    audio_only()
        .filter(|f| codec.matches_source(&f.container, f.audio_codec.as_deref()))
        .max_by(|a, b| bitrate(a).total_cmp(&bitrate(b)))
        .or_else(|| audio_only().max_by(|a, b| bitrate(a).total_cmp(&bitrate(b))))
        .or_else(|| {
            available
                .iter()
                .filter(|f| f.kind == FormatKind::VideoAudio)
                .min_by_key(|f| (f.pixel_height(), f.estimated_size.unwrap_or(u64::MAX)))
        })
}

fn bitrate(format: &FormatOption) -> f64 {
    format.bitrate_kbps.unwrap_or(0.0)
}
