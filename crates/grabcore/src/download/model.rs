//! Data model shared by every pipeline stage.

use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use strum::{AsRefStr, Display, EnumString};
use url::Url;
use uuid::Uuid;

use crate::core::utils::format_bytes;

/// Chat session that issued a request (a Telegram chat id in the bot).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub i64);

/// User the admission caps are counted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses the textual form produced by `Display` (used in callback data).
    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw).ok().map(Self)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user's ask to download one URL. Immutable once created.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub session: SessionId,
    pub user: UserId,
    pub url: Url,
    /// Media title reported by the resolver, used for captions and file names
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Request {
    pub fn new(session: SessionId, user: UserId, url: Url) -> Self {
        Self {
            id: RequestId::new(),
            session,
            user,
            url,
            title: None,
            uploader: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    #[must_use]
    pub fn with_uploader(mut self, uploader: impl Into<String>) -> Self {
        self.uploader = Some(uploader.into());
        self
    }
}

/// What a stream variant carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum FormatKind {
    VideoAudio,
    VideoOnly,
    AudioOnly,
}

impl FormatKind {
    pub fn has_video(self) -> bool {
        matches!(self, FormatKind::VideoAudio | FormatKind::VideoOnly)
    }

    pub fn has_audio(self) -> bool {
        matches!(self, FormatKind::VideoAudio | FormatKind::AudioOnly)
    }
}

/// One selectable stream variant, as normalized by the resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatOption {
    /// Backend format identifier (yt-dlp `format_id`)
    pub id: String,
    pub kind: FormatKind,
    /// File extension / container, e.g. "mp4", "webm", "m4a"
    pub container: String,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Total bitrate for video variants, audio bitrate for audio-only ones
    pub bitrate_kbps: Option<f64>,
    pub estimated_size: Option<u64>,
    pub duration_secs: Option<f64>,
    /// Direct stream URL the fetcher downloads from
    pub url: String,
    /// Extra request headers the backend says the stream needs
    pub http_headers: Vec<(String, String)>,
}

impl FormatOption {
    /// Short-side resolution label ("1080p"), if this variant has video.
    pub fn resolution_label(&self) -> Option<String> {
        let short_side = match (self.width, self.height) {
            (Some(w), Some(h)) => w.min(h),
            (None, Some(h)) => h,
            (Some(w), None) => w,
            (None, None) => return None,
        };
        Some(format!("{}p", short_side))
    }

    /// Vertical resolution used for ordering.
    pub fn pixel_height(&self) -> u32 {
        match (self.width, self.height) {
            (Some(w), Some(h)) => w.min(h),
            (None, Some(h)) => h,
            (Some(w), None) => w,
            (None, None) => 0,
        }
    }

    /// Label for a selection keyboard, e.g. "1080p mp4 · 45.2 MB".
    pub fn label(&self) -> String {
        let mut label = match self.kind {
            FormatKind::AudioOnly => match self.bitrate_kbps {
                Some(kbps) => format!("{:.0} kbps {}", kbps, self.container),
                None => format!("audio {}", self.container),
            },
            _ => format!(
                "{} {}",
                self.resolution_label().unwrap_or_else(|| "video".to_string()),
                self.container
            ),
        };
        if let Some(size) = self.estimated_size {
            label.push_str(" · ");
            label.push_str(&format_bytes(size));
        }
        label
    }

    /// Identity used for de-duplication: container + resolution + bitrate.
    pub fn dedup_key(&self) -> (String, Option<u32>, Option<u32>, u64) {
        let kbps = self.bitrate_kbps.map(|b| b.round() as u64).unwrap_or(0);
        (self.container.to_ascii_lowercase(), self.width, self.height, kbps)
    }
}

/// Audio codecs the mux stage can produce for audio targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum AudioCodec {
    Mp3,
    M4a,
    Opus,
}

impl AudioCodec {
    pub fn extension(self) -> &'static str {
        match self {
            AudioCodec::Mp3 => "mp3",
            AudioCodec::M4a => "m4a",
            AudioCodec::Opus => "opus",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            AudioCodec::Mp3 => "audio/mpeg",
            AudioCodec::M4a => "audio/mp4",
            AudioCodec::Opus => "audio/ogg",
        }
    }

    /// ffmpeg encoder name.
    pub fn encoder(self) -> &'static str {
        match self {
            AudioCodec::Mp3 => "libmp3lame",
            AudioCodec::M4a => "aac",
            AudioCodec::Opus => "libopus",
        }
    }

    /// True when a source stream can be delivered as-is for this target.
    pub fn matches_source(self, container: &str, codec: Option<&str>) -> bool {
        let container = container.to_ascii_lowercase();
        let codec = codec.map(str::to_ascii_lowercase).unwrap_or_default();
        match self {
            AudioCodec::Mp3 => container == "mp3" || codec == "mp3",
            AudioCodec::M4a => container == "m4a" && (codec.is_empty() || codec.starts_with("mp4a")),
            AudioCodec::Opus => container == "opus" || (container == "ogg" && codec == "opus"),
        }
    }
}

/// What the user wants delivered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetKind {
    Video,
    Audio { codec: AudioCodec, bitrate_kbps: u32 },
}

/// Kind of a finished deliverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ArtifactKind {
    Video,
    Audio,
}

/// The single output file of a job, ready to hand to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub kind: ArtifactKind,
    pub mime: String,
    pub duration_secs: Option<f64>,
    pub title: Option<String>,
    /// Channel or author name, shown as the audio performer
    pub uploader: Option<String>,
    /// Video resolution label such as `1080p`
    pub resolution: Option<String>,
}

/// Guesses a mime type from a container extension.
pub fn mime_for_container(container: &str) -> &'static str {
    match container.to_ascii_lowercase().as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "opus" | "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video(width: u32, height: u32) -> FormatOption {
        FormatOption {
            id: "137".into(),
            kind: FormatKind::VideoOnly,
            container: "mp4".into(),
            video_codec: Some("avc1.640028".into()),
            audio_codec: None,
            width: Some(width),
            height: Some(height),
            bitrate_kbps: Some(4400.4),
            estimated_size: Some(45 * 1024 * 1024),
            duration_secs: Some(212.0),
            url: "https://cdn.example/137".into(),
            http_headers: Vec::new(),
        }
    }

    #[test]
    fn test_resolution_label_uses_short_side() {
        assert_eq!(video(1920, 1080).resolution_label().as_deref(), Some("1080p"));
        // Vertical video
        assert_eq!(video(1080, 1920).resolution_label().as_deref(), Some("1080p"));
    }

    #[test]
    fn test_label_includes_size() {
        assert_eq!(video(1920, 1080).label(), "1080p mp4 · 45.0 MB");
    }

    #[test]
    fn test_dedup_key_rounds_bitrate() {
        let mut a = video(1920, 1080);
        let mut b = video(1920, 1080);
        a.bitrate_kbps = Some(4400.2);
        b.bitrate_kbps = Some(4399.9);
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn test_format_kind_parse() {
        assert_eq!("audio_only".parse::<FormatKind>().unwrap(), FormatKind::AudioOnly);
        assert_eq!(FormatKind::VideoAudio.to_string(), "video_audio");
    }

    #[test]
    fn test_audio_codec_matches_source() {
        assert!(AudioCodec::M4a.matches_source("m4a", Some("mp4a.40.2")));
        assert!(!AudioCodec::Mp3.matches_source("m4a", Some("mp4a.40.2")));
        assert!(AudioCodec::Opus.matches_source("ogg", Some("opus")));
        assert!(!AudioCodec::Opus.matches_source("webm", Some("opus")));
    }

    #[test]
    fn test_job_id_roundtrip_display() {
        let id = JobId::new();
        assert_eq!(JobId::parse(&id.to_string()), Some(id));
    }
}
