//! Inline keyboards and their callback data.
//!
//! Callback data formats:
//! - `fmt:video` / `fmt:audio` - target kind
//! - `res:<index>` - index into the video variants of the pending media
//! - `aud:<kbps>` - mp3 bitrate for audio extraction
//! - `back` - return to the target kind menu
//! - `cancel:<job id>` - cancel a submitted job

use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

use grabcore::core::utils::{format_duration, truncate_title};
use grabcore::download::{JobId, ResolvedMedia};

/// mp3 bitrates offered for audio extraction
pub const AUDIO_BITRATES: [u32; 3] = [128, 192, 320];

/// Video variants shown at most (Telegram keyboards get unwieldy past that)
const MAX_VIDEO_BUTTONS: usize = 8;

const MAX_TITLE_CHARS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CallbackAction {
    ChooseVideo,
    ChooseAudio,
    Resolution(usize),
    AudioBitrate(u32),
    Back,
    Cancel(JobId),
}

impl CallbackAction {
    pub fn parse(data: &str) -> Option<Self> {
        let (prefix, arg) = match data.split_once(':') {
            Some((prefix, arg)) => (prefix, Some(arg)),
            None => (data, None),
        };
        match (prefix, arg) {
            ("fmt", Some("video")) => Some(Self::ChooseVideo),
            ("fmt", Some("audio")) => Some(Self::ChooseAudio),
            ("res", Some(index)) => index.parse().ok().map(Self::Resolution),
            ("aud", Some(kbps)) => kbps.parse().ok().map(Self::AudioBitrate),
            ("back", None) => Some(Self::Back),
            ("cancel", Some(job)) => JobId::parse(job).map(Self::Cancel),
            _ => None,
        }
    }

    pub fn to_data(&self) -> String {
        match self {
            Self::ChooseVideo => "fmt:video".to_string(),
            Self::ChooseAudio => "fmt:audio".to_string(),
            Self::Resolution(index) => format!("res:{}", index),
            Self::AudioBitrate(kbps) => format!("aud:{}", kbps),
            Self::Back => "back".to_string(),
            Self::Cancel(job) => format!("cancel:{}", job),
        }
    }
}

fn button(text: impl Into<String>, action: CallbackAction) -> InlineKeyboardButton {
    InlineKeyboardButton::callback(text.into(), action.to_data())
}

/// Title, uploader and duration of resolved media.
pub fn media_summary(media: &ResolvedMedia) -> String {
    let mut text = format!("🎬 {}", truncate_title(&media.title, MAX_TITLE_CHARS));
    if let Some(uploader) = &media.uploader {
        text.push_str(&format!("\n👤 {}", uploader));
    }
    if let Some(duration) = media.duration_secs {
        text.push_str(&format!("\n⏱ {}", format_duration(duration.round() as u64)));
    }
    text
}

pub fn target_keyboard(media: &ResolvedMedia) -> InlineKeyboardMarkup {
    let mut row = Vec::new();
    if media.video_options().next().is_some() {
        row.push(button("🎬 Video", CallbackAction::ChooseVideo));
    }
    if media.formats.iter().any(|f| f.kind.has_audio()) {
        row.push(button("🎵 Audio", CallbackAction::ChooseAudio));
    }
    InlineKeyboardMarkup::new(vec![row])
}

/// One button per video variant, best first.
pub fn video_keyboard(media: &ResolvedMedia) -> InlineKeyboardMarkup {
    let mut rows: Vec<Vec<InlineKeyboardButton>> = media
        .video_options()
        .take(MAX_VIDEO_BUTTONS)
        .enumerate()
        .map(|(index, format)| vec![button(format.label(), CallbackAction::Resolution(index))])
        .collect();
    rows.push(vec![button("⬅️ Back", CallbackAction::Back)]);
    InlineKeyboardMarkup::new(rows)
}

pub fn audio_keyboard() -> InlineKeyboardMarkup {
    let row: Vec<InlineKeyboardButton> = AUDIO_BITRATES
        .iter()
        .map(|kbps| button(format!("MP3 {} kbps", kbps), CallbackAction::AudioBitrate(*kbps)))
        .collect();
    InlineKeyboardMarkup::new(vec![row, vec![button("⬅️ Back", CallbackAction::Back)]])
}

pub fn cancel_keyboard(job: JobId) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![button("❌ Cancel", CallbackAction::Cancel(job))]])
}
