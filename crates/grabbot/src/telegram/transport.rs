//! Telegram side of the pipeline's chat transport.
//!
//! Every session has at most one status message that is edited in place with
//! progress and, at the end, with the job report.

use async_trait::async_trait;
use dashmap::DashMap;
use teloxide::prelude::*;
use teloxide::types::{InputFile, MessageId};
use teloxide::{ApiError, RequestError};

use grabcore::core::utils::format_bytes;
use grabcore::download::{
    ArtifactKind, ChatTransport, DeliveredArtifact, JobReport, ProgressStage, ProgressUpdate, SessionId,
    TransportError,
};

use super::keyboards::cancel_keyboard;

const BAR_WIDTH: usize = 10;

pub struct TelegramTransport {
    bot: Bot,
    status: DashMap<SessionId, MessageId>,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self {
            bot,
            status: DashMap::new(),
        }
    }

    /// Makes `message` the status message edited for `session`.
    pub fn track_status(&self, session: SessionId, message: MessageId) {
        self.status.insert(session, message);
    }

    fn status_message(&self, session: SessionId) -> Option<MessageId> {
        self.status.get(&session).map(|entry| *entry)
    }
}

fn chat(session: SessionId) -> ChatId {
    ChatId(session.0)
}

fn transport_error(e: RequestError) -> TransportError {
    TransportError::new(e.to_string())
}

fn is_not_modified(e: &RequestError) -> bool {
    matches!(e, RequestError::Api(ApiError::MessageNotModified))
}

/// Text of the status message for one progress update.
pub fn format_progress(update: &ProgressUpdate) -> String {
    let percent = update.percent();
    let filled = (usize::from(percent) * BAR_WIDTH / 100).min(BAR_WIDTH);
    let bar = format!("{}{}", "█".repeat(filled), "░".repeat(BAR_WIDTH - filled));

    match update.stage {
        ProgressStage::Fetching => {
            let mut text = format!("⬇️ Downloading... {}%\n{}", percent, bar);
            match update.bytes_total {
                Some(total) => text.push_str(&format!(
                    "\n{} / {}",
                    format_bytes(update.bytes_done),
                    format_bytes(total)
                )),
                None if update.bytes_done > 0 => text.push_str(&format!("\n{}", format_bytes(update.bytes_done))),
                None => {}
            }
            text
        }
        ProgressStage::Muxing => format!("⚙️ Processing... {}%\n{}", percent, bar),
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_progress(&self, session: SessionId, update: &ProgressUpdate) -> Result<(), TransportError> {
        let Some(message) = self.status_message(session) else {
            return Ok(());
        };
        match self
            .bot
            .edit_message_text(chat(session), message, format_progress(update))
            .reply_markup(cancel_keyboard(update.job))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_modified(&e) => Ok(()),
            Err(e) => Err(transport_error(e)),
        }
    }

    async fn send_artifact(&self, session: SessionId, artifact: &DeliveredArtifact) -> Result<(), TransportError> {
        let file = InputFile::file(artifact.path.clone());
        let caption = artifact_caption(artifact);
        log::info!(
            "Uploading {} {} ({}) to chat {}",
            artifact.kind,
            artifact.path.display(),
            format_bytes(artifact.size_bytes),
            session
        );

        let result = match artifact.kind {
            ArtifactKind::Audio => {
                let mut request = self.bot.send_audio(chat(session), file).caption(caption);
                if let Some(title) = &artifact.title {
                    request = request.title(title.clone());
                }
                if let Some(uploader) = &artifact.uploader {
                    request = request.performer(uploader.clone());
                }
                request.await
            }
            ArtifactKind::Video => {
                self.bot
                    .send_video(chat(session), file)
                    .caption(caption)
                    .supports_streaming(true)
                    .await
            }
        };
        result.map(|_| ()).map_err(transport_error)
    }

    async fn send_text(&self, session: SessionId, text: &str) -> Result<(), TransportError> {
        self.bot
            .send_message(chat(session), text)
            .await
            .map(|_| ())
            .map_err(transport_error)
    }

    async fn send_report(&self, session: SessionId, report: &JobReport) -> Result<(), TransportError> {
        if let Some((_, message)) = self.status.remove(&session) {
            match self.bot.edit_message_text(chat(session), message, &report.message).await {
                Ok(_) => return Ok(()),
                Err(e) if is_not_modified(&e) => return Ok(()),
                Err(e) => log::warn!("Failed to edit status message in chat {}: {}", session, e),
            }
        }
        self.send_text(session, &report.message).await
    }
}

/// Caption of an uploaded file: the title, plus the resolution for videos.
pub fn artifact_caption(artifact: &DeliveredArtifact) -> String {
    let title = artifact.title.as_deref().unwrap_or_default();
    match (artifact.kind, &artifact.resolution) {
        (ArtifactKind::Audio, _) => format!("🎵 {}", title),
        (ArtifactKind::Video, Some(resolution)) => format!("🎥 {}\n🎬 {}", title, resolution),
        (ArtifactKind::Video, None) => format!("🎥 {}", title),
    }
}
