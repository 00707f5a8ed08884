//! Inline keyboard presses: format choice and cancellation

use teloxide::prelude::*;
use teloxide::types::MessageId;

use grabcore::download::{AudioCodec, JobHandle, Selection, SessionId, SubmitError};

use super::messages::edit_text;
use super::types::{HandlerDeps, HandlerError, PendingMedia};
use crate::telegram::keyboards::{
    audio_keyboard, cancel_keyboard, media_summary, target_keyboard, video_keyboard, CallbackAction,
};

const EXPIRED_TEXT: &str = "This link has expired, please send it again.";

pub async fn handle_callback(bot: &Bot, q: CallbackQuery, deps: &HandlerDeps) -> Result<(), HandlerError> {
    let (Some(data), Some(message)) = (q.data.as_deref(), q.message.as_ref()) else {
        bot.answer_callback_query(q.id.clone()).await?;
        return Ok(());
    };
    let chat_id = message.chat().id;
    let message_id = message.id();

    let notice = match CallbackAction::parse(data) {
        Some(action) => handle_action(bot, deps, chat_id, message_id, action).await?,
        None => {
            log::warn!("Unknown callback data {:?} from chat {}", data, chat_id);
            None
        }
    };

    match notice {
        Some(text) => bot.answer_callback_query(q.id.clone()).text(text).await?,
        None => bot.answer_callback_query(q.id.clone()).await?,
    };
    Ok(())
}

/// Runs one action; returns a short notice for the callback answer.
async fn handle_action(
    bot: &Bot,
    deps: &HandlerDeps,
    chat_id: ChatId,
    message_id: MessageId,
    action: CallbackAction,
) -> Result<Option<String>, HandlerError> {
    if let CallbackAction::Cancel(job) = action {
        let notice = if deps.queue.cancel(job) {
            log::info!("Chat {} cancelled job {} from the keyboard", chat_id, job);
            "Cancelling..."
        } else {
            "This download has already finished."
        };
        return Ok(Some(notice.to_string()));
    }

    let Some(pending) = deps.pending.get(&chat_id.0).map(|entry| entry.value().clone()) else {
        return Ok(Some(EXPIRED_TEXT.to_string()));
    };
    let summary = media_summary(&pending.media);

    match action {
        CallbackAction::ChooseVideo => {
            let text = format!("{}\n\nChoose a quality:", summary);
            edit_text(bot, chat_id, message_id, text, Some(video_keyboard(&pending.media))).await?;
            Ok(None)
        }
        CallbackAction::ChooseAudio => {
            let text = format!("{}\n\nChoose an MP3 bitrate:", summary);
            edit_text(bot, chat_id, message_id, text, Some(audio_keyboard())).await?;
            Ok(None)
        }
        CallbackAction::Back => {
            let text = format!("{}\n\nWhat should I send?", summary);
            edit_text(bot, chat_id, message_id, text, Some(target_keyboard(&pending.media))).await?;
            Ok(None)
        }
        CallbackAction::Resolution(index) => {
            let Some(format) = pending.media.video_options().nth(index) else {
                return Ok(Some(EXPIRED_TEXT.to_string()));
            };
            let selection = Selection::video(format, &pending.media.formats);
            submit(bot, deps, chat_id, message_id, &pending, selection).await
        }
        CallbackAction::AudioBitrate(kbps) => {
            let selection = Selection::audio(&pending.media.formats, AudioCodec::Mp3, kbps);
            submit(bot, deps, chat_id, message_id, &pending, selection).await
        }
        CallbackAction::Cancel(_) => Ok(None),
    }
}

async fn submit(
    bot: &Bot,
    deps: &HandlerDeps,
    chat_id: ChatId,
    message_id: MessageId,
    pending: &PendingMedia,
    selection: Result<Selection, SubmitError>,
) -> Result<Option<String>, HandlerError> {
    let submitted: Result<JobHandle, SubmitError> =
        selection.and_then(|selection| deps.queue.submit(pending.request.clone(), selection));

    let handle = match submitted {
        Ok(handle) => handle,
        Err(e) => {
            log::info!("Submission from chat {} refused: {}", chat_id, e);
            return Ok(Some(e.user_message()));
        }
    };

    deps.pending.remove(&chat_id.0);
    let session = SessionId(chat_id.0);
    let position = match deps.queue.queue_position(session) {
        Some(position) => format!("⏳ In queue, position {}", position),
        None => "⏳ Starting...".to_string(),
    };
    let text = format!("{}\n\n{}", media_summary(&pending.media), position);
    edit_text(bot, chat_id, message_id, text, Some(cancel_keyboard(handle.id()))).await?;
    deps.transport.track_status(session, message_id);
    Ok(None)
}
