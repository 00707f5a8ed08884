//! Links sent as plain messages

use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::types::{ChatKind, InlineKeyboardMarkup, Message, MessageId};
use teloxide::{ApiError, RequestError};

use grabcore::download::{Request, SessionId};

use super::types::{HandlerDeps, HandlerError, PendingMedia};
use crate::telegram::bot::extract_url;
use crate::telegram::keyboards::{media_summary, target_keyboard};

/// Edits a bot message, treating "message is not modified" as success.
pub(super) async fn edit_text(
    bot: &Bot,
    chat_id: ChatId,
    message_id: MessageId,
    text: impl Into<String>,
    keyboard: Option<InlineKeyboardMarkup>,
) -> Result<(), RequestError> {
    let request = bot.edit_message_text(chat_id, message_id, text);
    let result = match keyboard {
        Some(keyboard) => request.reply_markup(keyboard).await,
        None => request.await,
    };
    match result {
        Ok(_) | Err(RequestError::Api(ApiError::MessageNotModified)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Resolves the first link in the message and offers the target menu.
pub async fn handle_link_message(bot: &Bot, msg: &Message, deps: &HandlerDeps) -> Result<(), HandlerError> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let Some(url) = extract_url(text) else {
        if matches!(msg.chat.kind, ChatKind::Private(_)) {
            bot.send_message(msg.chat.id, "Send me a link (http or https) to a video.")
                .await?;
        }
        return Ok(());
    };

    log::info!("Chat {} sent {}", msg.chat.id, url);
    let status = bot.send_message(msg.chat.id, "🔍 Looking up the link...").await?;

    let media = match deps.resolver.resolve(url.as_str()).await {
        Ok(media) => media,
        Err(e) => {
            log::warn!("Resolution failed for {}: {}", url, e);
            edit_text(bot, msg.chat.id, status.id, e.user_message(), None).await?;
            return Ok(());
        }
    };

    let user = msg
        .from
        .as_ref()
        .map(|u| u.id.0 as i64)
        .unwrap_or(msg.chat.id.0);
    let request = Request::new(
        SessionId(msg.chat.id.0),
        grabcore::download::UserId(user),
        media.url.clone(),
    )
    .with_title(media.title.clone());
    let request = match &media.uploader {
        Some(uploader) => request.with_uploader(uploader.clone()),
        None => request,
    };

    let text = format!("{}\n\nWhat should I send?", media_summary(&media));
    let keyboard = target_keyboard(&media);
    deps.pending.insert(
        msg.chat.id.0,
        PendingMedia {
            request,
            media: Arc::clone(&media),
        },
    );
    edit_text(bot, msg.chat.id, status.id, text, Some(keyboard)).await?;
    Ok(())
}
