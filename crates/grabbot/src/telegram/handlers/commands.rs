//! Slash command handlers

use teloxide::prelude::*;
use teloxide::types::Message;
use teloxide::utils::command::BotCommands;

use grabcore::download::SessionId;

use super::types::{HandlerDeps, HandlerError};
use crate::telegram::bot::Command;

const WELCOME_TEXT: &str = "👋 Hi! Send me a link to a video and I'll fetch it for you.\n\n\
You can pick a resolution or extract the audio track as MP3.";

pub async fn handle_start_command(bot: &Bot, msg: &Message) -> Result<(), HandlerError> {
    bot.send_message(msg.chat.id, WELCOME_TEXT).await?;
    Ok(())
}

pub async fn handle_help_command(bot: &Bot, msg: &Message, deps: &HandlerDeps) -> Result<(), HandlerError> {
    let text = format!(
        "{}\n\nSend a link, choose Video or Audio, then the quality. One download per chat runs at a time; \
         files above {} MB can't be sent.",
        Command::descriptions(),
        deps.queue.config().max_delivery_size / (1024 * 1024)
    );
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

/// Cancels the chat's active job, queued or running.
pub async fn handle_cancel_command(bot: &Bot, msg: &Message, deps: &HandlerDeps) -> Result<(), HandlerError> {
    deps.pending.remove(&msg.chat.id.0);
    let text = match deps.queue.cancel_session(SessionId(msg.chat.id.0)) {
        Some(job) => {
            log::info!("Chat {} cancelled job {}", msg.chat.id, job);
            "🚫 Cancelling your download..."
        }
        None => "Nothing to cancel.",
    };
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}
