//! Bot initialization and message routing utilities
//!
//! This module contains:
//! - Command enum definition
//! - Bot instance creation
//! - Message addressing logic (private chats, mentions, replies)

use reqwest::ClientBuilder;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::{ChatKind, Message, MessageEntityKind, UserId};
use teloxide::utils::command::BotCommands;
use url::Url;

use grabcore::core::config;

/// Uploads of large files through the Bot API can take minutes.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Bot commands enum with descriptions
#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "lowercase", description = "I can do this:")]
pub enum Command {
    #[command(description = "welcome message")]
    Start,
    #[command(description = "how to use the bot")]
    Help,
    #[command(description = "cancel your current download")]
    Cancel,
}

/// Creates a Bot instance with custom or default API URL
///
/// # Returns
/// * `Ok(Bot)` - Successfully created bot instance
/// * `Err(anyhow::Error)` - Missing token or invalid `BOT_API_URL`
pub fn create_bot() -> anyhow::Result<Bot> {
    if config::BOT_TOKEN.is_empty() {
        return Err(anyhow::anyhow!("BOT_TOKEN (or TELOXIDE_TOKEN) environment variable not set"));
    }
    let client = ClientBuilder::new().timeout(REQUEST_TIMEOUT).build()?;
    let bot = Bot::with_client(config::BOT_TOKEN.as_str(), client);

    match config::BOT_API_URL.as_deref() {
        Some(api_url) => {
            log::info!("Using custom Bot API URL: {}", api_url);
            let url = Url::parse(api_url).map_err(|e| anyhow::anyhow!("Invalid BOT_API_URL: {}", e))?;
            Ok(bot.set_api_url(url))
        }
        None => Ok(bot),
    }
}

/// Sets up bot commands in Telegram UI
pub async fn setup_bot_commands(bot: &Bot) -> Result<(), teloxide::RequestError> {
    bot.set_my_commands(Command::bot_commands()).await?;
    Ok(())
}

/// Checks if a message is addressed to the bot
///
/// Private chats always are; in groups the message has to mention the bot
/// or reply to one of its messages.
pub fn is_message_addressed_to_bot(msg: &Message, bot_username: Option<&str>, bot_id: UserId) -> bool {
    if matches!(msg.chat.kind, ChatKind::Private(_)) {
        return true;
    }

    if let Some(from) = msg.reply_to_message().and_then(|reply| reply.from.as_ref()) {
        if from.id == bot_id {
            return true;
        }
    }

    let (Some(text), Some(username)) = (msg.text(), bot_username) else {
        return false;
    };
    let mentioned = msg.entities().unwrap_or_default().iter().any(|entity| {
        matches!(entity.kind, MessageEntityKind::Mention)
            && text
                .get(entity.offset..entity.offset + entity.length)
                .map(|m| m.strip_prefix('@').unwrap_or(m))
                .is_some_and(|m| m.eq_ignore_ascii_case(username))
    });
    mentioned || text.contains(&format!("@{}", username))
}

/// First http(s) URL in a message text.
pub fn extract_url(text: &str) -> Option<Url> {
    text.split_whitespace()
        .map(|token| token.trim_matches(|c: char| matches!(c, '<' | '>' | '(' | ')' | '"' | '\'')))
        .filter_map(|token| Url::parse(token).ok())
        .find(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
}
