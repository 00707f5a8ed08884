//! Telegram front end of the pipeline

pub mod bot;
pub mod handlers;
pub mod keyboards;
pub mod transport;

pub use bot::{create_bot, setup_bot_commands};
pub use handlers::{schema, HandlerDeps};
pub use transport::TelegramTransport;
