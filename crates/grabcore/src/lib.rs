//! grabcore: media download pipeline behind the grabbot Telegram bot.
//!
//! - [`download`]: format resolution, job queue, fetching and delivery
//! - [`conversion`]: mux/transcode stage on top of an external media tool
//! - [`core`]: configuration, logging, metrics, retry policy and helpers

pub mod conversion;
pub mod core;
pub mod download;
