//! Handler types and dependencies

use std::sync::Arc;

use dashmap::DashMap;
use teloxide::types::UserId;

use grabcore::download::{FormatResolver, JobQueue, Request, ResolvedMedia};

use crate::telegram::transport::TelegramTransport;

/// Error type for handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A resolved link waiting for the user to pick a format.
#[derive(Clone)]
pub struct PendingMedia {
    pub request: Request,
    pub media: Arc<ResolvedMedia>,
}

/// Dependencies required by handlers
#[derive(Clone)]
pub struct HandlerDeps {
    pub queue: JobQueue,
    pub resolver: Arc<FormatResolver>,
    pub transport: Arc<TelegramTransport>,
    /// Keyed by chat id; a newer link replaces the older one
    pub pending: Arc<DashMap<i64, PendingMedia>>,
    pub bot_username: Option<String>,
    pub bot_id: UserId,
}

impl HandlerDeps {
    pub fn new(
        queue: JobQueue,
        resolver: Arc<FormatResolver>,
        transport: Arc<TelegramTransport>,
        bot_username: Option<String>,
        bot_id: UserId,
    ) -> Self {
        Self {
            queue,
            resolver,
            transport,
            pending: Arc::new(DashMap::new()),
            bot_username,
            bot_id,
        }
    }
}
