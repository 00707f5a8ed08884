//! Update handlers wired into the teloxide dispatcher

mod callbacks;
mod commands;
mod messages;
mod schema;
mod types;

pub use schema::schema;
pub use types::{HandlerDeps, HandlerError};
