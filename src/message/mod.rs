pub mod message_dto;
pub mod message_handlers;
pub mod message_models;
pub mod message_queue;
pub mod message_service;

use crate::error::{AppError, Result};

/// Upper bound on message content, in characters, on both write paths.
pub const MAX_MESSAGE_LENGTH: usize = 5000;

pub use message_queue::MessageQueue;
pub use message_service::MessageService;

/// Content rules shared by the REST and realtime write paths.
///
/// Postgres `TEXT` cannot hold a NUL byte, so such content is rejected here
/// rather than failing later inside a batch insert.
pub fn check_content(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(AppError::BadRequest("Message content cannot be empty".to_string()));
    }
    if content.chars().count() > MAX_MESSAGE_LENGTH {
        return Err(AppError::BadRequest(format!(
            "Message content cannot exceed {} characters",
            MAX_MESSAGE_LENGTH
        )));
    }
    if content.contains('\0') {
        return Err(AppError::BadRequest(
            "Message content cannot contain NUL characters".to_string(),
        ));
    }
    Ok(())
}
