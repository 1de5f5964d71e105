//! Error types for the conversation engine.

use valet_core::error::ValetError;

/// Failures from the remote completion service.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompletionError {
    #[error("API Error: {code} - {body}")]
    Api { code: u16, body: String },
    #[error("Empty response received")]
    EmptyResponse,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid API key")]
    InvalidApiKey,
    #[error("rate limited by the completion service")]
    RateLimited,
}

/// Errors from the chat engine.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message cannot be empty")]
    EmptyMessage,
    #[error("message exceeds maximum length of {0} characters")]
    MessageTooLong(usize),
    #[error("a message is already being sent")]
    Busy,
    #[error("session not found: {0}")]
    SessionNotFound(uuid::Uuid),
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<ValetError> for ChatError {
    fn from(err: ValetError) -> Self {
        ChatError::Storage(err.to_string())
    }
}
