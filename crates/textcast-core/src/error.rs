//! Textcast error types.

use thiserror::Error;

/// Errors shared by every Textcast crate.
#[derive(Debug, Error)]
pub enum TextcastError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Transport error: {0}")]
    Transport(String),

    /// Permanent problem with a message's recipient or content.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Caller is authenticated but does not own the record.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The requested state transition is not allowed from the current state.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Enqueue error: {0}")]
    Enqueue(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TextcastError>;
