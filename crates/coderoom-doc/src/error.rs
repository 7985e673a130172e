//! Error types for the document layer.

use thiserror::Error;

/// Errors raised while applying operations or presence updates.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocError {
    #[error("Malformed operation: {0}")]
    MalformedOperation(String),

    #[error("Malformed awareness update: {0}")]
    MalformedAwareness(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for DocError {
    fn from(err: serde_json::Error) -> Self {
        DocError::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DocError>;
