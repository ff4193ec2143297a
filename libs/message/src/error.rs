//! Error types for message handling.

use thiserror::Error;

/// Errors that can occur when encoding or decoding messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// The message content could not be decoded into the requested type.
    #[error("invalid content for `{kind}` message: {reason}")]
    InvalidContent { kind: String, reason: String },

    /// A required metadata key is absent.
    #[error("missing metadata key: {0}")]
    MissingMetadata(&'static str),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for MessageError {
    fn from(err: serde_json::Error) -> Self {
        MessageError::Serialization(err.to_string())
    }
}
