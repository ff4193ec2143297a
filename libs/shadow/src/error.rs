//! Error types for shadow document operations.

use thiserror::Error;

/// Errors that can occur while merging or decoding shadow documents.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShadowError {
    /// A non-object value was patched onto an existing object.
    #[error("type conflict at `{path}`: cannot replace an object with a scalar or list")]
    TypeConflict { path: String },

    /// The document nests deeper than the allowed limit.
    #[error("document exceeds maximum depth of {max}")]
    DepthExceeded { max: usize },

    /// A document must be a JSON object at the top level.
    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ShadowError {
    fn from(err: serde_json::Error) -> Self {
        ShadowError::Serialization(err.to_string())
    }
}
