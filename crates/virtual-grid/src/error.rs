//! Error types for the virtual grid.

use thiserror::Error;

/// Errors that can occur while cataloging or loading a grid.
#[derive(Error, Debug)]
pub enum GridError {
    /// A malformed request or catalog entry (unknown dimension, index out of
    /// range, duplicate coordinate row, ...).
    #[error("validation error: {0}")]
    Validation(String),

    /// A physical source could not be opened or read.
    #[error("source {source_id} is unreadable for range {range}: {reason}")]
    SourceUnreadable {
        source_id: String,
        range: String,
        reason: String,
    },

    /// Invalid metadata in a catalog or source.
    #[error("invalid grid metadata: {0}")]
    InvalidMetadata(String),

    /// Storage/IO error.
    #[error("storage error: {0}")]
    Storage(String),
}

impl GridError {
    /// Create a Validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a SourceUnreadable error.
    pub fn source_unreadable(
        source_id: impl Into<String>,
        range: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::SourceUnreadable {
            source_id: source_id.into(),
            range: range.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidMetadata error.
    pub fn invalid_metadata(msg: impl Into<String>) -> Self {
        Self::InvalidMetadata(msg.into())
    }
}

impl From<std::io::Error> for GridError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for GridError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidMetadata(err.to_string())
    }
}

/// Result type for virtual grid operations.
pub type Result<T> = std::result::Result<T, GridError>;
