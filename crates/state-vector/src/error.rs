//! Error types for state vector design and ensemble building.

use thiserror::Error;
use virtual_grid::GridError;

/// Errors raised while designing or building a state vector.
#[derive(Error, Debug)]
pub enum StateVectorError {
    /// A malformed design call (bad name, index out of range, mismatched
    /// sequence metadata, ...). Raised at the call site.
    #[error("validation error: {0}")]
    Validation(String),

    /// The request contradicts the current structure: a frozen build, or a
    /// coupled variable that cannot follow the change. Prior state is kept.
    #[error("structural conflict: {0}")]
    StructuralConflict(String),

    /// A no-overlap draw could not find enough ensemble members.
    #[error("insufficient ensemble members: requested {requested}, found {found}")]
    InsufficientMembers { requested: usize, found: usize },

    /// Error from the virtual grid (catalog or source read).
    #[error(transparent)]
    Grid(#[from] GridError),

    /// Storage/IO error.
    #[error("storage error: {0}")]
    Storage(String),
}

impl StateVectorError {
    /// Create a Validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a StructuralConflict error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::StructuralConflict(msg.into())
    }

    /// Create a Storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

impl From<std::io::Error> for StateVectorError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for StateVectorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Result type for state vector operations.
pub type Result<T> = std::result::Result<T, StateVectorError>;
