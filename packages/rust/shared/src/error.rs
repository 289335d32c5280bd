//! Error types for the helpdesk pipeline.
//!
//! Library crates use [`HelpdeskError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! The variants follow the pipeline's failure taxonomy:
//! - [`HelpdeskError::Collaborator`] is absorbed at the stage boundary
//! - [`HelpdeskError::StorageUnavailable`] / [`HelpdeskError::Storage`] degrade
//!   durability but never the in-memory result
//! - [`HelpdeskError::MalformedState`] means the state machine itself is broken

use std::path::PathBuf;

/// Top-level error type for all helpdesk operations.
#[derive(Debug, thiserror::Error)]
pub enum HelpdeskError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Caller misuse (empty query, unknown flag combination, ...).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// An external collaborator (classifier, retriever, generator, evaluator,
    /// ticket system) failed.
    #[error("{collaborator} failed: {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
    },

    /// The backing store could not be reached.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The backing store answered, but the operation or payload was unusable.
    #[error("storage error: {0}")]
    Storage(String),

    /// A pipeline invariant was violated.
    #[error("malformed pipeline state: {message}")]
    MalformedState { message: String },

    /// JSON encoding/decoding error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, HelpdeskError>;

impl HelpdeskError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Attribute a failure to a named collaborator.
    pub fn collaborator(collaborator: &'static str, msg: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator,
            message: msg.into(),
        }
    }

    /// Create a malformed-state error from any displayable message.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedState {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error came from the checkpoint/cache backing store.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_) | Self::Storage(_))
    }

    /// Whether this error signals a broken state machine (never recovered from).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MalformedState { .. })
    }
}
