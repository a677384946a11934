//! Unified error types for the Pocketbox workspace.
//!
//! Every component converts its low-level failures (I/O, HTTP, JSON) into
//! one of these variants at its boundary, so callers only ever match on
//! [`PocketboxError`].

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum PocketboxError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// A resource with the same identity already exists.
    #[error("{kind} '{id}' already exists")]
    AlreadyExists {
        /// Type of the conflicting resource.
        kind: &'static str,
        /// Identifier that is already taken.
        id: String,
    },

    /// An operation was dispatched to a container in a state that rejects it.
    #[error("container {id} is {state}: cannot {operation}")]
    InvalidState {
        /// Container identifier.
        id: String,
        /// State the container was in.
        state: String,
        /// Rejected operation.
        operation: &'static str,
    },

    /// A network request could not be completed (DNS, connect, timeout).
    #[error("network error for {url}: {message}")]
    Network {
        /// URL that was being requested.
        url: String,
        /// Description of the failure.
        message: String,
    },

    /// A registry answered with an unexpected HTTP status.
    #[error("unexpected HTTP status {status} from {url}")]
    HttpStatus {
        /// URL that was being requested.
        url: String,
        /// Status code returned.
        status: u16,
    },

    /// Registry data was malformed or incomplete.
    #[error("integrity error: {message}")]
    Integrity {
        /// Description of the malformed data.
        message: String,
    },

    /// A hash validation failed.
    #[error("hash mismatch for {resource}: expected {expected}, got {actual}")]
    HashMismatch {
        /// Resource that failed validation.
        resource: String,
        /// Expected hash value.
        expected: String,
        /// Actual computed hash value.
        actual: String,
    },

    /// The sandboxed process could not be started.
    #[error("failed to spawn sandbox: {message}")]
    Spawn {
        /// Description of the spawn failure.
        message: String,
    },

    /// None of the configured registry mirrors answered a health check.
    #[error("no registry mirror is accessible")]
    NoMirrorAvailable,

    /// The operation was cancelled before it completed.
    #[error("operation cancelled: {operation}")]
    Cancelled {
        /// Operation that was cancelled.
        operation: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl PocketboxError {
    /// Builds a [`PocketboxError::Io`] for `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns `true` when the error denotes a missing resource.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` when the error denotes a rejected state transition.
    #[must_use]
    pub const fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, PocketboxError>;
