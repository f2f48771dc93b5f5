//! Error types for relay core

use thiserror::Error;

/// Result type alias using relay Error
pub type Result<T> = std::result::Result<T, Error>;

/// Relay error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Entry {index} not found for session {session_id}")]
    EntryNotFound { session_id: String, index: usize },

    #[error("Session already exists: {0}")]
    DuplicateSession(String),

    #[error("Backend not available: {backend}")]
    BackendNotAvailable { backend: String },

    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("Failed to read persisted state: {0}")]
    PersistenceRead(String),

    #[error("Unsupported snapshot schema version: {0}")]
    UnsupportedSchemaVersion(String),

    #[error("Invalid repository configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Workspace error: {0}")]
    Workspace(String),

    #[error("Activity sink error: {0}")]
    Activity(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures reported by a backend driver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend failed to start: {0}")]
    StartFailed(String),

    #[error("Backend is not streaming input")]
    NotStreaming,

    #[error("Backend process exited: {0}")]
    ProcessExited(String),

    #[error("Backend execution failed: {0}")]
    ExecutionFailed(String),
}

impl Error {
    /// Whether this error means the caller referenced something that does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::SessionNotFound(_) | Error::EntryNotFound { .. } | Error::RepositoryNotFound(_)
        )
    }
}
