use thiserror::Error;

use crate::RunId;

/// Errors that can occur when interacting with a run store.
#[derive(Debug, Error)]
pub enum RunStoreError {
    /// No record exists for the run.
    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    /// The store cannot be reached right now; the caller may retry later.
    #[error("Run store unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be mapped back to a record.
    #[error("Invalid run record: {0}")]
    InvalidRecord(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for run store operations.
pub type Result<T> = std::result::Result<T, RunStoreError>;
