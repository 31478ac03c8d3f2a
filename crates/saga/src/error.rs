//! Saga error types.

use common::RunId;
use run_store::RunStoreError;
use thiserror::Error;

use crate::retry::RetryPolicyError;

/// Errors that can occur during saga operations.
///
/// Step failures are not errors at this level: they end up in the run's
/// terminal status and its recorded failure reason.
#[derive(Debug, Error)]
pub enum SagaError {
    /// No definition is registered under the name.
    #[error("Saga definition not found: {0}")]
    DefinitionNotFound(String),

    /// A definition with the same name was already registered.
    #[error("Saga definition already registered: {0}")]
    DuplicateDefinition(String),

    /// The definition is malformed, or does not match a stored run.
    #[error("Invalid saga definition: {0}")]
    InvalidDefinition(String),

    /// The retry policy configuration is invalid.
    #[error(transparent)]
    InvalidRetryPolicy(#[from] RetryPolicyError),

    /// No record exists for the run.
    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    /// Another executor invocation holds the run.
    #[error("Run already active: {0}")]
    RunAlreadyActive(RunId),

    /// The run store failed; the run stays at its last persisted checkpoint.
    #[error("Persistence error: {0}")]
    Persistence(#[source] RunStoreError),

    /// The context could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A spawned run task panicked or was aborted.
    #[error("Run task failed: {0}")]
    TaskFailed(String),
}

impl From<RunStoreError> for SagaError {
    fn from(err: RunStoreError) -> Self {
        match err {
            RunStoreError::RunNotFound(run_id) => SagaError::RunNotFound(run_id),
            other => SagaError::Persistence(other),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
