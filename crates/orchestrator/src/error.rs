//! Worker error types.

use run_store::RunStoreError;
use saga::{RetryPolicyError, SagaError};
use thiserror::Error;

/// Errors that stop the worker process.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A configuration value is unusable.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The configured retry settings are invalid.
    #[error(transparent)]
    RetryPolicy(#[from] RetryPolicyError),

    /// The saga engine failed.
    #[error("Saga error: {0}")]
    Saga(#[from] SagaError),

    /// The run store could not be opened or migrated.
    #[error("Run store error: {0}")]
    RunStore(#[from] RunStoreError),

    /// The Prometheus exporter could not be installed.
    #[error("Metrics exporter error: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    /// Logging could not be initialized.
    #[error("Tracing setup error: {0}")]
    Tracing(String),
}

/// Result type for worker operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
