//! The step capability and the values passed to it.

use async_trait::async_trait;
use common::{ErrorKind, RunId};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// A type usable as a saga context.
///
/// The executor owns the context for the lifetime of a run, snapshots it
/// to JSON at every checkpoint, and hands each step attempt a mutable
/// working copy.
pub trait SagaContext: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> SagaContext for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Error returned by a step's `execute` or `compensate`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct StepError {
    /// Classification consulted by the retry policy.
    pub kind: ErrorKind,
    /// Human-readable reason, recorded for audit.
    pub message: String,
}

impl StepError {
    /// Creates an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn business_rule(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BusinessRule, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

/// Identifies one invocation of a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepCall {
    /// The run being driven.
    pub run_id: RunId,
    /// Name of the step being invoked.
    pub step_name: String,
    /// Position of the step in its definition.
    pub step_index: usize,
    /// 1-based attempt number for this direction, counted across restarts.
    pub attempt: u32,
}

impl StepCall {
    pub fn new(run_id: RunId, step_name: impl Into<String>, step_index: usize, attempt: u32) -> Self {
        Self {
            run_id,
            step_name: step_name.into(),
            step_index,
            attempt,
        }
    }

    /// Stable key external adapters use to detect duplicate calls.
    ///
    /// The same for every attempt of the same step in the same run, and
    /// for both `execute` and `compensate`.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.run_id, self.step_name)
    }
}

/// One unit of forward work plus its compensating action.
///
/// Steps hold no per-run state; everything a step produces goes into the
/// context. Both operations may be invoked more than once with the same
/// context for the same run and must not duplicate external effects.
/// Per-attempt timeouts are the step's own business.
#[async_trait]
pub trait SagaStep<C: SagaContext>: Send + Sync {
    /// Name of the step, unique within its definition.
    fn name(&self) -> &str;

    /// Performs the step, writing its outputs into `ctx`.
    ///
    /// On error the executor discards whatever was written to `ctx`.
    async fn execute(&self, ctx: &mut C, call: &StepCall) -> Result<(), StepError>;

    /// Undoes a previously successful `execute`, clearing its outputs.
    async fn compensate(&self, ctx: &mut C, call: &StepCall) -> Result<(), StepError>;
}
