//! Run and step state machines.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::RunStoreError;

/// The state of a saga run in its lifecycle.
///
/// State transitions:
/// ```text
/// Pending ──► Running ──┬──► Completed
///                       └──► Compensating ──┬──► RolledBack
///                                           └──► CompensationFailed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RunStatus {
    /// Run has been created but no step has been attempted.
    #[default]
    Pending,

    /// Forward steps are being executed.
    Running,

    /// A step failed (or the run was cancelled) and compensation is in progress.
    Compensating,

    /// All steps succeeded (terminal).
    Completed,

    /// Every completed step was compensated (terminal).
    RolledBack,

    /// A compensation exhausted its retries; needs an operator (terminal).
    CompensationFailed,
}

impl RunStatus {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::RolledBack | RunStatus::CompensationFailed
        )
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "Pending",
            RunStatus::Running => "Running",
            RunStatus::Compensating => "Compensating",
            RunStatus::Completed => "Completed",
            RunStatus::RolledBack => "RolledBack",
            RunStatus::CompensationFailed => "CompensationFailed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = RunStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(RunStatus::Pending),
            "Running" => Ok(RunStatus::Running),
            "Compensating" => Ok(RunStatus::Compensating),
            "Completed" => Ok(RunStatus::Completed),
            "RolledBack" => Ok(RunStatus::RolledBack),
            "CompensationFailed" => Ok(RunStatus::CompensationFailed),
            other => Err(RunStoreError::InvalidRecord(format!(
                "unknown run status '{other}'"
            ))),
        }
    }
}

/// The state of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StepStatus {
    /// Not yet executed successfully.
    #[default]
    Pending,
    /// `execute` succeeded and the checkpoint was written.
    Succeeded,
    /// `execute` failed terminally or ran out of attempts.
    Failed,
    /// `compensate` has started but not yet been confirmed.
    Compensating,
    /// `compensate` succeeded.
    Compensated,
    /// `compensate` ran out of attempts.
    CompensationFailed,
}

impl StepStatus {
    /// Returns true if the step's side effect may still be in place and
    /// therefore needs compensation during rollback.
    pub fn needs_compensation(&self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Compensating)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StepStatus::Pending => "Pending",
            StepStatus::Succeeded => "Succeeded",
            StepStatus::Failed => "Failed",
            StepStatus::Compensating => "Compensating",
            StepStatus::Compensated => "Compensated",
            StepStatus::CompensationFailed => "CompensationFailed",
        };
        write!(f, "{name}")
    }
}
