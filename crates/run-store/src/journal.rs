//! Audit journal kept inside every run record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ErrorKind, StepFailure};

/// Something the executor did to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RunEvent {
    /// Forward execution began (or resumed) for the first time.
    RunStarted,

    /// A step's `execute` succeeded and its checkpoint was written.
    StepSucceeded(StepData),

    /// One `execute` attempt failed.
    StepAttemptFailed(AttemptFailedData),

    /// A step failed for good; compensation follows.
    StepFailed(StepFailure),

    /// A cancellation request was seen at a step boundary.
    CancellationObserved(StepData),

    /// Compensation started below the given step index.
    CompensationStarted(CompensationData),

    /// A step's `compensate` succeeded.
    StepCompensated(StepData),

    /// One `compensate` attempt failed.
    CompensationAttemptFailed(AttemptFailedData),

    /// A compensation ran out of attempts; the run needs an operator.
    CompensationFailed(StepFailure),

    /// Every step succeeded.
    RunCompleted,

    /// Every completed step was compensated.
    RunRolledBack,
}

impl RunEvent {
    /// Returns the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            RunEvent::RunStarted => "RunStarted",
            RunEvent::StepSucceeded(_) => "StepSucceeded",
            RunEvent::StepAttemptFailed(_) => "StepAttemptFailed",
            RunEvent::StepFailed(_) => "StepFailed",
            RunEvent::CancellationObserved(_) => "CancellationObserved",
            RunEvent::CompensationStarted(_) => "CompensationStarted",
            RunEvent::StepCompensated(_) => "StepCompensated",
            RunEvent::CompensationAttemptFailed(_) => "CompensationAttemptFailed",
            RunEvent::CompensationFailed(_) => "CompensationFailed",
            RunEvent::RunCompleted => "RunCompleted",
            RunEvent::RunRolledBack => "RunRolledBack",
        }
    }

    pub fn step_succeeded(step: impl Into<String>, step_index: usize) -> Self {
        RunEvent::StepSucceeded(StepData::new(step, step_index))
    }

    pub fn step_compensated(step: impl Into<String>, step_index: usize) -> Self {
        RunEvent::StepCompensated(StepData::new(step, step_index))
    }

    pub fn cancellation_observed(step: impl Into<String>, step_index: usize) -> Self {
        RunEvent::CancellationObserved(StepData::new(step, step_index))
    }

    pub fn compensation_started(from_step_index: usize, reason: ErrorKind) -> Self {
        RunEvent::CompensationStarted(CompensationData {
            from_step_index,
            reason,
        })
    }
}

/// A journal event stamped with the time it was recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// When the event was recorded.
    pub at: DateTime<Utc>,
    /// What happened.
    pub event: RunEvent,
}

impl JournalEntry {
    /// Stamps an event with the current time.
    pub fn now(event: RunEvent) -> Self {
        Self {
            at: Utc::now(),
            event,
        }
    }
}

/// Data naming a single step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepData {
    /// The step name.
    pub step: String,
    /// Position of the step in its definition.
    pub step_index: usize,
}

impl StepData {
    pub fn new(step: impl Into<String>, step_index: usize) -> Self {
        Self {
            step: step.into(),
            step_index,
        }
    }
}

/// Data for a failed attempt, forward or compensating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptFailedData {
    /// The step name.
    pub step: String,
    /// Position of the step in its definition.
    pub step_index: usize,
    /// 1-based attempt number that failed.
    pub attempt: u32,
    /// Classification of the failure.
    pub kind: ErrorKind,
    /// Error message reported by the step.
    pub message: String,
    /// Backoff before the next attempt, if one will be made.
    pub retry_in_ms: Option<u64>,
}

/// Data for CompensationStarted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationData {
    /// Steps strictly below this index are candidates for compensation.
    pub from_step_index: usize,
    /// Why forward execution stopped.
    pub reason: ErrorKind,
}
