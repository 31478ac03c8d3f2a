use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ErrorKind, JournalEntry, RunEvent, RunId, RunStatus, StepStatus};

/// Why a step (or its compensation) gave up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    /// The step name.
    pub step: String,
    /// Position of the step in its definition.
    pub step_index: usize,
    /// Classification of the last error.
    pub kind: ErrorKind,
    /// Last error message.
    pub message: String,
    /// Attempts made before giving up.
    pub attempts: u32,
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "step '{}' ({}) failed after {} attempt(s): {} [{}]",
            self.step, self.step_index, self.attempts, self.message, self.kind
        )
    }
}

/// Per-step bookkeeping inside a run record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// The step name.
    pub name: String,
    /// Current status of the step.
    pub status: StepStatus,
    /// `execute` attempts made so far, across restarts.
    pub attempts: u32,
    /// `compensate` attempts made so far, across restarts.
    pub compensation_attempts: u32,
    /// The most recent error seen by either direction.
    pub last_error: Option<StepFailure>,
}

impl StepRecord {
    /// Creates a fresh, never-attempted step record.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            attempts: 0,
            compensation_attempts: 0,
            last_error: None,
        }
    }
}

/// The durable state of one saga run.
///
/// The executor is the only writer for a given run; stores overwrite the
/// whole record on every save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Unique identifier of the run.
    pub run_id: RunId,

    /// Name of the saga definition this run executes.
    pub saga_name: String,

    /// Index of the next step to execute. During compensation, the index of
    /// the step that failed (or would have run next, when cancelled).
    pub step_index: usize,

    /// One entry per step of the definition, in order.
    pub steps: Vec<StepRecord>,

    /// Serialized context snapshot.
    pub context: serde_json::Value,

    /// Lifecycle status.
    pub status: RunStatus,

    /// What stopped forward execution, if anything.
    pub failure: Option<StepFailure>,

    /// What stopped compensation, if anything.
    pub compensation_failure: Option<StepFailure>,

    /// Audit log, oldest first.
    pub journal: Vec<JournalEntry>,

    /// When the run was created.
    pub created_at: DateTime<Utc>,

    /// When the record was last changed.
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    /// Creates a pending run positioned at the first step.
    pub fn new<I, N>(
        run_id: RunId,
        saga_name: impl Into<String>,
        step_names: I,
        context: serde_json::Value,
    ) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        let now = Utc::now();
        Self {
            run_id,
            saga_name: saga_name.into(),
            step_index: 0,
            steps: step_names.into_iter().map(StepRecord::new).collect(),
            context,
            status: RunStatus::Pending,
            failure: None,
            compensation_failure: None,
            journal: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the terminal status, if the run has reached one.
    pub fn terminal_status(&self) -> Option<RunStatus> {
        self.status.is_terminal().then_some(self.status)
    }

    /// Returns true if the run has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Appends an event to the journal and bumps `updated_at`.
    pub fn record(&mut self, event: RunEvent) {
        let entry = JournalEntry::now(event);
        self.updated_at = entry.at;
        self.journal.push(entry);
    }

    /// Bumps `updated_at` without journaling anything.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Names of the steps whose status is `Succeeded`, in order.
    pub fn succeeded_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Succeeded)
            .map(|s| s.name.as_str())
            .collect()
    }
}
