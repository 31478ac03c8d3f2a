//! The saga executor.
//!
//! Drives runs forward step by step, checkpointing after every attempt, and
//! rolls completed steps back in reverse order when a step fails for good
//! or the run is cancelled. `resume` is the only way a run makes progress,
//! whether it was just started or is being recovered after a restart.
//!
//! Checkpoints are written only while this executor still owns the run's
//! lease. Once the lease is lost the run stops with `RunAlreadyActive`,
//! leaving the last checkpoint to whoever holds it now.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{ErrorKind, RunId};
use run_store::{
    AttemptFailedData, RunEvent, RunRecord, RunStatus, RunStore, StepFailure, StepRecord,
    StepStatus,
};
use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use crate::definition::{DefinitionRegistry, SagaDefinition};
use crate::error::{Result, SagaError};
use crate::lease::{ActiveRuns, Claim};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::step::{SagaContext, StepCall};

const CANCELLATION_MESSAGE: &str = "cancellation requested";

/// Executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Identifies this executor in run leases. Must be unique per process.
    pub owner_id: String,
    /// How long a lease stays valid without renewal.
    pub lease_ttl: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            owner_id: format!("executor-{}", Uuid::new_v4()),
            lease_ttl: Duration::from_secs(30),
        }
    }
}

/// What `resume` returns: the run's status and its context at that point.
#[derive(Debug, Clone)]
pub struct RunOutcome<C> {
    pub run_id: RunId,
    pub status: RunStatus,
    pub context: C,
    /// The forward failure that triggered compensation, if any.
    pub failure: Option<StepFailure>,
    /// The compensation that gave up, if any.
    pub compensation_failure: Option<StepFailure>,
}

impl<C: SagaContext> RunOutcome<C> {
    fn new(record: &RunRecord, context: C) -> Self {
        Self {
            run_id: record.run_id,
            status: record.status,
            context,
            failure: record.failure.clone(),
            compensation_failure: record.compensation_failure.clone(),
        }
    }

    fn from_record(record: &RunRecord) -> Result<Self> {
        let context = serde_json::from_value(record.context.clone())?;
        Ok(Self::new(record, context))
    }
}

/// Read-only view of a run for callers and operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub saga_name: String,
    pub status: RunStatus,
    pub step_index: usize,
    /// Steps whose effects are currently in place, in order.
    pub completed_steps: Vec<String>,
    pub failure: Option<StepFailure>,
    pub compensation_failure: Option<StepFailure>,
    pub cancellation_requested: bool,
    pub updated_at: DateTime<Utc>,
}

impl RunReport {
    fn from_record(record: &RunRecord, cancellation_requested: bool) -> Self {
        Self {
            run_id: record.run_id,
            saga_name: record.saga_name.clone(),
            status: record.status,
            step_index: record.step_index,
            completed_steps: record
                .succeeded_steps()
                .into_iter()
                .map(str::to_string)
                .collect(),
            failure: record.failure.clone(),
            compensation_failure: record.compensation_failure.clone(),
            cancellation_requested,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Compensate,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Forward => "execute",
            Direction::Compensate => "compensate",
        }
    }

    fn attempts(self, step: &StepRecord) -> u32 {
        match self {
            Direction::Forward => step.attempts,
            Direction::Compensate => step.compensation_attempts,
        }
    }

    fn set_attempts(self, step: &mut StepRecord, attempts: u32) {
        match self {
            Direction::Forward => step.attempts = attempts,
            Direction::Compensate => step.compensation_attempts = attempts,
        }
    }

    fn policy<C: SagaContext>(self, definition: &SagaDefinition<C>, index: usize) -> RetryPolicy {
        match self {
            Direction::Forward => definition.retry_policy(index),
            Direction::Compensate => definition.compensation_policy(index),
        }
    }

    fn gave_up_status(self) -> StepStatus {
        match self {
            Direction::Forward => StepStatus::Failed,
            Direction::Compensate => StepStatus::CompensationFailed,
        }
    }

    fn attempt_failed(self, data: AttemptFailedData) -> RunEvent {
        match self {
            Direction::Forward => RunEvent::StepAttemptFailed(data),
            Direction::Compensate => RunEvent::CompensationAttemptFailed(data),
        }
    }
}

enum StepResult {
    Succeeded,
    GaveUp(StepFailure),
}

/// Executes saga runs against a run store.
///
/// Cheap to clone; clones share the store, the definitions and the set of
/// runs held by this process.
pub struct SagaExecutor<C: SagaContext, S: RunStore> {
    store: S,
    definitions: Arc<DefinitionRegistry<C>>,
    active: ActiveRuns<S>,
}

impl<C: SagaContext, S: RunStore + Clone> Clone for SagaExecutor<C, S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            definitions: Arc::clone(&self.definitions),
            active: self.active.clone(),
        }
    }
}

impl<C: SagaContext, S: RunStore + Clone + 'static> SagaExecutor<C, S> {
    pub fn new(store: S, definitions: DefinitionRegistry<C>, config: ExecutorConfig) -> Self {
        let active = ActiveRuns::new(store.clone(), config.owner_id, config.lease_ttl);
        Self {
            store,
            definitions: Arc::new(definitions),
            active,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn definitions(&self) -> &DefinitionRegistry<C> {
        &self.definitions
    }

    /// Runs currently driven by this process.
    pub fn active_runs(&self) -> &ActiveRuns<S> {
        &self.active
    }

    /// Creates and persists a new pending run. Does not execute anything.
    ///
    /// Every call creates an independent run.
    #[tracing::instrument(skip(self, context))]
    pub async fn start(&self, saga_name: &str, context: C) -> Result<RunId> {
        let definition = self.definitions.get(saga_name)?;
        let record = RunRecord::new(
            RunId::new(),
            definition.name(),
            definition.step_names(),
            serde_json::to_value(&context)?,
        );

        self.store.save(&record).await?;

        metrics::counter!("saga_runs_started_total", "saga" => definition.name().to_string())
            .increment(1);
        tracing::info!(run_id = %record.run_id, steps = definition.len(), "Run created");

        Ok(record.run_id)
    }

    /// Drives a run until it reaches a terminal status.
    ///
    /// Returns immediately for runs that are already terminal. Fails with
    /// `RunAlreadyActive` if another invocation holds the run, and with
    /// `Persistence` if a checkpoint cannot be written; the run then stays
    /// at its last persisted checkpoint and may be resumed later.
    #[tracing::instrument(skip(self))]
    pub async fn resume(&self, run_id: RunId) -> Result<RunOutcome<C>> {
        let record = self.store.load(run_id).await?;
        if record.is_terminal() {
            tracing::debug!(status = %record.status, "Run already terminal");
            return RunOutcome::from_record(&record);
        }
        self.definitions.get(&record.saga_name)?;

        let claim = self.active.claim(run_id).await?;
        let result = self.drive(&claim).await;
        self.active.release(claim).await;

        if let Err(e) = &result {
            tracing::error!(error = %e, "Run interrupted");
        }
        result
    }

    /// Returns the current state of a run.
    pub async fn get_status(&self, run_id: RunId) -> Result<RunReport> {
        let record = self.store.load(run_id).await?;
        let cancellation_requested = self.store.is_cancellation_requested(run_id).await?;
        Ok(RunReport::from_record(&record, cancellation_requested))
    }

    /// Asks a run to stop. The executor sees the request at the next step
    /// boundary and compensates whatever has completed.
    ///
    /// Cancelling a terminal run does nothing.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, run_id: RunId) -> Result<()> {
        let record = self.store.load(run_id).await?;
        if record.is_terminal() {
            tracing::info!(status = %record.status, "Run already terminal, ignoring cancellation");
            return Ok(());
        }
        self.store.request_cancellation(run_id).await?;
        tracing::info!("Cancellation requested");
        Ok(())
    }

    /// Resumes a run on its own task.
    pub fn spawn(&self, run_id: RunId) -> JoinHandle<Result<RunOutcome<C>>> {
        let executor = self.clone();
        tokio::spawn(async move { executor.resume(run_id).await })
    }

    /// Starts a run and resumes it on its own task.
    pub async fn launch(
        &self,
        saga_name: &str,
        context: C,
    ) -> Result<(RunId, JoinHandle<Result<RunOutcome<C>>>)> {
        let run_id = self.start(saga_name, context).await?;
        Ok((run_id, self.spawn(run_id)))
    }

    /// Resumes every non-terminal run in the store, each on its own task,
    /// and waits for all of them. Results come back in store order.
    ///
    /// Dropping the returned future aborts every run still in flight; their
    /// leases stay behind until released or expired.
    #[tracing::instrument(skip(self))]
    pub async fn recover_incomplete(&self) -> Result<Vec<(RunId, Result<RunOutcome<C>>)>> {
        let run_ids = self.store.list_incomplete().await?;
        tracing::info!(count = run_ids.len(), "Recovering incomplete runs");

        let mut tasks = JoinSet::new();
        let mut task_runs = HashMap::with_capacity(run_ids.len());
        for &run_id in &run_ids {
            let executor = self.clone();
            let handle = tasks.spawn(async move { executor.resume(run_id).await });
            task_runs.insert(handle.id(), run_id);
        }

        let mut results = HashMap::with_capacity(run_ids.len());
        while let Some(joined) = tasks.join_next_with_id().await {
            let (task_id, result) = match joined {
                Ok((task_id, result)) => (task_id, result),
                Err(e) => (e.id(), Err(SagaError::TaskFailed(e.to_string()))),
            };
            if let Some(run_id) = task_runs.remove(&task_id) {
                results.insert(run_id, result);
            }
        }

        Ok(run_ids
            .into_iter()
            .filter_map(|run_id| results.remove(&run_id).map(|result| (run_id, result)))
            .collect())
    }

    async fn drive(&self, claim: &Claim) -> Result<RunOutcome<C>> {
        let run_id = claim.run_id();
        // Re-read under the claim; the earlier load may be stale.
        let mut record = self.store.load(run_id).await?;
        if record.is_terminal() {
            return RunOutcome::from_record(&record);
        }

        let definition = self.definitions.get(&record.saga_name)?;
        check_shape(&definition, &record)?;
        let mut context: C = serde_json::from_value(record.context.clone())?;

        if record.status == RunStatus::Compensating {
            tracing::info!(step_index = record.step_index, "Resuming compensation");
            return self
                .compensate(claim, &definition, &mut record, &mut context)
                .await;
        }

        self.run_forward(claim, &definition, &mut record, &mut context)
            .await
    }

    async fn run_forward(
        &self,
        claim: &Claim,
        definition: &SagaDefinition<C>,
        record: &mut RunRecord,
        context: &mut C,
    ) -> Result<RunOutcome<C>> {
        if record.status == RunStatus::Pending {
            record.status = RunStatus::Running;
            record.record(RunEvent::RunStarted);
            self.checkpoint(record).await?;
        }

        while record.step_index < definition.len() {
            let index = record.step_index;
            self.active.renew(claim).await?;

            if self.store.is_cancellation_requested(record.run_id).await? {
                let step = &record.steps[index];
                let failure = StepFailure {
                    step: step.name.clone(),
                    step_index: index,
                    kind: ErrorKind::Cancelled,
                    message: CANCELLATION_MESSAGE.to_string(),
                    attempts: step.attempts,
                };
                tracing::info!(step = %failure.step, step_index = index, "Cancellation observed");
                record.record(RunEvent::cancellation_observed(&failure.step, index));
                return self
                    .begin_compensation(claim, definition, record, context, failure)
                    .await;
            }

            match self
                .run_step(Direction::Forward, claim, definition, record, context, index)
                .await?
            {
                StepResult::Succeeded => {}
                StepResult::GaveUp(failure) => {
                    tracing::warn!(%failure, "Step failed, compensating");
                    return self
                        .begin_compensation(claim, definition, record, context, failure)
                        .await;
                }
            }
        }

        record.status = RunStatus::Completed;
        record.record(RunEvent::RunCompleted);
        self.checkpoint(record).await?;

        metrics::counter!("saga_runs_completed_total", "saga" => record.saga_name.clone())
            .increment(1);
        self.record_duration(record);
        tracing::info!("Run completed");

        Ok(RunOutcome::new(record, context.clone()))
    }

    async fn begin_compensation(
        &self,
        claim: &Claim,
        definition: &SagaDefinition<C>,
        record: &mut RunRecord,
        context: &mut C,
        failure: StepFailure,
    ) -> Result<RunOutcome<C>> {
        record.status = RunStatus::Compensating;
        if failure.kind != ErrorKind::Cancelled {
            record.record(RunEvent::StepFailed(failure.clone()));
        }
        record.record(RunEvent::compensation_started(
            failure.step_index,
            failure.kind,
        ));
        record.failure = Some(failure);
        self.checkpoint(record).await?;

        self.compensate(claim, definition, record, context).await
    }

    /// Compensates, in reverse order, every step below the current index
    /// whose effect may still be in place.
    async fn compensate(
        &self,
        claim: &Claim,
        definition: &SagaDefinition<C>,
        record: &mut RunRecord,
        context: &mut C,
    ) -> Result<RunOutcome<C>> {
        for index in (0..record.step_index).rev() {
            if !record.steps[index].status.needs_compensation() {
                continue;
            }

            if let StepResult::GaveUp(failure) = self
                .run_step(Direction::Compensate, claim, definition, record, context, index)
                .await?
            {
                tracing::error!(%failure, "Compensation failed, run needs manual intervention");
                record.status = RunStatus::CompensationFailed;
                record.record(RunEvent::CompensationFailed(failure.clone()));
                record.compensation_failure = Some(failure);
                self.checkpoint(record).await?;

                metrics::counter!(
                    "saga_compensation_failed_total",
                    "saga" => record.saga_name.clone()
                )
                .increment(1);
                self.record_duration(record);

                return Ok(RunOutcome::new(record, context.clone()));
            }
        }

        record.status = RunStatus::RolledBack;
        record.record(RunEvent::RunRolledBack);
        self.checkpoint(record).await?;

        metrics::counter!("saga_runs_rolled_back_total", "saga" => record.saga_name.clone())
            .increment(1);
        self.record_duration(record);
        tracing::info!("Run rolled back");

        Ok(RunOutcome::new(record, context.clone()))
    }

    /// Runs one direction of one step under its retry policy.
    ///
    /// Every attempt works on a copy of the context; the copy replaces the
    /// context only on success. The lease is renewed before each attempt,
    /// and losing it mid-attempt or mid-backoff abandons the run. Every
    /// failed attempt is checkpointed, the last one included, so a resume
    /// never spends more than the policy allows.
    async fn run_step(
        &self,
        direction: Direction,
        claim: &Claim,
        definition: &SagaDefinition<C>,
        record: &mut RunRecord,
        context: &mut C,
        index: usize,
    ) -> Result<StepResult> {
        let step = definition.step(index).ok_or_else(|| {
            SagaError::InvalidDefinition(format!(
                "saga '{}' has no step at index {index}",
                definition.name()
            ))
        })?;
        let policy = direction.policy(definition, index);

        // A crash after the last failed attempt was checkpointed leaves the
        // budget spent; give up without calling the step again.
        let spent = direction.attempts(&record.steps[index]);
        if spent > 0
            && let Some(last) = &record.steps[index].last_error
            && policy.decide(last.kind, spent) == RetryDecision::GiveUp
        {
            let failure = last.clone();
            record.steps[index].status = direction.gave_up_status();
            return Ok(StepResult::GaveUp(failure));
        }

        if direction == Direction::Compensate {
            record.steps[index].status = StepStatus::Compensating;
        }

        loop {
            self.active.renew(claim).await?;

            let attempt = direction.attempts(&record.steps[index]) + 1;
            let call = StepCall::new(record.run_id, step.name(), index, attempt);
            let mut working = context.clone();

            tracing::debug!(
                step = step.name(),
                direction = direction.as_str(),
                attempt,
                "Invoking step"
            );
            let invoke = async {
                match direction {
                    Direction::Forward => step.execute(&mut working, &call).await,
                    Direction::Compensate => step.compensate(&mut working, &call).await,
                }
            };
            let result = tokio::select! {
                result = invoke => result,
                () = claim.lost() => {
                    tracing::warn!(step = step.name(), attempt, "Lease lost during step, abandoning run");
                    return Err(SagaError::RunAlreadyActive(record.run_id));
                }
            };

            metrics::counter!(
                "saga_step_attempts_total",
                "saga" => record.saga_name.clone(),
                "step" => step.name().to_string(),
                "direction" => direction.as_str(),
                "outcome" => if result.is_ok() { "success" } else { "failure" }
            )
            .increment(1);

            direction.set_attempts(&mut record.steps[index], attempt);

            let err = match result {
                Ok(()) => {
                    record.context = serde_json::to_value(&working)?;
                    *context = working;
                    record.steps[index].last_error = None;
                    match direction {
                        Direction::Forward => {
                            record.steps[index].status = StepStatus::Succeeded;
                            record.step_index = index + 1;
                            record.record(RunEvent::step_succeeded(step.name(), index));
                        }
                        Direction::Compensate => {
                            record.steps[index].status = StepStatus::Compensated;
                            record.record(RunEvent::step_compensated(step.name(), index));
                        }
                    }
                    self.checkpoint(record).await?;
                    tracing::info!(
                        step = step.name(),
                        direction = direction.as_str(),
                        attempt,
                        "Step succeeded"
                    );
                    return Ok(StepResult::Succeeded);
                }
                Err(err) => err,
            };

            let failure = StepFailure {
                step: step.name().to_string(),
                step_index: index,
                kind: err.kind,
                message: err.message,
                attempts: attempt,
            };
            let decision = policy.decide(failure.kind, attempt);

            record.steps[index].last_error = Some(failure.clone());
            record.record(direction.attempt_failed(AttemptFailedData {
                step: failure.step.clone(),
                step_index: index,
                attempt,
                kind: failure.kind,
                message: failure.message.clone(),
                retry_in_ms: decision
                    .delay()
                    .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            }));

            match decision {
                RetryDecision::Retry { after } => {
                    tracing::warn!(
                        step = step.name(),
                        direction = direction.as_str(),
                        attempt,
                        kind = %failure.kind,
                        error = %failure.message,
                        retry_in = ?after,
                        "Step attempt failed, retrying"
                    );
                    self.checkpoint(record).await?;
                    tokio::select! {
                        () = tokio::time::sleep(after) => {}
                        () = claim.lost() => {
                            tracing::warn!(step = step.name(), "Lease lost during backoff, abandoning run");
                            return Err(SagaError::RunAlreadyActive(record.run_id));
                        }
                    }
                }
                RetryDecision::GiveUp => {
                    // Saved before the status flips so a resume still sees
                    // the step as unfinished and takes the exhausted path.
                    self.checkpoint(record).await?;
                    record.steps[index].status = direction.gave_up_status();
                    return Ok(StepResult::GaveUp(failure));
                }
            }
        }
    }

    /// Persists the record if this executor still owns the run.
    async fn checkpoint(&self, record: &mut RunRecord) -> Result<()> {
        record.touch();
        if self.store.save_if_owner(record, self.active.owner()).await? {
            return Ok(());
        }
        tracing::warn!(run_id = %record.run_id, "Lease lost, checkpoint refused");
        Err(SagaError::RunAlreadyActive(record.run_id))
    }

    fn record_duration(&self, record: &RunRecord) {
        let elapsed = (record.updated_at - record.created_at)
            .to_std()
            .unwrap_or_default();
        metrics::histogram!(
            "saga_run_duration_seconds",
            "saga" => record.saga_name.clone(),
            "status" => record.status.as_str()
        )
        .record(elapsed.as_secs_f64());
    }
}

/// Rejects records written for a different version of the definition.
fn check_shape<C: SagaContext>(definition: &SagaDefinition<C>, record: &RunRecord) -> Result<()> {
    let stored: Vec<&str> = record.steps.iter().map(|s| s.name.as_str()).collect();
    if stored != definition.step_names() {
        return Err(SagaError::InvalidDefinition(format!(
            "run {} was recorded with steps {stored:?}, saga '{}' now has {:?}",
            record.run_id,
            definition.name(),
            definition.step_names()
        )));
    }
    if record.step_index > definition.len() {
        return Err(SagaError::InvalidDefinition(format!(
            "run {} is at step {} of {}",
            record.run_id,
            record.step_index,
            definition.len()
        )));
    }
    Ok(())
}
