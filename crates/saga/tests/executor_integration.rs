//! Integration tests for the saga executor against the in-memory run store.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{ErrorKind, RunId};
use run_store::{InMemoryRunStore, RunEvent, RunStore, StepFailure};
use saga::{
    DefinitionRegistry, ExecutorConfig, RetryPolicy, RunStatus, SagaClient, SagaDefinition,
    SagaError, SagaExecutor, SagaStep, StepCall, StepError, StepStatus,
};
use tokio::sync::Notify;

/// Context for test sagas: the names of the steps whose effects are in
/// place, in execution order.
type Trail = Vec<String>;

const SAGA: &str = "Trail";

#[derive(Clone, Default)]
struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }

    fn compensations(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.starts_with("compensate:"))
            .collect()
    }
}

/// A step that records every call and fails according to a script.
struct ScriptedStep {
    name: &'static str,
    log: CallLog,
    execute_failures: Mutex<VecDeque<ErrorKind>>,
    compensate_failures: Mutex<VecDeque<ErrorKind>>,
    compensate_always_fails: bool,
    keys: Mutex<Vec<String>>,
    gate: Option<Gate>,
    on_execute: Option<Box<dyn Fn() + Send + Sync>>,
}

/// Lets a test hold a step inside `execute` until it says go.
#[derive(Clone, Default)]
struct Gate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl ScriptedStep {
    fn new(name: &'static str, log: &CallLog) -> Self {
        Self {
            name,
            log: log.clone(),
            execute_failures: Mutex::new(VecDeque::new()),
            compensate_failures: Mutex::new(VecDeque::new()),
            compensate_always_fails: false,
            keys: Mutex::new(Vec::new()),
            gate: None,
            on_execute: None,
        }
    }

    fn failing(self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        *self.execute_failures.lock().unwrap() = kinds.into_iter().collect();
        self
    }

    fn failing_compensation(self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        *self.compensate_failures.lock().unwrap() = kinds.into_iter().collect();
        self
    }

    fn compensation_always_fails(mut self) -> Self {
        self.compensate_always_fails = true;
        self
    }

    fn gated(mut self, gate: &Gate) -> Self {
        self.gate = Some(gate.clone());
        self
    }

    fn on_execute(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_execute = Some(Box::new(hook));
        self
    }
}

#[async_trait]
impl SagaStep<Trail> for ScriptedStep {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self, ctx: &mut Trail, call: &StepCall) -> Result<(), StepError> {
        self.log.push(format!("execute:{}", self.name));
        self.keys.lock().unwrap().push(call.idempotency_key());

        // Written before failing: the executor must throw this away.
        ctx.push(self.name.to_string());

        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if let Some(hook) = &self.on_execute {
            hook();
        }

        let failure = self.execute_failures.lock().unwrap().pop_front();
        match failure {
            Some(kind) => Err(StepError::new(kind, format!("{} failed", self.name))),
            None => Ok(()),
        }
    }

    async fn compensate(&self, ctx: &mut Trail, _call: &StepCall) -> Result<(), StepError> {
        self.log.push(format!("compensate:{}", self.name));
        ctx.retain(|name| name != self.name);

        if self.compensate_always_fails {
            return Err(StepError::unavailable(format!("{} undo failed", self.name)));
        }
        let failure = self.compensate_failures.lock().unwrap().pop_front();
        match failure {
            Some(kind) => Err(StepError::new(kind, format!("{} undo failed", self.name))),
            None => Ok(()),
        }
    }
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::fixed(max_attempts, Duration::from_millis(1)).unwrap()
}

fn executor_with(
    store: &InMemoryRunStore,
    steps: Vec<ScriptedStep>,
    retry: RetryPolicy,
) -> SagaExecutor<Trail, InMemoryRunStore> {
    executor_owned_by(store, steps, retry, ExecutorConfig::default())
}

fn executor_owned_by(
    store: &InMemoryRunStore,
    steps: Vec<ScriptedStep>,
    retry: RetryPolicy,
    config: ExecutorConfig,
) -> SagaExecutor<Trail, InMemoryRunStore> {
    let mut builder = SagaDefinition::builder(SAGA).retry_policy(retry);
    for step in steps {
        builder = builder.step(step);
    }
    let registry = DefinitionRegistry::new().with(builder.build().unwrap()).unwrap();
    SagaExecutor::new(store.clone(), registry, config)
}

fn three_steps(log: &CallLog) -> Vec<ScriptedStep> {
    vec![
        ScriptedStep::new("a", log),
        ScriptedStep::new("b", log),
        ScriptedStep::new("c", log),
    ]
}

fn event_types(record: &run_store::RunRecord) -> Vec<&'static str> {
    record.journal.iter().map(|e| e.event.event_type()).collect()
}

#[tokio::test]
async fn test_all_steps_succeed() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let executor = executor_with(&store, three_steps(&log), fast_retry(3));

    let run_id = executor.start(SAGA, Vec::new()).await.unwrap();
    let outcome = executor.resume(run_id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.context, vec!["a", "b", "c"]);
    assert!(outcome.failure.is_none());
    assert_eq!(log.entries(), vec!["execute:a", "execute:b", "execute:c"]);

    let record = store.load(run_id).await.unwrap();
    assert_eq!(record.step_index, 3);
    assert!(record.steps.iter().all(|s| s.status == StepStatus::Succeeded));
    assert_eq!(
        event_types(&record),
        vec![
            "RunStarted",
            "StepSucceeded",
            "StepSucceeded",
            "StepSucceeded",
            "RunCompleted"
        ]
    );
    // The lease is released once the run is done.
    assert_eq!(store.lease_owner(run_id).await, None);
}

#[tokio::test]
async fn test_start_creates_pending_run_without_executing() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let executor = executor_with(&store, three_steps(&log), fast_retry(3));

    let first = executor.start(SAGA, vec!["seed".to_string()]).await.unwrap();
    let second = executor.start(SAGA, vec!["seed".to_string()]).await.unwrap();
    assert_ne!(first, second);

    let record = store.load(first).await.unwrap();
    assert_eq!(record.status, RunStatus::Pending);
    assert_eq!(record.step_index, 0);
    assert_eq!(record.context, serde_json::json!(["seed"]));
    assert!(log.entries().is_empty());
}

#[tokio::test]
async fn test_retryable_failures_are_absorbed() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let steps = vec![
        ScriptedStep::new("a", &log),
        ScriptedStep::new("b", &log).failing([ErrorKind::Network, ErrorKind::Timeout]),
    ];
    let executor = executor_with(&store, steps, fast_retry(3));

    let run_id = executor.start(SAGA, Vec::new()).await.unwrap();
    let outcome = executor.resume(run_id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    // Writes from the two failed attempts were discarded.
    assert_eq!(outcome.context, vec!["a", "b"]);
    assert_eq!(log.count("execute:b"), 3);

    let record = store.load(run_id).await.unwrap();
    assert_eq!(record.steps[1].attempts, 3);
    assert!(record.steps[1].last_error.is_none());
    let retries: Vec<_> = record
        .journal
        .iter()
        .filter_map(|e| match &e.event {
            RunEvent::StepAttemptFailed(data) => Some((data.attempt, data.retry_in_ms)),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![(1, Some(1)), (2, Some(1))]);
}

#[tokio::test]
async fn test_exhausted_step_compensates_in_reverse_order() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let steps = vec![
        ScriptedStep::new("a", &log),
        ScriptedStep::new("b", &log),
        ScriptedStep::new("c", &log).failing([ErrorKind::Network; 3]),
        ScriptedStep::new("d", &log),
    ];
    let executor = executor_with(&store, steps, fast_retry(3));

    let run_id = executor.start(SAGA, Vec::new()).await.unwrap();
    let outcome = executor.resume(run_id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::RolledBack);
    assert!(outcome.context.is_empty());
    assert_eq!(log.count("execute:c"), 3);
    assert_eq!(log.count("execute:d"), 0);
    assert_eq!(log.compensations(), vec!["compensate:b", "compensate:a"]);

    let failure = outcome.failure.unwrap();
    assert_eq!(failure.step, "c");
    assert_eq!(failure.step_index, 2);
    assert_eq!(failure.kind, ErrorKind::Network);
    assert_eq!(failure.attempts, 3);

    let record = store.load(run_id).await.unwrap();
    assert_eq!(record.steps[0].status, StepStatus::Compensated);
    assert_eq!(record.steps[1].status, StepStatus::Compensated);
    assert_eq!(record.steps[2].status, StepStatus::Failed);
    assert_eq!(record.steps[3].status, StepStatus::Pending);
}

#[tokio::test]
async fn test_terminal_error_is_not_retried() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let steps = vec![
        ScriptedStep::new("a", &log),
        ScriptedStep::new("b", &log).failing([ErrorKind::BusinessRule]),
    ];
    let executor = executor_with(&store, steps, fast_retry(5));

    let run_id = executor.start(SAGA, Vec::new()).await.unwrap();
    let outcome = executor.resume(run_id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::RolledBack);
    assert_eq!(log.count("execute:b"), 1);
    assert_eq!(outcome.failure.unwrap().kind, ErrorKind::BusinessRule);

    let record = store.load(run_id).await.unwrap();
    assert_eq!(
        event_types(&record),
        vec![
            "RunStarted",
            "StepSucceeded",
            "StepAttemptFailed",
            "StepFailed",
            "CompensationStarted",
            "StepCompensated",
            "RunRolledBack"
        ]
    );
}

#[tokio::test]
async fn test_first_step_failure_rolls_back_nothing() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let steps = vec![
        ScriptedStep::new("a", &log).failing([ErrorKind::Validation]),
        ScriptedStep::new("b", &log),
    ];
    let executor = executor_with(&store, steps, fast_retry(3));

    let run_id = executor.start(SAGA, Vec::new()).await.unwrap();
    let outcome = executor.resume(run_id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::RolledBack);
    assert!(log.compensations().is_empty());
}

#[tokio::test]
async fn test_compensation_retries_then_succeeds() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let steps = vec![
        ScriptedStep::new("a", &log).failing_compensation([ErrorKind::Timeout]),
        ScriptedStep::new("b", &log).failing([ErrorKind::BusinessRule]),
    ];
    let executor = executor_with(&store, steps, fast_retry(3));

    let run_id = executor.start(SAGA, Vec::new()).await.unwrap();
    let outcome = executor.resume(run_id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::RolledBack);
    assert_eq!(log.count("compensate:a"), 2);
    let record = store.load(run_id).await.unwrap();
    assert_eq!(record.steps[0].compensation_attempts, 2);
    assert_eq!(record.steps[0].status, StepStatus::Compensated);
}

#[tokio::test]
async fn test_compensation_failure_halts_rollback() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let steps = vec![
        ScriptedStep::new("a", &log),
        ScriptedStep::new("b", &log).compensation_always_fails(),
        ScriptedStep::new("c", &log).failing([ErrorKind::BusinessRule]),
    ];
    let executor = executor_with(&store, steps, fast_retry(3));

    let run_id = executor.start(SAGA, Vec::new()).await.unwrap();
    let outcome = executor.resume(run_id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::CompensationFailed);
    assert_eq!(log.count("compensate:b"), 3);
    assert_eq!(log.count("compensate:a"), 0);

    let failure = outcome.compensation_failure.unwrap();
    assert_eq!(failure.step, "b");
    assert_eq!(failure.attempts, 3);
    assert_eq!(failure.kind, ErrorKind::Unavailable);
    assert_eq!(outcome.failure.unwrap().step, "c");

    let record = store.load(run_id).await.unwrap();
    assert_eq!(record.steps[0].status, StepStatus::Succeeded);
    assert_eq!(record.steps[1].status, StepStatus::CompensationFailed);

    // Terminal: resuming again does nothing.
    let again = executor.resume(run_id).await.unwrap();
    assert_eq!(again.status, RunStatus::CompensationFailed);
    assert_eq!(log.count("compensate:b"), 3);
}

#[tokio::test]
async fn test_separate_compensation_policy() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let definition = SagaDefinition::builder(SAGA)
        .retry_policy(fast_retry(3))
        .compensation_retry_policy(fast_retry(5))
        .step(ScriptedStep::new("a", &log).compensation_always_fails())
        .step(ScriptedStep::new("b", &log).failing([ErrorKind::BusinessRule]))
        .build()
        .unwrap();
    let registry = DefinitionRegistry::new().with(definition).unwrap();
    let executor = SagaExecutor::new(store.clone(), registry, ExecutorConfig::default());

    let run_id = executor.start(SAGA, Vec::new()).await.unwrap();
    let outcome = executor.resume(run_id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::CompensationFailed);
    assert_eq!(log.count("compensate:a"), 5);
}

#[tokio::test]
async fn test_zero_step_saga_completes() {
    let store = InMemoryRunStore::new();
    let executor = executor_with(&store, Vec::new(), fast_retry(3));

    let run_id = executor.start(SAGA, vec!["untouched".to_string()]).await.unwrap();
    let outcome = executor.resume(run_id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.context, vec!["untouched"]);
}

#[tokio::test]
async fn test_resume_of_terminal_run_is_a_noop() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let executor = executor_with(&store, three_steps(&log), fast_retry(3));

    let run_id = executor.start(SAGA, Vec::new()).await.unwrap();
    executor.resume(run_id).await.unwrap();
    let saves = store.save_count();

    let outcome = executor.resume(run_id).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.context, vec!["a", "b", "c"]);
    assert_eq!(store.save_count(), saves);
    assert_eq!(log.count("execute:a"), 1);
}

#[tokio::test]
async fn test_crash_before_checkpoint_reexecutes_only_that_step() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let armed = Arc::new(AtomicBool::new(true));
    let crash = {
        let store = store.clone();
        let armed = Arc::clone(&armed);
        // Fires once: b succeeds, but its checkpoint cannot be written.
        move || {
            if armed.swap(false, Ordering::SeqCst) {
                store.set_fail_on_save(true);
            }
        }
    };
    let steps = vec![
        ScriptedStep::new("a", &log),
        ScriptedStep::new("b", &log).on_execute(crash),
        ScriptedStep::new("c", &log),
    ];
    let executor = executor_with(&store, steps, fast_retry(3));

    let run_id = executor.start(SAGA, Vec::new()).await.unwrap();
    let result = executor.resume(run_id).await;
    assert!(matches!(result, Err(SagaError::Persistence(_))));

    // The run stays at its last checkpoint: a done, b not.
    let record = store.load(run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Running);
    assert_eq!(record.step_index, 1);
    assert_eq!(record.context, serde_json::json!(["a"]));
    assert!(!executor.active_runs().is_held(run_id).await);

    store.set_fail_on_save(false);
    let outcome = executor.resume(run_id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.context, vec!["a", "b", "c"]);
    assert_eq!(log.count("execute:a"), 1);
    assert_eq!(log.count("execute:b"), 2);
    assert_eq!(log.count("execute:c"), 1);
}

#[tokio::test]
async fn test_resume_after_crash_skips_checkpointed_steps() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let executor = executor_with(&store, three_steps(&log), fast_retry(3));

    // Simulate a process that checkpointed step a and then died.
    let run_id = executor.start(SAGA, Vec::new()).await.unwrap();
    let mut record = store.load(run_id).await.unwrap();
    record.status = RunStatus::Running;
    record.step_index = 1;
    record.steps[0].status = StepStatus::Succeeded;
    record.steps[0].attempts = 1;
    record.context = serde_json::json!(["a"]);
    store.save(&record).await.unwrap();

    let outcome = executor.resume(run_id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.context, vec!["a", "b", "c"]);
    assert_eq!(log.entries(), vec!["execute:b", "execute:c"]);
}

#[tokio::test]
async fn test_idempotency_key_is_stable_across_attempts() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let step = Arc::new(ScriptedStep::new("a", &log).failing([ErrorKind::Network]));
    let definition = SagaDefinition::builder(SAGA)
        .retry_policy(fast_retry(3))
        .shared_step(step.clone())
        .build()
        .unwrap();
    let registry = DefinitionRegistry::new().with(definition).unwrap();
    let executor = SagaExecutor::new(store.clone(), registry, ExecutorConfig::default());

    let run_id = executor.start(SAGA, Vec::new()).await.unwrap();
    executor.resume(run_id).await.unwrap();

    let keys = step.keys.lock().unwrap().clone();
    assert_eq!(keys, vec![format!("{run_id}:a"), format!("{run_id}:a")]);
}

#[tokio::test]
async fn test_resume_compensating_run_skips_compensated_steps() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let executor = executor_with(&store, three_steps(&log), fast_retry(3));

    // Crashed mid-rollback: b already compensated, a not yet.
    let run_id = executor.start(SAGA, Vec::new()).await.unwrap();
    let mut record = store.load(run_id).await.unwrap();
    record.status = RunStatus::Compensating;
    record.step_index = 2;
    record.steps[0].status = StepStatus::Succeeded;
    record.steps[1].status = StepStatus::Compensated;
    record.steps[2].status = StepStatus::Failed;
    record.context = serde_json::json!(["a"]);
    store.save(&record).await.unwrap();

    let outcome = executor.resume(run_id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::RolledBack);
    assert_eq!(log.entries(), vec!["compensate:a"]);
    assert!(outcome.context.is_empty());
}

#[tokio::test]
async fn test_interrupted_compensation_is_replayed() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let executor = executor_with(&store, three_steps(&log), fast_retry(3));

    // b's compensation began but was never confirmed.
    let run_id = executor.start(SAGA, Vec::new()).await.unwrap();
    let mut record = store.load(run_id).await.unwrap();
    record.status = RunStatus::Compensating;
    record.step_index = 2;
    record.steps[0].status = StepStatus::Succeeded;
    record.steps[1].status = StepStatus::Compensating;
    record.steps[1].compensation_attempts = 1;
    record.steps[2].status = StepStatus::Failed;
    record.context = serde_json::json!(["a", "b"]);
    store.save(&record).await.unwrap();

    let outcome = executor.resume(run_id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::RolledBack);
    assert_eq!(log.entries(), vec!["compensate:b", "compensate:a"]);
    let record = store.load(run_id).await.unwrap();
    assert_eq!(record.steps[1].compensation_attempts, 2);
}

#[tokio::test]
async fn test_exhausted_attempts_are_not_retried_after_restart() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let executor = executor_with(&store, three_steps(&log), fast_retry(2));

    let run_id = executor.start(SAGA, Vec::new()).await.unwrap();
    let mut record = store.load(run_id).await.unwrap();
    record.status = RunStatus::Running;
    record.steps[0].attempts = 2;
    record.steps[0].last_error = Some(StepFailure {
        step: "a".to_string(),
        step_index: 0,
        kind: ErrorKind::Timeout,
        message: "a timed out".to_string(),
        attempts: 2,
    });
    store.save(&record).await.unwrap();

    let outcome = executor.resume(run_id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::RolledBack);
    assert!(log.entries().is_empty());
    let failure = outcome.failure.unwrap();
    assert_eq!(failure.kind, ErrorKind::Timeout);
    assert_eq!(failure.attempts, 2);
}

#[tokio::test]
async fn test_concurrent_resume_is_rejected() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let gate = Gate::default();
    let steps = vec![
        ScriptedStep::new("a", &log).gated(&gate),
        ScriptedStep::new("b", &log),
    ];
    let executor = executor_with(&store, steps, fast_retry(3));

    let run_id = executor.start(SAGA, Vec::new()).await.unwrap();
    let first = executor.spawn(run_id);
    gate.entered.notified().await;

    let second = executor.resume(run_id).await;
    assert!(matches!(second, Err(SagaError::RunAlreadyActive(id)) if id == run_id));
    assert!(executor.active_runs().is_held(run_id).await);

    gate.release.notify_one();
    let outcome = first.await.unwrap().unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(log.count("execute:a"), 1);
    assert!(!executor.active_runs().is_held(run_id).await);
}

#[tokio::test]
async fn test_concurrent_resume_across_executors_is_rejected() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let gate = Gate::default();
    let holder = executor_with(
        &store,
        vec![ScriptedStep::new("a", &log).gated(&gate)],
        fast_retry(3),
    );
    let other = executor_with(&store, vec![ScriptedStep::new("a", &log)], fast_retry(3));

    let run_id = holder.start(SAGA, Vec::new()).await.unwrap();
    let first = holder.spawn(run_id);
    gate.entered.notified().await;

    let result = other.resume(run_id).await;
    assert!(matches!(result, Err(SagaError::RunAlreadyActive(_))));

    gate.release.notify_one();
    assert_eq!(first.await.unwrap().unwrap().status, RunStatus::Completed);
    assert_eq!(log.count("execute:a"), 1);
}

#[tokio::test]
async fn test_cancellation_observed_at_next_boundary() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let gate = Gate::default();
    let steps = vec![
        ScriptedStep::new("a", &log).gated(&gate),
        ScriptedStep::new("b", &log),
    ];
    let executor = executor_with(&store, steps, fast_retry(3));

    let run_id = executor.start(SAGA, Vec::new()).await.unwrap();
    let handle = executor.spawn(run_id);
    gate.entered.notified().await;

    // The in-flight step is not interrupted.
    executor.cancel(run_id).await.unwrap();
    assert!(executor.get_status(run_id).await.unwrap().cancellation_requested);
    gate.release.notify_one();

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.status, RunStatus::RolledBack);
    assert_eq!(log.entries(), vec!["execute:a", "compensate:a"]);

    let failure = outcome.failure.unwrap();
    assert_eq!(failure.kind, ErrorKind::Cancelled);
    assert_eq!(failure.step, "b");
    assert_eq!(failure.step_index, 1);

    let record = store.load(run_id).await.unwrap();
    assert!(
        record
            .journal
            .iter()
            .any(|e| matches!(&e.event, RunEvent::CancellationObserved(data) if data.step == "b"))
    );
}

#[tokio::test]
async fn test_cancel_before_first_step() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let executor = executor_with(&store, three_steps(&log), fast_retry(3));

    let run_id = executor.start(SAGA, Vec::new()).await.unwrap();
    executor.cancel(run_id).await.unwrap();
    let outcome = executor.resume(run_id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::RolledBack);
    assert!(log.entries().is_empty());
}

#[tokio::test]
async fn test_cancel_terminal_run_is_ignored() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let executor = executor_with(&store, three_steps(&log), fast_retry(3));

    let run_id = executor.start(SAGA, Vec::new()).await.unwrap();
    executor.resume(run_id).await.unwrap();
    executor.cancel(run_id).await.unwrap();

    let report = executor.get_status(run_id).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert!(!report.cancellation_requested);
}

#[tokio::test]
async fn test_start_surfaces_persistence_errors() {
    let store = InMemoryRunStore::new();
    let executor = executor_with(&store, Vec::new(), fast_retry(3));
    store.set_fail_on_save(true);

    let result = executor.start(SAGA, Vec::new()).await;
    assert!(matches!(result, Err(SagaError::Persistence(_))));
    assert_eq!(store.run_count().await, 0);
}

#[tokio::test]
async fn test_unknown_definition_and_run() {
    let store = InMemoryRunStore::new();
    let executor = executor_with(&store, Vec::new(), fast_retry(3));

    let result = executor.start("Missing", Vec::new()).await;
    assert!(matches!(result, Err(SagaError::DefinitionNotFound(name)) if name == "Missing"));

    let run_id = RunId::new();
    assert!(matches!(
        executor.resume(run_id).await,
        Err(SagaError::RunNotFound(id)) if id == run_id
    ));
    assert!(matches!(
        executor.get_status(run_id).await,
        Err(SagaError::RunNotFound(_))
    ));
    assert!(matches!(
        executor.cancel(run_id).await,
        Err(SagaError::RunNotFound(_))
    ));
}

#[tokio::test]
async fn test_recover_incomplete_resumes_every_open_run() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let executor = executor_with(&store, three_steps(&log), fast_retry(3));

    let done = executor.start(SAGA, Vec::new()).await.unwrap();
    executor.resume(done).await.unwrap();
    let first = executor.start(SAGA, Vec::new()).await.unwrap();
    let second = executor.start(SAGA, Vec::new()).await.unwrap();

    let results = executor.recover_incomplete().await.unwrap();

    let mut recovered: Vec<RunId> = results.iter().map(|(id, _)| *id).collect();
    recovered.sort_by_key(|id| id.to_string());
    let mut expected = vec![first, second];
    expected.sort_by_key(|id| id.to_string());
    assert_eq!(recovered, expected);
    for (_, result) in results {
        assert_eq!(result.unwrap().status, RunStatus::Completed);
    }
    assert!(store.list_incomplete().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_client_trait_reports_status() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let steps = vec![
        ScriptedStep::new("a", &log),
        ScriptedStep::new("b", &log).failing([ErrorKind::BusinessRule]),
    ];
    let executor = executor_with(&store, steps, fast_retry(3));
    let client: &dyn SagaClient<Trail> = &executor;

    let run_id = client.start(SAGA, Vec::new()).await.unwrap();
    let pending = client.get_status(run_id).await.unwrap();
    assert_eq!(pending.status, RunStatus::Pending);
    assert_eq!(pending.saga_name, SAGA);

    client.resume(run_id).await.unwrap();
    let report = client.get_status(run_id).await.unwrap();
    assert_eq!(report.status, RunStatus::RolledBack);
    assert_eq!(report.step_index, 1);
    assert!(report.completed_steps.is_empty());
    assert_eq!(report.failure.unwrap().step, "b");
    assert!(report.compensation_failure.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_backoff_delays_between_attempts() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let steps = vec![ScriptedStep::new("a", &log).failing([ErrorKind::Unavailable; 2])];
    // Default policy: 100ms, then 200ms.
    let executor = executor_with(&store, steps, RetryPolicy::default());

    let run_id = executor.start(SAGA, Vec::new()).await.unwrap();
    let started = tokio::time::Instant::now();
    let outcome = executor.resume(run_id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn test_long_step_keeps_its_lease() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let gate = Gate::default();
    let holder = executor_owned_by(
        &store,
        vec![ScriptedStep::new("a", &log).gated(&gate)],
        fast_retry(3),
        ExecutorConfig {
            owner_id: "holder".to_string(),
            lease_ttl: Duration::from_millis(20),
        },
    );
    let other = executor_with(&store, vec![ScriptedStep::new("a", &log)], fast_retry(3));

    let run_id = holder.start(SAGA, Vec::new()).await.unwrap();
    let first = holder.spawn(run_id);
    gate.entered.notified().await;

    // Held well past the TTL; the heartbeat must keep the lease alive.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(store.lease_owner(run_id).await.as_deref(), Some("holder"));
    let result = other.resume(run_id).await;
    assert!(matches!(result, Err(SagaError::RunAlreadyActive(_))));

    gate.release.notify_one();
    assert_eq!(first.await.unwrap().unwrap().status, RunStatus::Completed);
    assert_eq!(log.count("execute:a"), 1);
}

#[tokio::test]
async fn test_lost_lease_stops_the_run_without_writing() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let gate = Gate::default();
    let holder = executor_owned_by(
        &store,
        vec![
            ScriptedStep::new("a", &log).gated(&gate),
            ScriptedStep::new("b", &log),
        ],
        fast_retry(3),
        ExecutorConfig {
            owner_id: "holder".to_string(),
            lease_ttl: Duration::from_secs(30),
        },
    );

    let run_id = holder.start(SAGA, Vec::new()).await.unwrap();
    let first = holder.spawn(run_id);
    gate.entered.notified().await;

    // Another process takes the run over while step a is in flight.
    store.release_lease(run_id, "holder").await.unwrap();
    assert!(
        store
            .acquire_lease(run_id, "intruder", Duration::from_secs(60))
            .await
            .unwrap()
    );
    gate.release.notify_one();

    let result = first.await.unwrap();
    assert!(matches!(result, Err(SagaError::RunAlreadyActive(id)) if id == run_id));
    assert_eq!(log.entries(), vec!["execute:a"]);

    let record = store.load(run_id).await.unwrap();
    assert_eq!(record.step_index, 0);
    assert_eq!(record.steps[0].status, StepStatus::Pending);
    assert_eq!(record.context, serde_json::json!([]));
    assert_eq!(store.lease_owner(run_id).await.as_deref(), Some("intruder"));
    assert!(!holder.active_runs().is_held(run_id).await);
}

#[tokio::test]
async fn test_spent_budget_survives_a_failed_rollback_checkpoint() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let crash = {
        let store = store.clone();
        let calls = Arc::clone(&calls);
        // On the last attempt: its failure is saved, the rollback start is not.
        move || {
            if calls.fetch_add(1, Ordering::SeqCst) == 2 {
                store.fail_after_saves(1);
            }
        }
    };
    let steps = vec![
        ScriptedStep::new("a", &log)
            .on_execute(crash)
            .failing([ErrorKind::Network; 4]),
    ];
    let executor = executor_with(&store, steps, fast_retry(3));

    let run_id = executor.start(SAGA, Vec::new()).await.unwrap();
    let result = executor.resume(run_id).await;
    assert!(matches!(result, Err(SagaError::Persistence(_))));

    let record = store.load(run_id).await.unwrap();
    assert_eq!(record.status, RunStatus::Running);
    assert_eq!(record.steps[0].attempts, 3);
    assert_eq!(record.steps[0].status, StepStatus::Pending);

    store.set_fail_on_save(false);
    let outcome = executor.resume(run_id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::RolledBack);
    assert_eq!(log.count("execute:a"), 3);
    assert_eq!(outcome.failure.unwrap().attempts, 3);
}

#[tokio::test]
async fn test_recover_incomplete_keeps_store_order() {
    let store = InMemoryRunStore::new();
    let log = CallLog::default();
    let executor = executor_with(&store, three_steps(&log), fast_retry(3));

    for _ in 0..4 {
        executor.start(SAGA, Vec::new()).await.unwrap();
    }
    let listed = store.list_incomplete().await.unwrap();

    let results = executor.recover_incomplete().await.unwrap();
    let recovered: Vec<RunId> = results.iter().map(|(id, _)| *id).collect();
    assert_eq!(recovered, listed);
}
