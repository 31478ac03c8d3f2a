//! Saga worker host.
//!
//! Wires configuration, logging and the Prometheus exporter around a
//! [`SagaExecutor`] running the order fulfillment saga. The [`Worker`] sweeps
//! the run store for incomplete runs until shutdown, then releases its leases.

pub mod config;
pub mod error;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use run_store::{RunId, RunStore};
use saga::order_fulfillment::{self, OrderContext};
use saga::{
    DefinitionRegistry, InMemoryInventoryService, InMemoryPaymentService,
    InMemoryShippingService, RunOutcome, RunStatus, SagaError, SagaExecutor,
};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub use config::{Config, LogFormat};
pub use error::{OrchestratorError, Result};

/// Installs the global tracing subscriber.
pub fn init_tracing(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.log_format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };
    installed.map_err(|e| OrchestratorError::Tracing(e.to_string()))
}

/// Installs the Prometheus recorder with its scrape listener on
/// `config.metrics_addr`. Must be called inside a tokio runtime.
pub fn install_metrics(config: &Config) -> Result<()> {
    let addr: SocketAddr = config.metrics_addr.parse().map_err(|e| {
        OrchestratorError::Config(format!("METRICS_ADDR {:?}: {e}", config.metrics_addr))
    })?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(%addr, "Prometheus exporter listening");
    Ok(())
}

/// Builds the registry holding the order fulfillment saga over in-memory
/// service adapters.
pub fn order_fulfillment_registry(config: &Config) -> Result<DefinitionRegistry<OrderContext>> {
    let definition = order_fulfillment::definition(
        Arc::new(InMemoryInventoryService::new()),
        Arc::new(InMemoryPaymentService::new()),
        Arc::new(InMemoryShippingService::new()),
        config.retry_policy()?,
    )?;
    Ok(DefinitionRegistry::new().with(definition)?)
}

/// Tally of run outcomes across one or more recovery sweeps.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoverySummary {
    pub completed: usize,
    pub rolled_back: usize,
    pub compensation_failed: usize,
    /// Runs another executor was driving.
    pub busy: usize,
    pub errors: usize,
}

impl RecoverySummary {
    /// Counts the results of one [`SagaExecutor::recover_incomplete`] call.
    pub fn from_results<C>(results: &[(RunId, saga::Result<RunOutcome<C>>)]) -> Self {
        let mut summary = Self::default();
        for (run_id, result) in results {
            match result {
                Ok(outcome) => match outcome.status {
                    RunStatus::Completed => summary.completed += 1,
                    RunStatus::RolledBack => summary.rolled_back += 1,
                    RunStatus::CompensationFailed => summary.compensation_failed += 1,
                    status => {
                        tracing::warn!(%run_id, %status, "Run stopped in a non-terminal state");
                        summary.errors += 1;
                    }
                },
                Err(SagaError::RunAlreadyActive(_)) => summary.busy += 1,
                Err(e) => {
                    tracing::warn!(%run_id, error = %e, "Run could not be recovered");
                    summary.errors += 1;
                }
            }
        }
        summary
    }

    /// Number of runs looked at.
    pub fn total(&self) -> usize {
        self.completed + self.rolled_back + self.compensation_failed + self.busy + self.errors
    }

    fn add(&mut self, other: RecoverySummary) {
        self.completed += other.completed;
        self.rolled_back += other.rolled_back;
        self.compensation_failed += other.compensation_failed;
        self.busy += other.busy;
        self.errors += other.errors;
    }
}

/// Drives incomplete runs found in the store, one sweep per interval.
pub struct Worker<S: RunStore> {
    executor: SagaExecutor<OrderContext, S>,
    interval: Duration,
}

impl<S: RunStore + Clone + 'static> Worker<S> {
    pub fn new(store: S, config: &Config) -> Result<Self> {
        Ok(Self::with_registry(
            store,
            order_fulfillment_registry(config)?,
            config,
        ))
    }

    /// Builds a worker over a caller-supplied set of definitions.
    pub fn with_registry(
        store: S,
        registry: DefinitionRegistry<OrderContext>,
        config: &Config,
    ) -> Self {
        let executor = SagaExecutor::new(store, registry, config.executor_config());
        tracing::info!(
            owner = executor.active_runs().owner(),
            interval_secs = config.recovery_interval.as_secs(),
            "Worker ready"
        );
        Self {
            executor,
            interval: config.recovery_interval,
        }
    }

    pub fn executor(&self) -> &SagaExecutor<OrderContext, S> {
        &self.executor
    }

    /// Resumes every incomplete run once and waits for all of them.
    pub async fn sweep(&self) -> Result<RecoverySummary> {
        let results = self.executor.recover_incomplete().await?;
        let summary = RecoverySummary::from_results(&results);
        if summary.total() > 0 {
            tracing::info!(
                completed = summary.completed,
                rolled_back = summary.rolled_back,
                compensation_failed = summary.compensation_failed,
                busy = summary.busy,
                errors = summary.errors,
                "Recovery sweep finished"
            );
        }
        Ok(summary)
    }

    /// Sweeps until `shutdown` resolves, then releases every held lease.
    ///
    /// A sweep in flight at shutdown is dropped, which aborts its runs at
    /// their current await point. Their leases are released only after that,
    /// and the runs resume from their last checkpoint on the next start.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> RecoverySummary {
        tokio::pin!(shutdown);
        let mut total = RecoverySummary::default();

        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => break,
                swept = self.sweep() => match swept {
                    Ok(summary) => total.add(summary),
                    Err(e) => tracing::error!(error = %e, "Recovery sweep failed"),
                },
            }

            tokio::select! {
                biased;
                () = &mut shutdown => break,
                () = tokio::time::sleep(self.interval) => {}
            }
        }

        tracing::info!("Shutting down, releasing run leases");
        self.executor.active_runs().shutdown().await;
        total
    }
}
