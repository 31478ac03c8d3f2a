//! The caller-facing saga API.
//!
//! Callers start runs, drive or recover them, read their status and ask
//! for cancellation. They never set step indices or statuses themselves.

use async_trait::async_trait;
use common::RunId;
use run_store::RunStore;

use crate::error::Result;
use crate::executor::{RunOutcome, RunReport, SagaExecutor};
use crate::step::SagaContext;

/// Entry points exposed to workflows that use sagas.
#[async_trait]
pub trait SagaClient<C: SagaContext>: Send + Sync {
    /// Creates a pending run of the named saga and returns its id.
    async fn start(&self, saga_name: &str, context: C) -> Result<RunId>;

    /// Drives a run to a terminal status and returns it with its context.
    async fn resume(&self, run_id: RunId) -> Result<RunOutcome<C>>;

    /// Returns the current status of a run and, on failure, why.
    async fn get_status(&self, run_id: RunId) -> Result<RunReport>;

    /// Requests cancellation; observed at the next step boundary.
    async fn cancel(&self, run_id: RunId) -> Result<()>;
}

#[async_trait]
impl<C, S> SagaClient<C> for SagaExecutor<C, S>
where
    C: SagaContext,
    S: RunStore + Clone + 'static,
{
    async fn start(&self, saga_name: &str, context: C) -> Result<RunId> {
        SagaExecutor::start(self, saga_name, context).await
    }

    async fn resume(&self, run_id: RunId) -> Result<RunOutcome<C>> {
        SagaExecutor::resume(self, run_id).await
    }

    async fn get_status(&self, run_id: RunId) -> Result<RunReport> {
        SagaExecutor::get_status(self, run_id).await
    }

    async fn cancel(&self, run_id: RunId) -> Result<()> {
        SagaExecutor::cancel(self, run_id).await
    }
}
