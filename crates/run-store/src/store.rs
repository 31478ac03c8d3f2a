use std::time::Duration;

use async_trait::async_trait;

use crate::{Result, RunId, RunRecord};

/// Core trait for run record storage.
///
/// Implementations must be thread-safe (Send + Sync). The context inside a
/// record is an opaque JSON blob; stores never interpret it.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Saves a record, fully replacing any previous record for the same run.
    ///
    /// Last write wins. Cancellation flags and leases are kept apart from
    /// the record and are never touched by `save`.
    async fn save(&self, record: &RunRecord) -> Result<()>;

    /// Saves a record only while `owner` holds a live lease on the run.
    ///
    /// Returns false, writing nothing, if the lease expired, was released,
    /// or belongs to someone else.
    async fn save_if_owner(&self, record: &RunRecord, owner: &str) -> Result<bool>;

    /// Loads the record for a run.
    ///
    /// Fails with `RunNotFound` if no record exists.
    async fn load(&self, run_id: RunId) -> Result<RunRecord>;

    /// Lists runs that have not reached a terminal status, oldest first.
    async fn list_incomplete(&self) -> Result<Vec<RunId>>;

    /// Flags a run for cancellation.
    ///
    /// The executor observes the flag at the next step boundary.
    async fn request_cancellation(&self, run_id: RunId) -> Result<()>;

    /// Returns true if cancellation was requested for a run.
    async fn is_cancellation_requested(&self, run_id: RunId) -> Result<bool>;

    /// Tries to take the exclusive lease on a run for `ttl`.
    ///
    /// Succeeds if the run is unleased, already leased by `owner` (which
    /// renews it), or the previous lease has expired. Returns false if
    /// another owner holds a live lease.
    async fn acquire_lease(&self, run_id: RunId, owner: &str, ttl: Duration) -> Result<bool>;

    /// Extends a live lease held by `owner` to `ttl` from now.
    ///
    /// Unlike `acquire_lease`, never takes a released or expired lease.
    /// Returns false if `owner` no longer holds a live lease.
    async fn renew_lease(&self, run_id: RunId, owner: &str, ttl: Duration) -> Result<bool>;

    /// Releases a lease held by `owner`. Releasing a lease held by someone
    /// else, or no lease at all, is a no-op.
    async fn release_lease(&self, run_id: RunId, owner: &str) -> Result<()>;
}
