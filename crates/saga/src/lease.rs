//! Single-owner claims on runs.
//!
//! A run may be driven by at most one executor invocation at a time. The
//! claim is two-layered: a local set catches concurrent calls inside this
//! process without a store round trip, and a TTL lease in the run store
//! catches other processes. While a claim is held, a heartbeat task renews
//! the lease every third of the TTL, so a long step never outlives it. A
//! lease left behind by a crashed process expires after its TTL, so
//! recovery can take the run over.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::RunId;
use run_store::RunStore;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{Result, SagaError};

const MIN_HEARTBEAT: Duration = Duration::from_millis(1);

/// A claim on one run, held for as long as this value lives.
///
/// Dropping the claim stops its heartbeat; the store lease then lapses
/// after the TTL unless it is released first.
pub struct Claim {
    run_id: RunId,
    lost: watch::Receiver<bool>,
    heartbeat: JoinHandle<()>,
}

impl Claim {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Returns true once the heartbeat has failed to keep the lease.
    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    /// Resolves when the lease is lost. Never resolves otherwise.
    pub async fn lost(&self) {
        let mut lost = self.lost.clone();
        if lost.wait_for(|lost| *lost).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

impl std::fmt::Debug for Claim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Claim")
            .field("run_id", &self.run_id)
            .field("lost", &self.is_lost())
            .finish()
    }
}

/// Runs currently held by this process.
pub struct ActiveRuns<S: RunStore> {
    store: S,
    owner: String,
    ttl: Duration,
    held: Arc<Mutex<HashSet<RunId>>>,
}

impl<S: RunStore + Clone> Clone for ActiveRuns<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            owner: self.owner.clone(),
            ttl: self.ttl,
            held: Arc::clone(&self.held),
        }
    }
}

impl<S: RunStore + Clone + 'static> ActiveRuns<S> {
    /// Claims a run for this process and starts renewing its lease.
    ///
    /// Fails with `RunAlreadyActive` if the run is already held here or
    /// another owner holds a live lease on it.
    pub async fn claim(&self, run_id: RunId) -> Result<Claim> {
        if !self.held.lock().await.insert(run_id) {
            return Err(SagaError::RunAlreadyActive(run_id));
        }

        match self.store.acquire_lease(run_id, &self.owner, self.ttl).await {
            Ok(true) => {
                tracing::debug!(%run_id, owner = %self.owner, "Lease acquired");
                let (lost_tx, lost_rx) = watch::channel(false);
                let heartbeat = tokio::spawn(heartbeat(
                    self.store.clone(),
                    run_id,
                    self.owner.clone(),
                    self.ttl,
                    lost_tx,
                ));
                Ok(Claim {
                    run_id,
                    lost: lost_rx,
                    heartbeat,
                })
            }
            Ok(false) => {
                self.held.lock().await.remove(&run_id);
                Err(SagaError::RunAlreadyActive(run_id))
            }
            Err(e) => {
                self.held.lock().await.remove(&run_id);
                Err(e.into())
            }
        }
    }
}

impl<S: RunStore> ActiveRuns<S> {
    pub fn new(store: S, owner: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            owner: owner.into(),
            ttl,
            held: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Owner id written into store leases.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Lease time-to-live.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Extends the lease behind a claim.
    ///
    /// Fails with `RunAlreadyActive` if the lease was lost in the meantime,
    /// either to another owner or by lapsing.
    pub async fn renew(&self, claim: &Claim) -> Result<()> {
        let run_id = claim.run_id;
        if !claim.is_lost() && self.store.renew_lease(run_id, &self.owner, self.ttl).await? {
            Ok(())
        } else {
            tracing::warn!(%run_id, owner = %self.owner, "Lease lost");
            Err(SagaError::RunAlreadyActive(run_id))
        }
    }

    /// Gives up a claim.
    ///
    /// A failure to release the store lease is logged; the lease then lapses
    /// on its own after the TTL.
    pub async fn release(&self, claim: Claim) {
        let run_id = claim.run_id;
        drop(claim);
        self.held.lock().await.remove(&run_id);
        if let Err(e) = self.store.release_lease(run_id, &self.owner).await {
            tracing::warn!(%run_id, error = %e, "Failed to release lease");
        }
    }

    /// Returns true if this process holds the run.
    pub async fn is_held(&self, run_id: RunId) -> bool {
        self.held.lock().await.contains(&run_id)
    }

    /// Runs held by this process.
    pub async fn held_runs(&self) -> Vec<RunId> {
        self.held.lock().await.iter().copied().collect()
    }

    /// Releases every lease still held, for graceful shutdown.
    ///
    /// Claims still alive elsewhere see their next renewal fail.
    pub async fn shutdown(&self) {
        let held: Vec<RunId> = self.held.lock().await.drain().collect();
        for run_id in held {
            if let Err(e) = self.store.release_lease(run_id, &self.owner).await {
                tracing::warn!(%run_id, error = %e, "Failed to release lease on shutdown");
            }
        }
    }
}

/// Renews a lease until renewal fails, then flags the claim as lost.
///
/// Store errors are tolerated until the lease would have expired.
async fn heartbeat<S: RunStore>(
    store: S,
    run_id: RunId,
    owner: String,
    ttl: Duration,
    lost: watch::Sender<bool>,
) {
    let period = (ttl / 3).max(MIN_HEARTBEAT);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut renewed_at = Instant::now();

    loop {
        ticker.tick().await;
        match store.renew_lease(run_id, &owner, ttl).await {
            Ok(true) => renewed_at = Instant::now(),
            Ok(false) => {
                tracing::warn!(%run_id, %owner, "Lease lost during heartbeat");
                break;
            }
            Err(e) if renewed_at.elapsed() < ttl => {
                tracing::warn!(%run_id, error = %e, "Lease renewal failed, retrying");
            }
            Err(e) => {
                tracing::error!(%run_id, error = %e, "Lease lapsed while the store was unreachable");
                break;
            }
        }
    }
    lost.send_replace(true);
}
