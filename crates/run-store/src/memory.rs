use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::{Result, RunId, RunRecord, RunStoreError, store::RunStore};

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

/// In-memory run store implementation for testing and single-process use.
///
/// Provides the same interface as the PostgreSQL implementation. Saves can
/// be made to fail on demand to exercise persistence-error and crash paths.
#[derive(Clone, Default)]
pub struct InMemoryRunStore {
    records: Arc<RwLock<HashMap<RunId, RunRecord>>>,
    cancellations: Arc<RwLock<HashSet<RunId>>>,
    leases: Arc<RwLock<HashMap<RunId, Lease>>>,
    fail_on_save: Arc<AtomicBool>,
    saves_before_failure: Arc<Mutex<Option<usize>>>,
    save_count: Arc<AtomicUsize>,
}

impl InMemoryRunStore {
    /// Creates a new empty in-memory run store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `save` fail with `Unavailable` until reset.
    pub fn set_fail_on_save(&self, fail: bool) {
        self.fail_on_save.store(fail, Ordering::SeqCst);
    }

    /// Lets the next `saves` writes through, then fails every later one as
    /// `set_fail_on_save(true)` would.
    pub fn fail_after_saves(&self, saves: usize) {
        *self
            .saves_before_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(saves);
    }

    /// Returns the number of successful saves since creation.
    pub fn save_count(&self) -> usize {
        self.save_count.load(Ordering::SeqCst)
    }

    /// Returns the total number of records stored.
    pub async fn run_count(&self) -> usize {
        self.records.read().await.len()
    }

    /// Returns the current lease owner of a run, if the lease is live.
    pub async fn lease_owner(&self, run_id: RunId) -> Option<String> {
        let leases = self.leases.read().await;
        leases
            .get(&run_id)
            .filter(|lease| lease.expires_at > Instant::now())
            .map(|lease| lease.owner.clone())
    }

    /// Clears all records, flags and leases.
    pub async fn clear(&self) {
        self.records.write().await.clear();
        self.cancellations.write().await.clear();
        self.leases.write().await.clear();
    }

    fn check_writable(&self) -> Result<()> {
        let mut countdown = self
            .saves_before_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(left) = countdown.as_mut() {
            if *left == 0 {
                *countdown = None;
                self.fail_on_save.store(true, Ordering::SeqCst);
            } else {
                *left -= 1;
            }
        }

        if self.fail_on_save.load(Ordering::SeqCst) {
            return Err(RunStoreError::Unavailable(
                "in-memory store configured to fail".to_string(),
            ));
        }
        Ok(())
    }

    fn holds_lease(leases: &HashMap<RunId, Lease>, run_id: RunId, owner: &str) -> bool {
        leases
            .get(&run_id)
            .is_some_and(|lease| lease.owner == owner && lease.expires_at > Instant::now())
    }

    async fn ensure_exists(&self, run_id: RunId) -> Result<()> {
        if self.records.read().await.contains_key(&run_id) {
            Ok(())
        } else {
            Err(RunStoreError::RunNotFound(run_id))
        }
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save(&self, record: &RunRecord) -> Result<()> {
        self.check_writable()?;

        self.records
            .write()
            .await
            .insert(record.run_id, record.clone());
        self.save_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn save_if_owner(&self, record: &RunRecord, owner: &str) -> Result<bool> {
        let leases = self.leases.read().await;
        if !Self::holds_lease(&leases, record.run_id, owner) {
            return Ok(false);
        }
        self.check_writable()?;

        self.records
            .write()
            .await
            .insert(record.run_id, record.clone());
        self.save_count.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn load(&self, run_id: RunId) -> Result<RunRecord> {
        self.records
            .read()
            .await
            .get(&run_id)
            .cloned()
            .ok_or(RunStoreError::RunNotFound(run_id))
    }

    async fn list_incomplete(&self) -> Result<Vec<RunId>> {
        let records = self.records.read().await;
        let mut incomplete: Vec<_> = records
            .values()
            .filter(|r| !r.is_terminal())
            .map(|r| (r.created_at, r.run_id))
            .collect();
        incomplete.sort();
        Ok(incomplete.into_iter().map(|(_, id)| id).collect())
    }

    async fn request_cancellation(&self, run_id: RunId) -> Result<()> {
        self.ensure_exists(run_id).await?;
        self.cancellations.write().await.insert(run_id);
        Ok(())
    }

    async fn is_cancellation_requested(&self, run_id: RunId) -> Result<bool> {
        Ok(self.cancellations.read().await.contains(&run_id))
    }

    async fn acquire_lease(&self, run_id: RunId, owner: &str, ttl: Duration) -> Result<bool> {
        self.ensure_exists(run_id).await?;

        let mut leases = self.leases.write().await;
        let now = Instant::now();

        if let Some(existing) = leases.get(&run_id)
            && existing.owner != owner
            && existing.expires_at > now
        {
            return Ok(false);
        }

        leases.insert(
            run_id,
            Lease {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn renew_lease(&self, run_id: RunId, owner: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.write().await;
        if !Self::holds_lease(&leases, run_id, owner) {
            return Ok(false);
        }
        leases.insert(
            run_id,
            Lease {
                owner: owner.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn release_lease(&self, run_id: RunId, owner: &str) -> Result<()> {
        let mut leases = self.leases.write().await;
        if leases.get(&run_id).is_some_and(|lease| lease.owner == owner) {
            leases.remove(&run_id);
        }
        Ok(())
    }
}
