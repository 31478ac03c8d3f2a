use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{Result, RunId, RunRecord, RunStatus, RunStoreError, store::RunStore};

const RECORD_COLUMNS: &str = "run_id, saga_name, status, step_index, steps, context, failure, \
     compensation_failure, journal, created_at, updated_at";

/// PostgreSQL-backed run store implementation.
///
/// Records live in the `saga_runs` table. The cancellation flag and the
/// lease columns are only written by their dedicated methods, never by
/// `save`. `save_if_owner` is an update guarded by the lease columns.
#[derive(Clone)]
pub struct PostgresRunStore {
    pool: PgPool,
}

impl PostgresRunStore {
    /// Creates a new PostgreSQL run store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to the database at `url` and creates a store on that pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::new(pool))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_record(row: PgRow) -> Result<RunRecord> {
        let status: String = row.try_get("status")?;
        let step_index: i64 = row.try_get("step_index")?;
        let step_index = usize::try_from(step_index).map_err(|_| {
            RunStoreError::InvalidRecord(format!("negative step index {step_index}"))
        })?;

        Ok(RunRecord {
            run_id: RunId::from_uuid(row.try_get::<Uuid, _>("run_id")?),
            saga_name: row.try_get("saga_name")?,
            step_index,
            steps: serde_json::from_value(row.try_get("steps")?)?,
            context: row.try_get("context")?,
            status: status.parse::<RunStatus>()?,
            failure: optional_json(row.try_get("failure")?)?,
            compensation_failure: optional_json(row.try_get("compensation_failure")?)?,
            journal: serde_json::from_value(row.try_get("journal")?)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn ensure_exists(&self, run_id: RunId) -> Result<()> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM saga_runs WHERE run_id = $1)")
                .bind(run_id.as_uuid())
                .fetch_one(&self.pool)
                .await?;

        if exists {
            Ok(())
        } else {
            Err(RunStoreError::RunNotFound(run_id))
        }
    }
}

/// JSONB columns of a record, serialized once per write.
struct EncodedRecord {
    steps: serde_json::Value,
    failure: Option<serde_json::Value>,
    compensation_failure: Option<serde_json::Value>,
    journal: serde_json::Value,
}

impl EncodedRecord {
    fn new(record: &RunRecord) -> Result<Self> {
        Ok(Self {
            steps: serde_json::to_value(&record.steps)?,
            failure: record
                .failure
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
            compensation_failure: record
                .compensation_failure
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?,
            journal: serde_json::to_value(&record.journal)?,
        })
    }
}

fn optional_json<T: serde::de::DeserializeOwned>(
    value: Option<serde_json::Value>,
) -> Result<Option<T>> {
    value
        .map(serde_json::from_value)
        .transpose()
        .map_err(RunStoreError::from)
}

#[async_trait]
impl RunStore for PostgresRunStore {
    async fn save(&self, record: &RunRecord) -> Result<()> {
        let encoded = EncodedRecord::new(record)?;

        sqlx::query(
            r#"
            INSERT INTO saga_runs (run_id, saga_name, status, step_index, steps, context, failure,
                                   compensation_failure, journal, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (run_id) DO UPDATE SET
                saga_name = EXCLUDED.saga_name,
                status = EXCLUDED.status,
                step_index = EXCLUDED.step_index,
                steps = EXCLUDED.steps,
                context = EXCLUDED.context,
                failure = EXCLUDED.failure,
                compensation_failure = EXCLUDED.compensation_failure,
                journal = EXCLUDED.journal,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(record.run_id.as_uuid())
        .bind(&record.saga_name)
        .bind(record.status.as_str())
        .bind(record.step_index as i64)
        .bind(encoded.steps)
        .bind(&record.context)
        .bind(encoded.failure)
        .bind(encoded.compensation_failure)
        .bind(encoded.journal)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        metrics::counter!("run_store_saves_total", "backend" => "postgres").increment(1);
        Ok(())
    }

    async fn save_if_owner(&self, record: &RunRecord, owner: &str) -> Result<bool> {
        let encoded = EncodedRecord::new(record)?;

        let result = sqlx::query(
            r#"
            UPDATE saga_runs
            SET saga_name = $2,
                status = $3,
                step_index = $4,
                steps = $5,
                context = $6,
                failure = $7,
                compensation_failure = $8,
                journal = $9,
                updated_at = $10
            WHERE run_id = $1
              AND lease_owner = $11
              AND lease_expires_at > NOW()
            "#,
        )
        .bind(record.run_id.as_uuid())
        .bind(&record.saga_name)
        .bind(record.status.as_str())
        .bind(record.step_index as i64)
        .bind(encoded.steps)
        .bind(&record.context)
        .bind(encoded.failure)
        .bind(encoded.compensation_failure)
        .bind(encoded.journal)
        .bind(record.updated_at)
        .bind(owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(run_id = %record.run_id, owner, "checkpoint refused, lease not held");
            return Ok(false);
        }
        metrics::counter!("run_store_saves_total", "backend" => "postgres").increment(1);
        Ok(true)
    }

    async fn load(&self, run_id: RunId) -> Result<RunRecord> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM saga_runs WHERE run_id = $1");
        let row: Option<PgRow> = sqlx::query(&sql)
            .bind(run_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Self::row_to_record(row),
            None => Err(RunStoreError::RunNotFound(run_id)),
        }
    }

    async fn list_incomplete(&self) -> Result<Vec<RunId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT run_id
            FROM saga_runs
            WHERE status NOT IN ('Completed', 'RolledBack', 'CompensationFailed')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(RunId::from_uuid).collect())
    }

    async fn request_cancellation(&self, run_id: RunId) -> Result<()> {
        let result = sqlx::query("UPDATE saga_runs SET cancel_requested = TRUE WHERE run_id = $1")
            .bind(run_id.as_uuid())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RunStoreError::RunNotFound(run_id));
        }
        Ok(())
    }

    async fn is_cancellation_requested(&self, run_id: RunId) -> Result<bool> {
        let flag: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM saga_runs WHERE run_id = $1")
                .bind(run_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;

        Ok(flag.unwrap_or(false))
    }

    async fn acquire_lease(&self, run_id: RunId, owner: &str, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE saga_runs
            SET lease_owner = $2,
                lease_expires_at = NOW() + make_interval(secs => $3)
            WHERE run_id = $1
              AND (lease_owner IS NULL OR lease_owner = $2 OR lease_expires_at < NOW())
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        self.ensure_exists(run_id).await?;
        tracing::debug!(%run_id, owner, "lease held by another owner");
        Ok(false)
    }

    async fn renew_lease(&self, run_id: RunId, owner: &str, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE saga_runs
            SET lease_expires_at = NOW() + make_interval(secs => $3)
            WHERE run_id = $1
              AND lease_owner = $2
              AND lease_expires_at > NOW()
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, run_id: RunId, owner: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE saga_runs
            SET lease_owner = NULL, lease_expires_at = NULL
            WHERE run_id = $1 AND lease_owner = $2
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(owner)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
