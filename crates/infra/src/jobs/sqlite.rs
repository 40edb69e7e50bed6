//! SQLite-backed job store.
//!
//! The `jobs` table is the whole queue. Claiming is a single
//! `UPDATE ... WHERE id = (SELECT ...) RETURNING` statement: SQLite takes the
//! database write lock before evaluating the sub-select, so two connections can
//! never lease the same row, and no row lock or status column is needed.
//!
//! The current time is always bound from the store's [`Clock`] rather than read
//! inside SQL, which keeps lease arithmetic testable.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, instrument};

use courier_core::{Clock, Job, JobId, PayloadMap, SystemClock};

use super::store::{JobStore, JobStoreError, validate_enqueue};
use crate::db::{Database, begin_write, timestamp_from_millis};

const CLAIM_SQL: &str = r#"
    UPDATE jobs
    SET received = ?1
    WHERE id = (
        SELECT id
        FROM jobs
        WHERE run <= ?1
          AND (received IS NULL OR received + (timeout + 999999) / 1000000 <= ?1)
        ORDER BY created, id
        LIMIT 1
    )
    RETURNING id, name, payload, timeout, run, created, received
"#;

/// Job store persisted in the `jobs` table.
///
/// Cheap to clone; clones share the pool and clock.
#[derive(Debug, Clone)]
pub struct SqliteJobStore<C: Clock = SystemClock> {
    pool: SqlitePool,
    clock: C,
}

impl SqliteJobStore<SystemClock> {
    pub fn new(db: &Database) -> Self {
        Self::with_clock(db, SystemClock)
    }
}

impl<C: Clock> SqliteJobStore<C> {
    pub fn with_clock(db: &Database, clock: C) -> Self {
        Self {
            pool: db.pool().clone(),
            clock,
        }
    }

    /// Enqueue inside the caller's transaction.
    ///
    /// The job becomes visible to runners only if the transaction commits, so
    /// domain writes and the jobs they trigger commit or roll back together.
    pub async fn enqueue_in(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
        payload: &PayloadMap,
        timeout: Duration,
    ) -> Result<JobId, JobStoreError> {
        self.enqueue_for_later_in(conn, name, payload, timeout, Duration::ZERO)
            .await
    }

    /// Delayed variant of [`SqliteJobStore::enqueue_in`].
    #[instrument(skip(self, conn, payload), fields(job_name = %name), err)]
    pub async fn enqueue_for_later_in(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
        payload: &PayloadMap,
        timeout: Duration,
        after: Duration,
    ) -> Result<JobId, JobStoreError> {
        let times = validate_enqueue(name, timeout, after)?;
        let now = self.clock.now();
        let run = now
            .checked_add_signed(times.after)
            .ok_or_else(|| JobStoreError::InvalidJob(format!("delay {after:?} is too large")))?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (name, payload, timeout, run, created)
            VALUES (?1, ?2, ?3, ?4, ?5)
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(payload.to_json()?)
        .bind(times.timeout_nanos)
        .bind(run.timestamp_millis())
        .bind(now.timestamp_millis())
        .fetch_one(&mut *conn)
        .await?;

        debug!(job_id = id, run = %run, "job enqueued");
        Ok(JobId::new(id))
    }

    /// Fetch a job without claiming it.
    pub async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, payload, timeout, run, created, received
            FROM jobs
            WHERE id = ?1
            "#,
        )
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    /// Number of stored jobs, claimed or not.
    pub async fn count(&self) -> Result<i64, JobStoreError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl<C: Clock + 'static> JobStore for SqliteJobStore<C> {
    async fn enqueue_for_later(
        &self,
        name: &str,
        payload: &PayloadMap,
        timeout: Duration,
        after: Duration,
    ) -> Result<(), JobStoreError> {
        let mut tx = begin_write(&self.pool).await?;
        self.enqueue_for_later_in(&mut tx, name, payload, timeout, after)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn claim(&self) -> Result<Option<Job>, JobStoreError> {
        let now = self.clock.now().timestamp_millis();
        let row = sqlx::query(CLAIM_SQL)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, id: JobId) -> Result<(), JobStoreError> {
        sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(id.get())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn job_from_row(row: &SqliteRow) -> Result<Job, JobStoreError> {
    let id = JobId::new(row.try_get("id")?);
    let corrupt = |reason: String| JobStoreError::Corrupt { id, reason };

    let payload: String = row.try_get("payload")?;
    let payload = PayloadMap::from_json(&payload).map_err(|e| corrupt(e.to_string()))?;

    let timeout: i64 = row.try_get("timeout")?;
    let timeout = u64::try_from(timeout)
        .map(Duration::from_nanos)
        .map_err(|_| corrupt(format!("negative timeout {timeout}")))?;

    let run = timestamp_from_millis("run", row.try_get("run")?).map_err(corrupt)?;
    let created = timestamp_from_millis("created", row.try_get("created")?).map_err(corrupt)?;
    let received = row
        .try_get::<Option<i64>, _>("received")?
        .map(|ms| timestamp_from_millis("received", ms))
        .transpose()
        .map_err(corrupt)?;

    Ok(Job {
        id,
        name: row.try_get("name")?,
        payload,
        timeout,
        run,
        created,
        received,
    })
}
