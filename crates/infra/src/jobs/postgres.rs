//! Postgres-backed job store.
//!
//! Every conditional write is a single `UPDATE … WHERE` on the job row, so the
//! claim/ownership rules hold across processes sharing one database.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) on insert | `23505` | `AlreadyExists` |
//! | Any other database error | Any | `Storage` |
//! | PoolClosed / network / decode | N/A | `Storage` |

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use docpipe_core::{ErrorKind, JobError, JobId, OwnerToken};

use super::query::{JobFilter, JobPage, Pagination};
use super::store::{ClaimOutcome, JobStats, JobStore, JobStoreError};
use super::types::{Job, JobKind, JobStatus, SubJobDependency};

const JOB_COLUMNS: &str = "id, kind, payload_ref, status, current_stage, progress_percent, \
     error_kind, error_message, parent_job_id, dependency, batch_cursor, sub_job_ids, owner, \
     resume_attempts, cancel_requested, waiting_on_sub_jobs, created_at, updated_at, \
     last_heartbeat_at";

/// Postgres-backed job store over the `pipeline_jobs` table.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn fetch(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM pipeline_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(|r| decode_job(&r)).transpose()
    }

    async fn fetch_many(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(decode_job).collect()
    }

    /// Distinguish "no such job" from "condition not met" after a zero-row update.
    async fn require_exists(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        self.fetch(job_id)
            .await?
            .ok_or(JobStoreError::NotFound(job_id))
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, kind = %job.kind), err)]
    async fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
        let (error_kind, error_message) = split_error(job.error.as_ref());
        let result = sqlx::query(
            r#"
            INSERT INTO pipeline_jobs (
                id, kind, payload_ref, status, current_stage, progress_percent,
                error_kind, error_message, parent_job_id, dependency, batch_cursor,
                sub_job_ids, owner, resume_attempts, cancel_requested,
                waiting_on_sub_jobs, created_at, updated_at, last_heartbeat_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.kind.type_name())
        .bind(&job.payload_ref)
        .bind(job.status.as_str())
        .bind(job.current_stage.as_deref())
        .bind(i16::from(job.progress_percent))
        .bind(error_kind)
        .bind(error_message)
        .bind(job.parent_job_id.map(Uuid::from))
        .bind(job.dependency.as_str())
        .bind(job.batch_cursor.map(|c| c as i64))
        .bind(uuids(&job.sub_job_ids))
        .bind(job.owner.map(Uuid::from))
        .bind(job.resume_attempts as i32)
        .bind(job.cancel_requested)
        .bind(job.waiting_on_sub_jobs)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.last_heartbeat_at)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(job),
            Err(e) if is_unique_violation(&e) => Err(JobStoreError::AlreadyExists(job.id)),
            Err(e) => Err(map_sqlx_error("insert", e)),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.fetch(job_id).await
    }

    #[instrument(skip(self), fields(job_id = %job_id, owner = %owner), err)]
    async fn claim(
        &self,
        job_id: JobId,
        owner: OwnerToken,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<ClaimOutcome, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE pipeline_jobs
            SET status = 'running',
                owner = $2,
                waiting_on_sub_jobs = FALSE,
                updated_at = $3,
                last_heartbeat_at = $3
            WHERE id = $1
              AND (
                status = 'queued'
                OR (status = 'running'
                    AND (owner IS NULL OR COALESCE(last_heartbeat_at, updated_at) < $4))
              )
            RETURNING {JOB_COLUMNS}
            "#
        );
        let claimed = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(owner.as_uuid())
            .bind(now)
            .bind(stale_before)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;

        if let Some(row) = claimed {
            return Ok(ClaimOutcome::Claimed(decode_job(&row)?));
        }

        let job = self.require_exists(job_id).await?;
        if job.is_terminal() {
            Ok(ClaimOutcome::Terminal(job))
        } else {
            Ok(ClaimOutcome::Busy(job))
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status), err)]
    async fn save_owned(&self, job: &Job, owner: OwnerToken) -> Result<(), JobStoreError> {
        let (error_kind, error_message) = split_error(job.error.as_ref());
        let result = sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET status = $3,
                current_stage = $4,
                progress_percent = GREATEST(progress_percent, $5),
                error_kind = $6,
                error_message = $7,
                sub_job_ids = $8,
                owner = $9,
                waiting_on_sub_jobs = $10,
                updated_at = $11,
                last_heartbeat_at = GREATEST(last_heartbeat_at, $12)
            WHERE id = $1 AND owner = $2 AND status = 'running'
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(owner.as_uuid())
        .bind(job.status.as_str())
        .bind(job.current_stage.as_deref())
        .bind(i16::from(job.progress_percent))
        .bind(error_kind)
        .bind(error_message)
        .bind(uuids(&job.sub_job_ids))
        .bind(job.owner.map(Uuid::from))
        .bind(job.waiting_on_sub_jobs)
        .bind(job.updated_at)
        .bind(job.last_heartbeat_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_owned", e))?;

        if result.rows_affected() == 0 {
            self.require_exists(job.id).await?;
            return Err(JobStoreError::OwnershipLost(job.id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn heartbeat(
        &self,
        job_id: JobId,
        owner: OwnerToken,
        at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET last_heartbeat_at = $3
            WHERE id = $1 AND owner = $2 AND status = 'running'
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(owner.as_uuid())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("heartbeat", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn set_batch_cursor(
        &self,
        job_id: JobId,
        owner: OwnerToken,
        cursor: u64,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET batch_cursor = $3, updated_at = $4
            WHERE id = $1 AND owner = $2 AND status = 'running'
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(owner.as_uuid())
        .bind(cursor as i64)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_batch_cursor", e))?;

        if result.rows_affected() == 0 {
            self.require_exists(job_id).await?;
            return Err(JobStoreError::OwnershipLost(job_id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn request_cancel(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE pipeline_jobs
            SET status = CASE
                    WHEN status = 'queued' OR owner IS NULL THEN 'cancelled'
                    ELSE status
                END,
                cancel_requested = CASE
                    WHEN status = 'running' AND owner IS NOT NULL THEN TRUE
                    ELSE cancel_requested
                END,
                waiting_on_sub_jobs = CASE
                    WHEN status = 'queued' OR owner IS NULL THEN FALSE
                    ELSE waiting_on_sub_jobs
                END,
                updated_at = $2
            WHERE id = $1 AND status IN ('queued', 'running')
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("request_cancel", e))?;

        match row {
            Some(row) => decode_job(&row),
            None => self.require_exists(job_id).await,
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn note_resume_attempt(
        &self,
        job_id: JobId,
        observed_owner: Option<OwnerToken>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE pipeline_jobs
            SET owner = NULL,
                resume_attempts = resume_attempts + 1,
                updated_at = $3
            WHERE id = $1 AND status = 'running' AND owner IS NOT DISTINCT FROM $2
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(observed_owner.map(Uuid::from))
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("note_resume_attempt", e))?;

        match row {
            Some(row) => Ok(Some(decode_job(&row)?)),
            None => {
                self.require_exists(job_id).await?;
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, error), fields(job_id = %job_id, kind = %error.kind), err)]
    async fn fail_running(
        &self,
        job_id: JobId,
        observed_owner: Option<OwnerToken>,
        error: JobError,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_jobs
            SET status = 'failed',
                error_kind = $3,
                error_message = $4,
                owner = NULL,
                waiting_on_sub_jobs = FALSE,
                updated_at = $5
            WHERE id = $1 AND status = 'running' AND owner IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(observed_owner.map(Uuid::from))
        .bind(error.kind.as_str())
        .bind(&error.message)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_running", e))?;

        if result.rows_affected() == 0 {
            self.require_exists(job_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn reopen_failed(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE pipeline_jobs
            SET status = 'queued',
                error_kind = NULL,
                error_message = NULL,
                resume_attempts = 0,
                cancel_requested = FALSE,
                updated_at = $2
            WHERE id = $1 AND status = 'failed'
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("reopen_failed", e))?;

        match row {
            Some(row) => decode_job(&row),
            None => self.require_exists(job_id).await,
        }
    }

    #[instrument(skip(self), err)]
    async fn list(
        &self,
        filter: &JobFilter,
        pagination: Pagination,
    ) -> Result<JobPage, JobStoreError> {
        const WHERE: &str = "($1::text IS NULL OR status = $1) \
             AND ($2::text IS NULL OR kind = $2) \
             AND ($3::uuid IS NULL OR parent_job_id = $3)";

        let status = filter.status.map(|s| s.as_str());
        let parent = filter.parent_job_id.map(Uuid::from);

        let total: i64 = sqlx::query(&format!("SELECT COUNT(*) AS total FROM pipeline_jobs WHERE {WHERE}"))
            .bind(status)
            .bind(filter.kind.as_deref())
            .bind(parent)
            .fetch_one(&*self.pool)
            .await
            .and_then(|row| row.try_get("total"))
            .map_err(|e| map_sqlx_error("list_count", e))?;

        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM pipeline_jobs WHERE {WHERE} \
             ORDER BY created_at ASC, id ASC LIMIT $4 OFFSET $5"
        );
        let jobs = self
            .fetch_many(
                "list",
                sqlx::query(&sql)
                    .bind(status)
                    .bind(filter.kind.as_deref())
                    .bind(parent)
                    .bind(i64::from(pagination.limit))
                    .bind(i64::from(pagination.offset)),
            )
            .await?;

        Ok(JobPage::new(jobs, total.max(0) as u64, pagination))
    }

    #[instrument(skip(self), err)]
    async fn list_running(&self) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM pipeline_jobs WHERE status = 'running' \
             ORDER BY created_at ASC, id ASC"
        );
        self.fetch_many("list_running", sqlx::query(&sql)).await
    }

    #[instrument(skip(self), err)]
    async fn next_queued(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM pipeline_jobs WHERE status = 'queued' \
             ORDER BY created_at ASC, id ASC LIMIT $1"
        );
        self.fetch_many("next_queued", sqlx::query(&sql).bind(limit as i64))
            .await
    }

    #[instrument(skip(self), fields(parent = %parent), err)]
    async fn children(&self, parent: JobId) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM pipeline_jobs WHERE parent_job_id = $1 \
             ORDER BY created_at ASC, id ASC"
        );
        self.fetch_many("children", sqlx::query(&sql).bind(parent.as_uuid()))
            .await
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, waiting_on_sub_jobs, COUNT(*) AS n
            FROM pipeline_jobs
            GROUP BY status, waiting_on_sub_jobs
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let waiting: bool = row
                .try_get("waiting_on_sub_jobs")
                .map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let n = n.max(0) as usize;

            match JobStatus::from_str(&status).map_err(|e| JobStoreError::Storage(e.to_string()))? {
                JobStatus::Queued => stats.queued += n,
                JobStatus::Running => stats.running += n,
                JobStatus::Completed => stats.completed += n,
                JobStatus::Failed => stats.failed += n,
                JobStatus::Cancelled => stats.cancelled += n,
            }
            if waiting {
                stats.waiting_on_sub_jobs += n;
            }
        }
        Ok(stats)
    }
}

fn uuids(ids: &[JobId]) -> Vec<Uuid> {
    ids.iter().map(|id| *id.as_uuid()).collect()
}

fn split_error(error: Option<&JobError>) -> (Option<&'static str>, Option<String>) {
    match error {
        Some(e) => (Some(e.kind.as_str()), Some(e.message.clone())),
        None => (None, None),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn decode_job(row: &PgRow) -> Result<Job, JobStoreError> {
    let raw = JobRow::from_row(row).map_err(|e| map_sqlx_error("decode_job", e))?;
    Job::try_from(raw)
}

#[derive(Debug)]
struct JobRow {
    id: Uuid,
    kind: String,
    payload_ref: String,
    status: String,
    current_stage: Option<String>,
    progress_percent: i16,
    error_kind: Option<String>,
    error_message: Option<String>,
    parent_job_id: Option<Uuid>,
    dependency: String,
    batch_cursor: Option<i64>,
    sub_job_ids: Vec<Uuid>,
    owner: Option<Uuid>,
    resume_attempts: i32,
    cancel_requested: bool,
    waiting_on_sub_jobs: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_heartbeat_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            payload_ref: row.try_get("payload_ref")?,
            status: row.try_get("status")?,
            current_stage: row.try_get("current_stage")?,
            progress_percent: row.try_get("progress_percent")?,
            error_kind: row.try_get("error_kind")?,
            error_message: row.try_get("error_message")?,
            parent_job_id: row.try_get("parent_job_id")?,
            dependency: row.try_get("dependency")?,
            batch_cursor: row.try_get("batch_cursor")?,
            sub_job_ids: row.try_get("sub_job_ids")?,
            owner: row.try_get("owner")?,
            resume_attempts: row.try_get("resume_attempts")?,
            cancel_requested: row.try_get("cancel_requested")?,
            waiting_on_sub_jobs: row.try_get("waiting_on_sub_jobs")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |e: docpipe_core::DomainError| {
            JobStoreError::Storage(format!("corrupt job row {}: {}", row.id, e))
        };

        let error = match row.error_kind.as_deref() {
            Some(kind) => Some(JobError::new(
                ErrorKind::from_str(kind).map_err(corrupt)?,
                row.error_message.clone().unwrap_or_default(),
            )),
            None => None,
        };

        Ok(Job {
            id: JobId::from_uuid(row.id),
            kind: JobKind::from_name(&row.kind),
            payload_ref: row.payload_ref,
            status: JobStatus::from_str(&row.status).map_err(corrupt)?,
            current_stage: row.current_stage,
            progress_percent: row.progress_percent.clamp(0, 100) as u8,
            error,
            parent_job_id: row.parent_job_id.map(JobId::from_uuid),
            dependency: SubJobDependency::from_str(&row.dependency).map_err(corrupt)?,
            batch_cursor: row.batch_cursor.map(|c| c.max(0) as u64),
            sub_job_ids: row.sub_job_ids.into_iter().map(JobId::from_uuid).collect(),
            owner: row.owner.map(OwnerToken::from_uuid),
            resume_attempts: row.resume_attempts.max(0) as u32,
            cancel_requested: row.cancel_requested,
            waiting_on_sub_jobs: row.waiting_on_sub_jobs,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_heartbeat_at: row.last_heartbeat_at,
        })
    }
}
