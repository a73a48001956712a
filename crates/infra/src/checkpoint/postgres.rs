//! Postgres-backed checkpoint store over `pipeline_checkpoints`.
//!
//! `append` is one conditional `INSERT … SELECT … WHERE` that only fires when
//! the ordinal is `MAX(stage_ordinal) + 1`. Two executors racing past that check
//! for the same ordinal collide on the `(job_id, stage_ordinal)` primary key
//! (`23505`), which is reported as `OutOfOrder` as well.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use docpipe_core::{JobId, StageOutputRef};

use super::{Checkpoint, CheckpointError, CheckpointStore, next_ordinal};

#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: Arc<PgPool>,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get_latest(&self, job_id: JobId) -> Result<Option<Checkpoint>, CheckpointError> {
        let row = sqlx::query(
            r#"
            SELECT job_id, stage_ordinal, stage_name, output_ref, completed_at
            FROM pipeline_checkpoints
            WHERE job_id = $1
            ORDER BY stage_ordinal DESC
            LIMIT 1
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_latest", e))?;

        row.map(|r| decode_checkpoint(&r)).transpose()
    }

    #[instrument(skip(self, output), fields(job_id = %job_id, stage = stage_name, ordinal = stage_ordinal), err)]
    async fn append(
        &self,
        job_id: JobId,
        stage_name: &str,
        stage_ordinal: u32,
        output: StageOutputRef,
        completed_at: DateTime<Utc>,
    ) -> Result<Checkpoint, CheckpointError> {
        let output_json = serde_json::to_value(&output)
            .map_err(|e| CheckpointError::Storage(format!("failed to encode output ref: {e}")))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO pipeline_checkpoints (job_id, stage_ordinal, stage_name, output_ref, completed_at)
            SELECT $1, $2, $3, $4, $5
            WHERE COALESCE(
                (SELECT MAX(stage_ordinal) FROM pipeline_checkpoints WHERE job_id = $1),
                -1
            ) = $2 - 1
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(stage_ordinal as i32)
        .bind(stage_name)
        .bind(&output_json)
        .bind(completed_at)
        .execute(&*self.pool)
        .await;

        let rows = match inserted {
            Ok(result) => result.rows_affected(),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505") => 0,
            Err(e) => return Err(map_sqlx_error("append", e)),
        };

        if rows == 0 {
            let latest = self.get_latest(job_id).await?;
            return Err(CheckpointError::OutOfOrder {
                job_id,
                expected: next_ordinal(latest.map(|c| c.stage_ordinal)),
                got: stage_ordinal,
            });
        }

        Ok(Checkpoint {
            job_id,
            stage_name: stage_name.to_string(),
            stage_ordinal,
            completed_at,
            output,
        })
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(
        &self,
        job_id: JobId,
        stage_ordinal: u32,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        let row = sqlx::query(
            r#"
            SELECT job_id, stage_ordinal, stage_name, output_ref, completed_at
            FROM pipeline_checkpoints
            WHERE job_id = $1 AND stage_ordinal = $2
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(stage_ordinal as i32)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| decode_checkpoint(&r)).transpose()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn list(&self, job_id: JobId) -> Result<Vec<Checkpoint>, CheckpointError> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, stage_ordinal, stage_name, output_ref, completed_at
            FROM pipeline_checkpoints
            WHERE job_id = $1
            ORDER BY stage_ordinal ASC
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(decode_checkpoint).collect()
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> CheckpointError {
    match err {
        sqlx::Error::Database(db_err) => CheckpointError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        _ => CheckpointError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn decode_checkpoint(row: &PgRow) -> Result<Checkpoint, CheckpointError> {
    let raw = CheckpointRow::from_row(row).map_err(|e| map_sqlx_error("decode_checkpoint", e))?;
    let output: StageOutputRef = serde_json::from_value(raw.output_ref).map_err(|e| {
        CheckpointError::Storage(format!("corrupt output ref for job {}: {}", raw.job_id, e))
    })?;
    Ok(Checkpoint {
        job_id: JobId::from_uuid(raw.job_id),
        stage_name: raw.stage_name,
        stage_ordinal: raw.stage_ordinal.max(0) as u32,
        completed_at: raw.completed_at,
        output,
    })
}

#[derive(Debug)]
struct CheckpointRow {
    job_id: Uuid,
    stage_ordinal: i32,
    stage_name: String,
    output_ref: serde_json::Value,
    completed_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for CheckpointRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(CheckpointRow {
            job_id: row.try_get("job_id")?,
            stage_ordinal: row.try_get("stage_ordinal")?,
            stage_name: row.try_get("stage_name")?,
            output_ref: row.try_get("output_ref")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}
