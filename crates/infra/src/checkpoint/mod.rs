//! Stage checkpoints: durable proof of how far a job has gotten.
//!
//! Checkpoints for a job form a gap-free sequence of stage ordinals starting at
//! 0. `append` accepts only `latest + 1`, which rejects both skipped stages and
//! a second executor replaying a stage that already checkpointed. Rows are
//! never mutated or deleted.

pub mod postgres;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use docpipe_core::{Classify, ErrorClass, JobId, StageOutputRef};

pub use postgres::PostgresCheckpointStore;

/// One completed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: JobId,
    pub stage_name: String,
    pub stage_ordinal: u32,
    pub completed_at: DateTime<Utc>,
    pub output: StageOutputRef,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CheckpointError {
    #[error("out-of-order checkpoint for job {job_id}: expected ordinal {expected}, got {got}")]
    OutOfOrder {
        job_id: JobId,
        expected: u32,
        got: u32,
    },

    #[error("checkpoint storage error: {0}")]
    Storage(String),
}

impl Classify for CheckpointError {
    fn class(&self) -> ErrorClass {
        match self {
            CheckpointError::OutOfOrder { .. } => ErrorClass::Terminal,
            CheckpointError::Storage(_) => ErrorClass::Retryable,
        }
    }
}

/// Checkpoint persistence.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Highest-ordinal checkpoint for the job, if any.
    async fn get_latest(&self, job_id: JobId) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Record completion of `stage_ordinal`.
    ///
    /// Fails with `OutOfOrder` unless `stage_ordinal` is exactly one greater
    /// than the latest ordinal (or 0 when there is none).
    async fn append(
        &self,
        job_id: JobId,
        stage_name: &str,
        stage_ordinal: u32,
        output: StageOutputRef,
        completed_at: DateTime<Utc>,
    ) -> Result<Checkpoint, CheckpointError>;

    /// Checkpoint for one ordinal (used to fetch a prior stage's output on demand).
    async fn get(&self, job_id: JobId, stage_ordinal: u32)
    -> Result<Option<Checkpoint>, CheckpointError>;

    /// Full history in ordinal order.
    async fn list(&self, job_id: JobId) -> Result<Vec<Checkpoint>, CheckpointError>;
}

fn next_ordinal(latest: Option<u32>) -> u32 {
    latest.map(|o| o + 1).unwrap_or(0)
}

/// In-memory checkpoint store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    inner: RwLock<HashMap<JobId, Vec<Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn poisoned() -> CheckpointError {
    CheckpointError::Storage("checkpoint store lock poisoned".to_string())
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get_latest(&self, job_id: JobId) -> Result<Option<Checkpoint>, CheckpointError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.get(&job_id).and_then(|cps| cps.last().cloned()))
    }

    async fn append(
        &self,
        job_id: JobId,
        stage_name: &str,
        stage_ordinal: u32,
        output: StageOutputRef,
        completed_at: DateTime<Utc>,
    ) -> Result<Checkpoint, CheckpointError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let checkpoints = inner.entry(job_id).or_default();

        let expected = next_ordinal(checkpoints.last().map(|c| c.stage_ordinal));
        if stage_ordinal != expected {
            return Err(CheckpointError::OutOfOrder {
                job_id,
                expected,
                got: stage_ordinal,
            });
        }

        let checkpoint = Checkpoint {
            job_id,
            stage_name: stage_name.to_string(),
            stage_ordinal,
            completed_at,
            output,
        };
        checkpoints.push(checkpoint.clone());
        Ok(checkpoint)
    }

    async fn get(
        &self,
        job_id: JobId,
        stage_ordinal: u32,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner
            .get(&job_id)
            .and_then(|cps| cps.get(stage_ordinal as usize))
            .cloned())
    }

    async fn list(&self, job_id: JobId) -> Result<Vec<Checkpoint>, CheckpointError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.get(&job_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_in_order_and_reads_latest() {
        let store = InMemoryCheckpointStore::new();
        let job = JobId::new();
        assert!(store.get_latest(job).await.unwrap().is_none());

        store
            .append(job, "ingest", 0, StageOutputRef::Empty, Utc::now())
            .await
            .unwrap();
        store
            .append(job, "extract", 1, StageOutputRef::items("chunks", 12), Utc::now())
            .await
            .unwrap();

        let latest = store.get_latest(job).await.unwrap().unwrap();
        assert_eq!(latest.stage_ordinal, 1);
        assert_eq!(latest.stage_name, "extract");
        assert_eq!(
            store.get(job, 1).await.unwrap().unwrap().output.item_count(),
            Some(12)
        );
        assert_eq!(store.list(job).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rejects_non_consecutive_ordinals() {
        let store = InMemoryCheckpointStore::new();
        let job = JobId::new();

        let skipped = store
            .append(job, "extract", 1, StageOutputRef::Empty, Utc::now())
            .await;
        assert_eq!(
            skipped,
            Err(CheckpointError::OutOfOrder {
                job_id: job,
                expected: 0,
                got: 1
            })
        );

        store
            .append(job, "ingest", 0, StageOutputRef::Empty, Utc::now())
            .await
            .unwrap();
        let replayed = store
            .append(job, "ingest", 0, StageOutputRef::Empty, Utc::now())
            .await;
        assert!(matches!(
            replayed,
            Err(CheckpointError::OutOfOrder { expected: 1, got: 0, .. })
        ));
        assert_eq!(store.list(job).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn jobs_are_independent() {
        let store = InMemoryCheckpointStore::new();
        let a = JobId::new();
        let b = JobId::new();
        store
            .append(a, "ingest", 0, StageOutputRef::Empty, Utc::now())
            .await
            .unwrap();
        store
            .append(b, "ingest", 0, StageOutputRef::Empty, Utc::now())
            .await
            .unwrap();
        assert!(store.get_latest(b).await.unwrap().is_some());
    }
}
