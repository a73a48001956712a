//! Stage executor contract.
//!
//! A [`Stage`] does one checkpointable unit of work. It receives a
//! [`StageContext`] describing the job and can pull the previous stage's
//! output reference from the checkpoint store on demand. It returns the output
//! reference to checkpoint, plus optional deferred work for a sub-job.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use docpipe_core::{Classify, ErrorClass, JobId, OwnerToken, StageDefinition, StageOutputRef};
use docpipe_enrichment::EnrichmentError;

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::jobs::{Job, JobStore, JobStoreError, SubJobDependency, SubJobKind};
use crate::search::VectorStoreError;

/// Work a stage hands off to an independently tracked sub-job.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredWork {
    pub sub_kind: SubJobKind,
    pub payload_ref: String,
    pub dependency: SubJobDependency,
}

impl DeferredWork {
    pub fn new(sub_kind: SubJobKind, payload_ref: impl Into<String>) -> Self {
        Self {
            sub_kind,
            payload_ref: payload_ref.into(),
            dependency: SubJobDependency::BestEffort,
        }
    }

    pub fn required(mut self) -> Self {
        self.dependency = SubJobDependency::Required;
        self
    }
}

/// What a successful stage produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub output: StageOutputRef,
    pub deferred: Option<DeferredWork>,
}

impl StageOutcome {
    pub fn new(output: StageOutputRef) -> Self {
        Self {
            output,
            deferred: None,
        }
    }

    pub fn with_deferred(mut self, work: DeferredWork) -> Self {
        self.deferred = Some(work);
        self
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Enrichment(#[from] EnrichmentError),

    #[error("stage attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Store(#[from] JobStoreError),

    #[error(transparent)]
    VectorStore(#[from] VectorStoreError),

    #[error("invalid stage input: {0}")]
    InvalidInput(String),

    #[error("stage failed: {0}")]
    Failed(String),
}

impl Classify for StageError {
    fn class(&self) -> ErrorClass {
        match self {
            StageError::Enrichment(e) => e.class(),
            StageError::Timeout(_) => ErrorClass::Retryable,
            StageError::Checkpoint(e) => e.class(),
            StageError::Store(e) => e.class(),
            StageError::VectorStore(e) => e.class(),
            StageError::InvalidInput(_) | StageError::Failed(_) => ErrorClass::Terminal,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            StageError::Enrichment(e) => e.retry_after(),
            _ => None,
        }
    }
}

impl From<tokio::task::JoinError> for StageError {
    fn from(err: tokio::task::JoinError) -> Self {
        StageError::Failed(format!("stage task aborted: {err}"))
    }
}

/// Everything a stage may read about the job it runs for.
pub struct StageContext {
    job: Job,
    stage: StageDefinition,
    ordinal: u32,
    owner: OwnerToken,
    checkpoints: Arc<dyn CheckpointStore>,
    jobs: Arc<dyn JobStore>,
    batch_cursor: AtomicU64,
}

impl StageContext {
    pub fn new(
        job: Job,
        stage: StageDefinition,
        ordinal: u32,
        owner: OwnerToken,
        checkpoints: Arc<dyn CheckpointStore>,
        jobs: Arc<dyn JobStore>,
    ) -> Self {
        let cursor = job.batch_cursor.unwrap_or(0);
        Self {
            job,
            stage,
            ordinal,
            owner,
            checkpoints,
            jobs,
            batch_cursor: AtomicU64::new(cursor),
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn payload_ref(&self) -> &str {
        &self.job.payload_ref
    }

    pub fn stage_name(&self) -> &str {
        &self.stage.name
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// Output reference checkpointed by the preceding stage, if any.
    pub async fn previous_output(&self) -> Result<Option<StageOutputRef>, StageError> {
        let Some(prev) = self.ordinal.checked_sub(1) else {
            return Ok(None);
        };
        let checkpoint = self.checkpoints.get(self.job.id, prev).await?;
        Ok(checkpoint.map(|c| c.output))
    }

    /// Items already processed by this (batch) job.
    pub fn batch_cursor(&self) -> u64 {
        self.batch_cursor.load(Ordering::SeqCst)
    }

    /// Persist batch progress so a resumed run skips finished batches.
    pub async fn save_batch_cursor(&self, cursor: u64) -> Result<(), StageError> {
        self.jobs
            .set_batch_cursor(self.job.id, self.owner, cursor, Utc::now())
            .await?;
        self.batch_cursor.store(cursor, Ordering::SeqCst);
        Ok(())
    }
}

/// One checkpointable unit of pipeline work.
///
/// Stages must tolerate re-execution: a crash after the stage's side effects
/// but before its checkpoint runs it again on resume.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome, StageError>;
}
