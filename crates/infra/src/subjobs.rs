//! Sub-job tracking.
//!
//! A stage that declares deferred work gets an independently tracked child
//! job. The child id is derived from the parent id and stage ordinal, so
//! re-running the declaring stage after a crash finds the existing child
//! instead of inserting a second one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use docpipe_core::JobId;

use crate::jobs::{Job, JobStatus, JobStore, JobStoreError, SubJobDependency};
use crate::pipeline::DeferredWork;

/// Whether a parent's required children let it finish.
#[derive(Debug, Clone, PartialEq)]
pub enum SubJobSettlement {
    /// No required child is outstanding.
    Settled,
    /// Required children still queued or running.
    Pending(Vec<JobId>),
    /// A required child ended without completing.
    Failed { child: JobId, status: JobStatus },
}

#[derive(Clone)]
pub struct SubJobTracker {
    jobs: Arc<dyn JobStore>,
}

impl SubJobTracker {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        Self { jobs }
    }

    /// Create (or find) the child for `work` declared by `stage_ordinal`.
    pub async fn spawn(
        &self,
        parent: &Job,
        stage_ordinal: u32,
        work: &DeferredWork,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let child = Job::sub_job(
            parent,
            stage_ordinal,
            work.sub_kind.clone(),
            work.payload_ref.clone(),
            work.dependency,
            now,
        );

        match self.jobs.insert(child).await {
            Ok(child) => {
                info!(
                    job_id = %parent.id,
                    sub_job_id = %child.id,
                    kind = %child.kind,
                    dependency = child.dependency.as_str(),
                    "sub-job spawned"
                );
                Ok(child)
            }
            Err(JobStoreError::AlreadyExists(id)) => self
                .jobs
                .get(id)
                .await?
                .ok_or(JobStoreError::NotFound(id)),
            Err(e) => Err(e),
        }
    }

    pub async fn children(&self, parent: JobId) -> Result<Vec<Job>, JobStoreError> {
        self.jobs.children(parent).await
    }

    /// Best-effort children never hold a parent back.
    pub async fn settlement(&self, parent: JobId) -> Result<SubJobSettlement, JobStoreError> {
        let required: Vec<Job> = self
            .jobs
            .children(parent)
            .await?
            .into_iter()
            .filter(|c| c.dependency == SubJobDependency::Required)
            .collect();

        if let Some(failed) = required
            .iter()
            .find(|c| matches!(c.status, JobStatus::Failed | JobStatus::Cancelled))
        {
            return Ok(SubJobSettlement::Failed {
                child: failed.id,
                status: failed.status,
            });
        }

        let pending: Vec<JobId> = required
            .iter()
            .filter(|c| !c.is_terminal())
            .map(|c| c.id)
            .collect();
        if pending.is_empty() {
            Ok(SubJobSettlement::Settled)
        } else {
            Ok(SubJobSettlement::Pending(pending))
        }
    }
}
