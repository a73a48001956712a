//! Job storage: the single-row-per-job record every component coordinates through.
//!
//! All mutations are single-row conditional writes. The claim operation is the
//! only concurrency-control primitive: it hands a fresh [`OwnerToken`] to one
//! executor, and every later write by that executor is conditional on still
//! holding it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use docpipe_core::{Classify, ErrorClass, JobError, JobId, OwnerToken};

use super::query::{JobFilter, JobPage, Pagination};
use super::types::{Job, JobStatus};

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The caller now owns the job (returned as stored after the claim).
    Claimed(Job),
    /// The job already reached a terminal status; nothing was written.
    Terminal(Job),
    /// Another executor holds a live claim.
    Busy(Job),
}

/// Job store abstraction.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with `AlreadyExists` if the id is taken.
    async fn insert(&self, job: Job) -> Result<Job, JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Claim a job for `owner`.
    ///
    /// `queued` jobs and `running` jobs whose owner is gone or whose last sign
    /// of life is older than `stale_before` are claimed; terminal jobs are
    /// returned untouched.
    async fn claim(
        &self,
        job_id: JobId,
        owner: OwnerToken,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<ClaimOutcome, JobStoreError>;

    /// Persist executor-owned fields, conditional on `owner` still holding a
    /// `running` claim.
    ///
    /// Never writes `cancel_requested`, `batch_cursor` or `resume_attempts`,
    /// and never moves `last_heartbeat_at` backwards.
    async fn save_owned(&self, job: &Job, owner: OwnerToken) -> Result<(), JobStoreError>;

    /// Record liveness. Touches only `last_heartbeat_at`; returns `false` when
    /// `owner` no longer holds the job.
    async fn heartbeat(
        &self,
        job_id: JobId,
        owner: OwnerToken,
        at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// Advance a batch sub-job's cursor (owner-conditional).
    async fn set_batch_cursor(
        &self,
        job_id: JobId,
        owner: OwnerToken,
        cursor: u64,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError>;

    /// Cancel a queued (or unowned running) job outright; flag an owned
    /// running job for cancellation at its next stage boundary. Terminal jobs
    /// are returned unchanged.
    async fn request_cancel(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError>;

    /// Release a stale claim ahead of an automatic resume and count the
    /// attempt. Returns `None` if the job moved on since it was observed.
    async fn note_resume_attempt(
        &self,
        job_id: JobId,
        observed_owner: Option<OwnerToken>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Force a running job to `failed`, conditional on the observed owner.
    async fn fail_running(
        &self,
        job_id: JobId,
        observed_owner: Option<OwnerToken>,
        error: JobError,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// Move a `failed` job back to `queued` (error cleared, resume budget
    /// reset). Any other status is returned unchanged.
    async fn reopen_failed(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError>;

    /// Jobs matching `filter`, oldest first.
    async fn list(&self, filter: &JobFilter, pagination: Pagination)
    -> Result<JobPage, JobStoreError>;

    async fn list_running(&self) -> Result<Vec<Job>, JobStoreError>;

    /// Oldest queued jobs, up to `limit`.
    async fn next_queued(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Sub-jobs of `parent`, oldest first.
    async fn children(&self, parent: JobId) -> Result<Vec<Job>, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("ownership of job {0} lost")]
    OwnershipLost(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl Classify for JobStoreError {
    fn class(&self) -> ErrorClass {
        match self {
            JobStoreError::Storage(_) => ErrorClass::Retryable,
            _ => ErrorClass::Terminal,
        }
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Running parents parked on required sub-jobs.
    pub waiting_on_sub_jobs: usize,
}

impl JobStats {
    pub fn record(&mut self, job: &Job) {
        match job.status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
        if job.waiting_on_sub_jobs {
            self.waiting_on_sub_jobs += 1;
        }
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn sorted(jobs: impl Iterator<Item = Job>) -> Vec<Job> {
        let mut out: Vec<Job> = jobs.collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }
}

fn owned_running<'a>(
    jobs: &'a mut HashMap<JobId, Job>,
    job_id: JobId,
    owner: OwnerToken,
) -> Result<&'a mut Job, JobStoreError> {
    let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
    if job.status != JobStatus::Running || job.owner != Some(owner) {
        return Err(JobStoreError::OwnershipLost(job_id));
    }
    Ok(job)
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.get(&job_id).cloned())
    }

    async fn claim(
        &self,
        job_id: JobId,
        owner: OwnerToken,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<ClaimOutcome, JobStoreError> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        if job.is_terminal() {
            return Ok(ClaimOutcome::Terminal(job.clone()));
        }
        if job.status == JobStatus::Queued || job.is_claimable_running(stale_before) {
            job.mark_running(owner, now);
            return Ok(ClaimOutcome::Claimed(job.clone()));
        }
        Ok(ClaimOutcome::Busy(job.clone()))
    }

    async fn save_owned(&self, job: &Job, owner: OwnerToken) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        let stored = owned_running(&mut jobs, job.id, owner)?;

        stored.status = job.status;
        stored.current_stage = job.current_stage.clone();
        stored.progress_percent = stored.progress_percent.max(job.progress_percent);
        stored.error = job.error.clone();
        stored.sub_job_ids = job.sub_job_ids.clone();
        stored.owner = job.owner;
        stored.waiting_on_sub_jobs = job.waiting_on_sub_jobs;
        stored.updated_at = job.updated_at;
        stored.last_heartbeat_at = stored.last_heartbeat_at.max(job.last_heartbeat_at);
        Ok(())
    }

    async fn heartbeat(
        &self,
        job_id: JobId,
        owner: OwnerToken,
        at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let mut jobs = self.write()?;
        match owned_running(&mut jobs, job_id, owner) {
            Ok(job) => {
                job.last_heartbeat_at = Some(at);
                Ok(true)
            }
            Err(JobStoreError::OwnershipLost(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn set_batch_cursor(
        &self,
        job_id: JobId,
        owner: OwnerToken,
        cursor: u64,
        now: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        let mut jobs = self.write()?;
        let job = owned_running(&mut jobs, job_id, owner)?;
        job.batch_cursor = Some(cursor);
        job.updated_at = now;
        Ok(())
    }

    async fn request_cancel(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        match job.status {
            JobStatus::Queued => job.mark_cancelled(now),
            JobStatus::Running if job.owner.is_none() => job.mark_cancelled(now),
            JobStatus::Running => {
                job.cancel_requested = true;
                job.updated_at = now;
            }
            _ => {}
        }
        Ok(job.clone())
    }

    async fn note_resume_attempt(
        &self,
        job_id: JobId,
        observed_owner: Option<OwnerToken>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.status != JobStatus::Running || job.owner != observed_owner {
            return Ok(None);
        }
        job.owner = None;
        job.resume_attempts += 1;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn fail_running(
        &self,
        job_id: JobId,
        observed_owner: Option<OwnerToken>,
        error: JobError,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.status != JobStatus::Running || job.owner != observed_owner {
            return Ok(false);
        }
        job.mark_failed(error, now);
        Ok(true)
    }

    async fn reopen_failed(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.status == JobStatus::Failed {
            job.status = JobStatus::Queued;
            job.error = None;
            job.resume_attempts = 0;
            job.cancel_requested = false;
            job.updated_at = now;
        }
        Ok(job.clone())
    }

    async fn list(
        &self,
        filter: &JobFilter,
        pagination: Pagination,
    ) -> Result<JobPage, JobStoreError> {
        let jobs = self.read()?;
        let matching = Self::sorted(jobs.values().filter(|j| filter.matches(j)).cloned());
        let total = matching.len() as u64;
        let page = matching
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect();
        Ok(JobPage::new(page, total, pagination))
    }

    async fn list_running(&self) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read()?;
        Ok(Self::sorted(
            jobs.values()
                .filter(|j| j.status == JobStatus::Running)
                .cloned(),
        ))
    }

    async fn next_queued(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read()?;
        let mut queued = Self::sorted(
            jobs.values()
                .filter(|j| j.status == JobStatus::Queued)
                .cloned(),
        );
        queued.truncate(limit);
        Ok(queued)
    }

    async fn children(&self, parent: JobId) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read()?;
        Ok(Self::sorted(
            jobs.values()
                .filter(|j| j.parent_job_id == Some(parent))
                .cloned(),
        ))
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.record(job);
        }
        Ok(stats)
    }
}
