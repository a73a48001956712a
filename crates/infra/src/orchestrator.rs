//! Checkpointed pipeline orchestrator.
//!
//! `run_job` claims a job, finds the latest checkpoint and drives the
//! remaining stages in order. Each stage runs under the retry wrapper with a
//! heartbeat alongside it; its checkpoint is written before the next stage
//! starts. A crash anywhere leaves at most one stage to redo.
//!
//! The claim is the only concurrency control: every job write after it is
//! conditional on the owner token, so an executor that lost its claim (stale
//! heartbeat, taken over by a resume) stops at its next write.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use docpipe_core::{ErrorKind, JobError, JobId, OwnerToken, PipelineDefinition, StageDefinition};

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
use crate::heartbeat::HeartbeatEmitter;
use crate::jobs::{
    ClaimOutcome, Job, JobFilter, JobKind, JobPage, JobStats, JobStatus, JobStore, JobStoreError,
    Pagination,
};
use crate::pipeline::{PipelineRegistry, Stage, StageContext, StageError, StageOutcome};
use crate::retry::{self, RetryPolicy, TerminalError};
use crate::subjobs::{SubJobSettlement, SubJobTracker};

/// Tunables for stage execution and claim staleness.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub retry: RetryPolicy,
    /// Per-attempt stage timeout; expiry counts as a retryable failure.
    pub stage_timeout: Option<Duration>,
    pub heartbeat_interval: Duration,
    /// A running job with no sign of life for this long may be re-claimed.
    pub heartbeat_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            stage_timeout: None,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("no pipeline registered for job kind {0}")]
    UnknownKind(String),

    #[error("job {0} is being driven by another executor")]
    AlreadyActive(JobId),

    #[error("ownership of job {0} lost")]
    OwnershipLost(JobId),

    #[error(transparent)]
    Store(JobStoreError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl From<JobStoreError> for OrchestratorError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => OrchestratorError::NotFound(id),
            JobStoreError::OwnershipLost(id) => OrchestratorError::OwnershipLost(id),
            other => OrchestratorError::Store(other),
        }
    }
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

/// Result of writing a stage's checkpoint.
enum Commit {
    Appended,
    /// The ordinal was already checkpointed; continue after `latest`.
    AlreadyRecorded { latest: u32 },
    /// The job was failed with `OutOfOrder`.
    Rejected,
}

/// Drives jobs through their pipelines.
#[derive(Clone)]
pub struct Orchestrator {
    jobs: Arc<dyn JobStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    registry: Arc<PipelineRegistry>,
    subjobs: SubJobTracker,
    heartbeat: HeartbeatEmitter,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        registry: Arc<PipelineRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            subjobs: SubJobTracker::new(jobs.clone()),
            heartbeat: HeartbeatEmitter::new(jobs.clone(), config.heartbeat_interval),
            jobs,
            checkpoints,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    pub fn subjobs(&self) -> &SubJobTracker {
        &self.subjobs
    }

    fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - to_chrono(self.config.heartbeat_timeout)
    }

    /// Register a new job in `queued`.
    #[instrument(skip(self, payload_ref), fields(kind = %kind), err)]
    pub async fn submit(
        &self,
        kind: JobKind,
        payload_ref: impl Into<String> + Send,
    ) -> Result<Job, OrchestratorError> {
        if !self.registry.contains(&kind) {
            return Err(OrchestratorError::UnknownKind(kind.type_name().to_string()));
        }
        let job = self.jobs.insert(Job::new(kind, payload_ref)).await?;
        info!(job_id = %job.id, "job submitted");
        Ok(job)
    }

    /// Drive `job_id` from its last checkpoint to a terminal status.
    ///
    /// Terminal jobs are returned as-is without any write. Returns `Running`
    /// when all stages are done but required sub-jobs are still outstanding.
    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn run_job(&self, job_id: JobId) -> Result<JobStatus, OrchestratorError> {
        let owner = OwnerToken::new();
        let now = Utc::now();
        let mut job = match self
            .jobs
            .claim(job_id, owner, now, self.stale_before(now))
            .await?
        {
            ClaimOutcome::Claimed(job) => job,
            ClaimOutcome::Terminal(job) => {
                debug!(status = %job.status, "job already terminal");
                return Ok(job.status);
            }
            ClaimOutcome::Busy(_) => return Err(OrchestratorError::AlreadyActive(job_id)),
        };
        info!(owner = %owner, kind = %job.kind, "job claimed");

        let Some(pipeline) = self.registry.get(&job.kind) else {
            let message = format!("no pipeline registered for job kind {}", job.kind);
            warn!(kind = %job.kind, "unroutable job");
            job.mark_failed(JobError::terminal(message), Utc::now());
            self.jobs.save_owned(&job, owner).await?;
            return Ok(JobStatus::Failed);
        };
        let definition = pipeline.definition();

        let latest = self
            .checkpoints
            .get_latest(job_id)
            .await?
            .map(|c| c.stage_ordinal);
        let resume_from = PipelineDefinition::resume_point(latest);
        job.advance_progress(definition.progress_at(latest));
        if resume_from > 0 {
            info!(resume_from, "resuming after checkpoint");
        }

        let mut ordinal = resume_from;
        while ordinal < definition.len() {
            if self.cancel_if_requested(&mut job, owner).await? {
                return Ok(JobStatus::Cancelled);
            }
            let (Some(stage_def), Some(stage)) = (definition.stage(ordinal), pipeline.stage(ordinal))
            else {
                break;
            };

            job.current_stage = Some(stage_def.name.clone());
            job.touch(Utc::now());
            self.jobs.save_owned(&job, owner).await?;

            match self.execute_stage(&job, stage_def, stage, ordinal, owner).await? {
                Ok(outcome) => {
                    match self
                        .commit_stage(&mut job, definition, stage.name(), ordinal, owner, outcome)
                        .await?
                    {
                        Commit::Appended => ordinal += 1,
                        Commit::AlreadyRecorded { latest } => ordinal = latest + 1,
                        Commit::Rejected => return Ok(JobStatus::Failed),
                    }
                }
                Err(failure) => {
                    self.record_failure(&mut job, stage.name(), ordinal, owner, failure)
                        .await?;
                    return Ok(JobStatus::Failed);
                }
            }
        }

        self.finish(job, owner).await
    }

    async fn execute_stage(
        &self,
        job: &Job,
        stage_def: &StageDefinition,
        stage: &Arc<dyn Stage>,
        ordinal: u32,
        owner: OwnerToken,
    ) -> Result<Result<StageOutcome, TerminalError<StageError>>, OrchestratorError> {
        let ctx = StageContext::new(
            job.clone(),
            stage_def.clone(),
            ordinal,
            owner,
            self.checkpoints.clone(),
            self.jobs.clone(),
        );
        debug!(stage = stage.name(), ordinal, "stage started");

        let heartbeat = self.heartbeat.start(job.id, owner);
        let timeout = self.config.stage_timeout;
        let ctx_ref = &ctx;
        let result = retry::execute(&self.config.retry, |attempt| async move {
            debug!(stage = stage.name(), ordinal, attempt, "stage attempt");
            match timeout {
                Some(limit) => tokio::time::timeout(limit, stage.run(ctx_ref))
                    .await
                    .unwrap_or_else(|_| Err(StageError::Timeout(limit))),
                None => stage.run(ctx_ref).await,
            }
        })
        .await;
        let report = heartbeat.stop().await;

        if report.ownership_lost {
            warn!(stage = stage.name(), ordinal, "claim lost while stage was running");
            return Err(OrchestratorError::OwnershipLost(job.id));
        }
        Ok(result)
    }

    /// Spawn deferred work, write the checkpoint, advance progress.
    ///
    /// A checkpoint already written for this ordinal (by an executor whose
    /// claim lapsed mid-stage) is kept and the job continues after it.
    async fn commit_stage(
        &self,
        job: &mut Job,
        definition: &PipelineDefinition,
        stage_name: &str,
        ordinal: u32,
        owner: OwnerToken,
        outcome: StageOutcome,
    ) -> Result<Commit, OrchestratorError> {
        let now = Utc::now();
        if let Some(work) = &outcome.deferred {
            let child = self.subjobs.spawn(job, ordinal, work, now).await?;
            if !job.sub_job_ids.contains(&child.id) {
                job.sub_job_ids.push(child.id);
            }
        }

        let commit = match self
            .checkpoints
            .append(job.id, stage_name, ordinal, outcome.output, now)
            .await
        {
            Ok(_) => Commit::Appended,
            Err(err @ CheckpointError::OutOfOrder { .. }) => {
                let latest = self
                    .checkpoints
                    .get_latest(job.id)
                    .await?
                    .map(|c| c.stage_ordinal);
                match latest {
                    Some(latest) if latest >= ordinal => {
                        warn!(
                            stage = stage_name,
                            ordinal,
                            latest,
                            "stage already checkpointed by a previous owner; skipping ahead"
                        );
                        Commit::AlreadyRecorded { latest }
                    }
                    _ => {
                        warn!(stage = stage_name, ordinal, error = %err, "checkpoint rejected");
                        job.mark_failed(JobError::new(ErrorKind::OutOfOrder, err.to_string()), now);
                        self.jobs.save_owned(job, owner).await?;
                        return Ok(Commit::Rejected);
                    }
                }
            }
            Err(err) => return Err(err.into()),
        };

        let recorded = match commit {
            Commit::AlreadyRecorded { latest } => latest,
            _ => ordinal,
        };
        job.advance_progress(definition.progress_after(recorded));
        job.touch(now);
        self.jobs.save_owned(job, owner).await?;
        info!(
            stage = stage_name,
            ordinal = recorded,
            progress = job.progress_percent,
            "stage checkpointed"
        );
        Ok(commit)
    }

    async fn record_failure(
        &self,
        job: &mut Job,
        stage_name: &str,
        ordinal: u32,
        owner: OwnerToken,
        failure: TerminalError<StageError>,
    ) -> Result<(), OrchestratorError> {
        if let StageError::Store(JobStoreError::OwnershipLost(id)) = &failure.source {
            return Err(OrchestratorError::OwnershipLost(*id));
        }
        warn!(
            stage = stage_name,
            ordinal,
            attempts = failure.attempts,
            kind = %failure.kind,
            error = %failure.source,
            "stage failed"
        );
        let message = format!(
            "stage {stage_name} failed after {} attempt(s): {}",
            failure.attempts, failure.source
        );
        job.mark_failed(JobError::new(failure.kind, message), Utc::now());
        self.jobs.save_owned(job, owner).await?;
        Ok(())
    }

    /// Honour a cancel request at a stage boundary. Also re-checks the claim.
    async fn cancel_if_requested(
        &self,
        job: &mut Job,
        owner: OwnerToken,
    ) -> Result<bool, OrchestratorError> {
        let stored = self
            .jobs
            .get(job.id)
            .await?
            .ok_or(OrchestratorError::NotFound(job.id))?;
        if stored.status != JobStatus::Running || stored.owner != Some(owner) {
            return Err(OrchestratorError::OwnershipLost(job.id));
        }
        job.batch_cursor = stored.batch_cursor;
        if !stored.cancel_requested {
            return Ok(false);
        }

        job.cancel_requested = true;
        job.mark_cancelled(Utc::now());
        self.jobs.save_owned(job, owner).await?;
        info!(current_stage = ?job.current_stage, "job cancelled at stage boundary");
        Ok(true)
    }

    async fn finish(&self, mut job: Job, owner: OwnerToken) -> Result<JobStatus, OrchestratorError> {
        let now = Utc::now();
        match self.subjobs.settlement(job.id).await? {
            SubJobSettlement::Settled => {
                job.mark_completed(now);
                self.jobs.save_owned(&job, owner).await?;
                info!("job completed");
                Ok(JobStatus::Completed)
            }
            SubJobSettlement::Pending(pending) => {
                job.mark_waiting(now);
                self.jobs.save_owned(&job, owner).await?;
                info!(pending = pending.len(), "waiting on required sub-jobs");
                Ok(JobStatus::Running)
            }
            SubJobSettlement::Failed { child, status } => {
                let message = format!("required sub-job {child} ended {status}");
                job.mark_failed(JobError::terminal(message), now);
                self.jobs.save_owned(&job, owner).await?;
                warn!(sub_job_id = %child, status = %status, "required sub-job did not complete");
                Ok(JobStatus::Failed)
            }
        }
    }

    /// Make a job runnable again for an operator-triggered resume.
    ///
    /// `failed` jobs are re-opened; `completed`/`cancelled` jobs and jobs that
    /// are already runnable come back unchanged. A job with a live owner is
    /// refused with `AlreadyActive`.
    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn request_resume(&self, job_id: JobId) -> Result<Job, OrchestratorError> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or(OrchestratorError::NotFound(job_id))?;
        let now = Utc::now();

        match job.status {
            JobStatus::Failed => {
                let reopened = self.jobs.reopen_failed(job_id, now).await?;
                info!(previous_error = ?job.error, "failed job re-opened");
                Ok(reopened)
            }
            JobStatus::Running if !job.is_claimable_running(self.stale_before(now)) => {
                Err(OrchestratorError::AlreadyActive(job_id))
            }
            _ => Ok(job),
        }
    }

    /// `request_resume` followed by `run_job`.
    pub async fn resume_job(&self, job_id: JobId) -> Result<JobStatus, OrchestratorError> {
        let job = self.request_resume(job_id).await?;
        if job.is_terminal() {
            return Ok(job.status);
        }
        self.run_job(job_id).await
    }

    /// Run a parent parked on required sub-jobs once none is outstanding.
    ///
    /// Returns `None` when the parent is not waiting or still has pending
    /// children.
    pub async fn resume_parent_if_settled(
        &self,
        parent: JobId,
    ) -> Result<Option<JobStatus>, OrchestratorError> {
        let job = self.get_job(parent).await?;
        if job.status != JobStatus::Running || !job.waiting_on_sub_jobs {
            return Ok(None);
        }
        if let SubJobSettlement::Pending(_) = self.subjobs.settlement(parent).await? {
            return Ok(None);
        }
        info!(job_id = %parent, "required sub-jobs settled; resuming parent");
        self.run_job(parent).await.map(Some)
    }

    /// Cancel now if nothing drives the job, else at its next stage boundary.
    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn cancel_job(&self, job_id: JobId) -> Result<Job, OrchestratorError> {
        let job = self.jobs.request_cancel(job_id, Utc::now()).await?;
        info!(status = %job.status, cancel_requested = job.cancel_requested, "cancel requested");
        Ok(job)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Job, OrchestratorError> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or(OrchestratorError::NotFound(job_id))
    }

    pub async fn list_jobs(
        &self,
        filter: &JobFilter,
        pagination: Pagination,
    ) -> Result<JobPage, OrchestratorError> {
        Ok(self.jobs.list(filter, pagination).await?)
    }

    pub async fn sub_jobs(&self, parent: JobId) -> Result<Vec<Job>, OrchestratorError> {
        self.get_job(parent).await?;
        Ok(self.subjobs.children(parent).await?)
    }

    pub async fn checkpoints(&self, job_id: JobId) -> Result<Vec<Checkpoint>, OrchestratorError> {
        self.get_job(job_id).await?;
        Ok(self.checkpoints.list(job_id).await?)
    }

    pub async fn stats(&self) -> Result<JobStats, OrchestratorError> {
        Ok(self.jobs.stats().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::jobs::InMemoryJobStore;
    use crate::jobs::SubJobKind;
    use crate::pipeline::{DeferredWork, Pipeline};
    use async_trait::async_trait;
    use docpipe_core::StageOutputRef;
    use docpipe_enrichment::EnrichmentError;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Clone, Copy)]
    enum Script {
        Succeed,
        FailTransient(u32),
        FailTerminal,
        Defer,
        /// A lapsed executor checkpoints this stage while the current one runs it.
        Overtaken,
    }

    struct ScriptedStage {
        name: String,
        script: Script,
        calls: AtomicU32,
        checkpoints: Arc<InMemoryCheckpointStore>,
    }

    impl ScriptedStage {
        fn new(name: &str, script: Script, checkpoints: Arc<InMemoryCheckpointStore>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                script,
                calls: AtomicU32::new(0),
                checkpoints,
            })
        }
    }

    #[async_trait]
    impl Stage for ScriptedStage {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, ctx: &StageContext) -> Result<StageOutcome, StageError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let output = StageOutputRef::items(format!("{}/{}", self.name, ctx.job_id()), 1);
            match self.script {
                Script::Succeed => Ok(StageOutcome::new(output)),
                Script::FailTransient(times) if n <= times => {
                    Err(EnrichmentError::Unavailable("flaky".into()).into())
                }
                Script::FailTransient(_) => Ok(StageOutcome::new(output)),
                Script::FailTerminal => Err(StageError::InvalidInput("corrupt document".into())),
                Script::Defer => Ok(StageOutcome::new(output).with_deferred(
                    DeferredWork::new(SubJobKind::BulkEnrichment, ctx.payload_ref()),
                )),
                Script::Overtaken => {
                    if n == 1 {
                        self.checkpoints
                            .append(ctx.job_id(), &self.name, ctx.ordinal(), output.clone(), Utc::now())
                            .await
                            .unwrap();
                    }
                    Ok(StageOutcome::new(output))
                }
            }
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        jobs: Arc<InMemoryJobStore>,
        checkpoints: Arc<InMemoryCheckpointStore>,
        stages: HashMap<String, Arc<ScriptedStage>>,
    }

    fn harness(scripts: &[(&str, Script)]) -> Harness {
        let jobs = InMemoryJobStore::arc();
        let checkpoints = InMemoryCheckpointStore::arc();
        let mut stages = HashMap::new();
        let mut executors: Vec<Arc<dyn Stage>> = Vec::new();
        for (name, script) in scripts {
            let stage = ScriptedStage::new(name, *script, checkpoints.clone());
            stages.insert(name.to_string(), stage.clone());
            executors.push(stage);
        }
        let definition =
            PipelineDefinition::new("test", scripts.iter().map(|(n, _)| (*n, 25u32))).unwrap();

        let mut registry = PipelineRegistry::new();
        registry.register(&JobKind::custom("test"), Pipeline::new(definition, executors).unwrap());
        let bulk = PipelineDefinition::new("bulk", [("enrich_batch", 100)]).unwrap();
        let bulk_stage: Vec<Arc<dyn Stage>> = vec![ScriptedStage::new("enrich_batch", Script::Succeed, checkpoints.clone())];
        registry.register(
            &JobKind::SubJob(SubJobKind::BulkEnrichment),
            Pipeline::new(bulk, bulk_stage).unwrap(),
        );

        let config = OrchestratorConfig {
            retry: RetryPolicy::fixed(3, Duration::from_millis(1)),
            heartbeat_interval: Duration::from_millis(20),
            ..Default::default()
        };
        Harness {
            orchestrator: Orchestrator::new(jobs.clone(), checkpoints.clone(), Arc::new(registry), config),
            jobs,
            checkpoints,
            stages,
        }
    }

    fn calls(h: &Harness, stage: &str) -> u32 {
        h.stages[stage].calls.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn runs_every_stage_and_completes() {
        let h = harness(&[("a", Script::Succeed), ("b", Script::Succeed), ("c", Script::Succeed)]);
        let job = h.orchestrator.submit(JobKind::custom("test"), "doc").await.unwrap();

        let status = h.orchestrator.run_job(job.id).await.unwrap();
        assert_eq!(status, JobStatus::Completed);

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.progress_percent, 100);
        assert_eq!(stored.current_stage.as_deref(), Some("c"));
        assert!(stored.owner.is_none());
        assert_eq!(h.checkpoints.list(job.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn submit_rejects_unknown_kinds() {
        let h = harness(&[("a", Script::Succeed)]);
        assert!(matches!(
            h.orchestrator.submit(JobKind::custom("nope"), "doc").await,
            Err(OrchestratorError::UnknownKind(_))
        ));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_within_the_stage() {
        let h = harness(&[("a", Script::FailTransient(2)), ("b", Script::Succeed)]);
        let job = h.orchestrator.submit(JobKind::custom("test"), "doc").await.unwrap();
        assert_eq!(h.orchestrator.run_job(job.id).await.unwrap(), JobStatus::Completed);
        assert_eq!(calls(&h, "a"), 3);
    }

    #[tokio::test]
    async fn terminal_failure_stops_the_pipeline_and_keeps_progress() {
        let h = harness(&[("a", Script::Succeed), ("b", Script::FailTerminal), ("c", Script::Succeed)]);
        let job = h.orchestrator.submit(JobKind::custom("test"), "doc").await.unwrap();

        assert_eq!(h.orchestrator.run_job(job.id).await.unwrap(), JobStatus::Failed);
        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        let error = stored.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Terminal);
        assert!(error.message.contains("stage b"));
        assert_eq!(stored.current_stage.as_deref(), Some("b"));
        assert_eq!(stored.progress_percent, 33);
        assert_eq!(calls(&h, "b"), 1);
        assert_eq!(calls(&h, "c"), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_record_a_retryable_error() {
        let h = harness(&[("a", Script::FailTransient(10))]);
        let job = h.orchestrator.submit(JobKind::custom("test"), "doc").await.unwrap();
        assert_eq!(h.orchestrator.run_job(job.id).await.unwrap(), JobStatus::Failed);
        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.error.unwrap().kind, ErrorKind::Retryable);
        assert_eq!(calls(&h, "a"), 3);
    }

    #[tokio::test]
    async fn terminal_jobs_are_left_untouched() {
        let h = harness(&[("a", Script::Succeed)]);
        let job = h.orchestrator.submit(JobKind::custom("test"), "doc").await.unwrap();
        h.orchestrator.run_job(job.id).await.unwrap();
        let before = h.jobs.get(job.id).await.unwrap().unwrap();

        assert_eq!(h.orchestrator.run_job(job.id).await.unwrap(), JobStatus::Completed);
        let after = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(after.updated_at, before.updated_at);
        assert_eq!(calls(&h, "a"), 1);
    }

    #[tokio::test]
    async fn resume_after_failure_skips_checkpointed_stages() {
        let h = harness(&[("a", Script::Succeed), ("b", Script::FailTransient(3)), ("c", Script::Succeed)]);
        let job = h.orchestrator.submit(JobKind::custom("test"), "doc").await.unwrap();
        assert_eq!(h.orchestrator.run_job(job.id).await.unwrap(), JobStatus::Failed);

        // b has used its three failures; the manual resume gets through.
        assert_eq!(h.orchestrator.resume_job(job.id).await.unwrap(), JobStatus::Completed);
        assert_eq!(calls(&h, "a"), 1);
        assert_eq!(calls(&h, "b"), 4);
        assert_eq!(calls(&h, "c"), 1);
        assert!(h.jobs.get(job.id).await.unwrap().unwrap().error.is_none());
    }

    #[tokio::test]
    async fn checkpoint_from_a_lapsed_owner_is_kept_and_the_job_continues() {
        let h = harness(&[("a", Script::Succeed), ("b", Script::Overtaken), ("c", Script::Succeed)]);
        let job = h.orchestrator.submit(JobKind::custom("test"), "doc").await.unwrap();

        assert_eq!(h.orchestrator.run_job(job.id).await.unwrap(), JobStatus::Completed);
        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert!(stored.error.is_none());
        assert_eq!(stored.progress_percent, 100);
        assert_eq!(calls(&h, "b"), 1);
        assert_eq!(calls(&h, "c"), 1);

        let ordinals: Vec<u32> = h
            .checkpoints
            .list(job.id)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.stage_ordinal)
            .collect();
        assert_eq!(ordinals, [0, 1, 2]);
    }

    #[tokio::test]
    async fn live_claims_are_refused() {
        let h = harness(&[("a", Script::Succeed)]);
        let job = h.orchestrator.submit(JobKind::custom("test"), "doc").await.unwrap();
        let now = Utc::now();
        h.jobs.claim(job.id, OwnerToken::new(), now, now).await.unwrap();

        assert!(matches!(
            h.orchestrator.run_job(job.id).await,
            Err(OrchestratorError::AlreadyActive(_))
        ));
        assert!(matches!(
            h.orchestrator.request_resume(job.id).await,
            Err(OrchestratorError::AlreadyActive(_))
        ));
    }

    #[tokio::test]
    async fn cancel_request_is_honoured_at_the_next_boundary() {
        let h = harness(&[("a", Script::Succeed), ("b", Script::Succeed)]);
        let job = h.orchestrator.submit(JobKind::custom("test"), "doc").await.unwrap();

        // Owned running job: cancellation is only flagged.
        let owner = OwnerToken::new();
        let now = Utc::now();
        h.jobs.claim(job.id, owner, now, now).await.unwrap();
        let flagged = h.orchestrator.cancel_job(job.id).await.unwrap();
        assert_eq!(flagged.status, JobStatus::Running);
        assert!(flagged.cancel_requested);

        // Pretend the owner crashed; the next executor stops before stage a.
        h.jobs.note_resume_attempt(job.id, Some(owner), Utc::now()).await.unwrap();
        assert_eq!(h.orchestrator.run_job(job.id).await.unwrap(), JobStatus::Cancelled);
        assert_eq!(calls(&h, "a"), 0);
    }

    #[tokio::test]
    async fn queued_jobs_cancel_immediately() {
        let h = harness(&[("a", Script::Succeed)]);
        let job = h.orchestrator.submit(JobKind::custom("test"), "doc").await.unwrap();
        let cancelled = h.orchestrator.cancel_job(job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(h.orchestrator.run_job(job.id).await.unwrap(), JobStatus::Cancelled);
        assert_eq!(calls(&h, "a"), 0);
    }

    #[tokio::test]
    async fn deferred_work_spawns_one_sub_job_and_parent_continues() {
        let h = harness(&[("a", Script::Defer), ("b", Script::Succeed)]);
        let job = h.orchestrator.submit(JobKind::custom("test"), "doc").await.unwrap();

        assert_eq!(h.orchestrator.run_job(job.id).await.unwrap(), JobStatus::Completed);
        let children = h.orchestrator.sub_jobs(job.id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].status, JobStatus::Queued);
        let parent = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(parent.sub_job_ids, vec![children[0].id]);

        // Sub-jobs run on their own.
        assert_eq!(
            h.orchestrator.run_job(children[0].id).await.unwrap(),
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn unroutable_jobs_fail_terminally() {
        let h = harness(&[("a", Script::Succeed)]);
        let job = h
            .jobs
            .insert(Job::new(JobKind::custom("orphan"), "doc"))
            .await
            .unwrap();
        assert_eq!(h.orchestrator.run_job(job.id).await.unwrap(), JobStatus::Failed);
        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.error.unwrap().kind, ErrorKind::Terminal);
    }
}
