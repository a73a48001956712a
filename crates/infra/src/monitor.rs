//! Stuck-job monitor.
//!
//! Periodically scans running jobs. A job whose heartbeat went stale is
//! released and re-run from its last checkpoint, up to a resume budget; a job
//! past the hard timeout is failed outright. Parents parked on required
//! sub-jobs are exempt from both checks and are resumed once their children
//! settle.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use docpipe_core::{ErrorKind, JobError, JobId};

use crate::jobs::Job;
use crate::orchestrator::{Orchestrator, OrchestratorError, to_chrono};
use crate::subjobs::SubJobSettlement;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub scan_interval: Duration,
    /// A running job silent for longer than this is considered stuck.
    pub heartbeat_timeout: Duration,
    /// A running job with no progress for longer than this is failed.
    pub hard_timeout: Duration,
    pub max_resume_attempts: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            heartbeat_timeout: Duration::from_secs(300),
            hard_timeout: Duration::from_secs(30 * 60),
            max_resume_attempts: 3,
        }
    }
}

/// What a scan did with one running job.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorDecision {
    Healthy,
    /// Stale claim released; a run from the last checkpoint was started.
    Resumed { attempt: u32 },
    Failed { reason: ErrorKind },
    AwaitingSubJobs { pending: usize },
    /// Waiting parent whose children settled; a run to finish it was started.
    ResumedParent,
    /// The job moved on between listing and acting.
    Skipped,
}

impl MonitorDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorDecision::Healthy => "healthy",
            MonitorDecision::Resumed { .. } => "resumed",
            MonitorDecision::Failed { .. } => "failed",
            MonitorDecision::AwaitingSubJobs { .. } => "awaiting_sub_jobs",
            MonitorDecision::ResumedParent => "resumed_parent",
            MonitorDecision::Skipped => "skipped",
        }
    }
}

pub struct StuckJobMonitor {
    orchestrator: Orchestrator,
    config: MonitorConfig,
}

impl StuckJobMonitor {
    pub fn new(orchestrator: Orchestrator, config: MonitorConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Inspect every running job once, as of `now`.
    ///
    /// Errors on individual jobs are logged and reported as [`MonitorDecision::Skipped`];
    /// only failing to list running jobs aborts the scan.
    pub async fn scan_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<(JobId, MonitorDecision)>, OrchestratorError> {
        let running = self.orchestrator.jobs().list_running().await?;
        let mut decisions = Vec::with_capacity(running.len());

        for job in running {
            let decision = match self.inspect(&job, now).await {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "monitor could not act on job");
                    MonitorDecision::Skipped
                }
            };
            match &decision {
                MonitorDecision::Healthy => {
                    debug!(job_id = %job.id, decision = decision.as_str(), "monitor scan")
                }
                _ => info!(
                    job_id = %job.id,
                    kind = %job.kind,
                    decision = decision.as_str(),
                    resume_attempts = job.resume_attempts,
                    "monitor scan"
                ),
            }
            decisions.push((job.id, decision));
        }

        Ok(decisions)
    }

    async fn inspect(
        &self,
        job: &Job,
        now: DateTime<Utc>,
    ) -> Result<MonitorDecision, OrchestratorError> {
        if job.waiting_on_sub_jobs {
            return match self.orchestrator.subjobs().settlement(job.id).await? {
                SubJobSettlement::Pending(pending) => Ok(MonitorDecision::AwaitingSubJobs {
                    pending: pending.len(),
                }),
                _ => {
                    self.run_detached(job.id, "resumed parent");
                    Ok(MonitorDecision::ResumedParent)
                }
            };
        }

        let idle = now - job.updated_at;
        if idle > to_chrono(self.config.hard_timeout) {
            let error = JobError::stuck(format!(
                "no progress for {}s (hard timeout {}s)",
                idle.num_seconds(),
                self.config.hard_timeout.as_secs()
            ));
            return self.force_fail(job, error, now).await;
        }

        let silent = now - job.last_alive_at();
        if silent <= to_chrono(self.config.heartbeat_timeout) {
            return Ok(MonitorDecision::Healthy);
        }

        if job.resume_attempts >= self.config.max_resume_attempts {
            let error = JobError::stuck(format!(
                "heartbeat silent for {}s after {} automatic resume attempt(s)",
                silent.num_seconds(),
                job.resume_attempts
            ));
            return self.force_fail(job, error, now).await;
        }

        let Some(released) = self
            .orchestrator
            .jobs()
            .note_resume_attempt(job.id, job.owner, now)
            .await?
        else {
            return Ok(MonitorDecision::Skipped);
        };

        self.run_detached(released.id, "auto-resumed job");
        Ok(MonitorDecision::Resumed {
            attempt: released.resume_attempts,
        })
    }

    /// Drive `job_id` on its own task so one slow pipeline never holds up a scan.
    fn run_detached(&self, job_id: JobId, what: &'static str) {
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            match orchestrator.run_job(job_id).await {
                Ok(status) => info!(job_id = %job_id, status = %status, "{what} finished"),
                Err(OrchestratorError::AlreadyActive(_)) => {
                    debug!(job_id = %job_id, "{what} already driven elsewhere")
                }
                Err(e) => warn!(job_id = %job_id, error = %e, "{what} aborted"),
            }
        });
    }

    async fn force_fail(
        &self,
        job: &Job,
        error: JobError,
        now: DateTime<Utc>,
    ) -> Result<MonitorDecision, OrchestratorError> {
        let reason = error.kind;
        if self
            .orchestrator
            .jobs()
            .fail_running(job.id, job.owner, error, now)
            .await?
        {
            Ok(MonitorDecision::Failed { reason })
        } else {
            Ok(MonitorDecision::Skipped)
        }
    }

    /// Scan every `scan_interval` until the handle is shut down.
    pub fn spawn(self: Arc<Self>) -> MonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            info!(
                scan_interval_secs = self.config.scan_interval.as_secs(),
                heartbeat_timeout_secs = self.config.heartbeat_timeout.as_secs(),
                hard_timeout_secs = self.config.hard_timeout.as_secs(),
                "stuck-job monitor started"
            );
            let mut ticker = tokio::time::interval(self.config.scan_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.scan_at(Utc::now()).await {
                            error!(error = %e, "stuck-job scan failed");
                        }
                    }
                }
            }
            info!("stuck-job monitor stopped");
        });

        MonitorHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

/// Handle to stop a spawned monitor.
#[derive(Debug)]
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::jobs::{ClaimOutcome, InMemoryJobStore, JobKind, JobStatus, JobStore};
    use crate::orchestrator::OrchestratorConfig;
    use crate::pipeline::{PipelineRegistry, StandardStages};
    use crate::search::InMemoryVectorStore;
    use docpipe_core::OwnerToken;
    use docpipe_enrichment::{InMemoryContentSource, LocalEnrichment};

    fn monitor(max_resume_attempts: u32) -> (StuckJobMonitor, Arc<InMemoryJobStore>) {
        let jobs = InMemoryJobStore::arc();
        let registry = PipelineRegistry::standard(StandardStages {
            enrichment: Arc::new(LocalEnrichment::new("local", 8)),
            content: Arc::new(InMemoryContentSource::new()),
            vectors: InMemoryVectorStore::arc(),
            spaces: vec!["text".into()],
            stage_concurrency: 2,
            batch_size: 10,
        })
        .unwrap();
        let orchestrator = Orchestrator::new(
            jobs.clone(),
            InMemoryCheckpointStore::arc(),
            Arc::new(registry),
            OrchestratorConfig {
                heartbeat_timeout: Duration::from_secs(60),
                ..Default::default()
            },
        );
        let config = MonitorConfig {
            scan_interval: Duration::from_millis(10),
            heartbeat_timeout: Duration::from_secs(60),
            hard_timeout: Duration::from_secs(600),
            max_resume_attempts,
        };
        (StuckJobMonitor::new(orchestrator, config), jobs)
    }

    /// A job claimed at `at` by an executor that then went silent.
    async fn abandoned(jobs: &InMemoryJobStore, at: DateTime<Utc>) -> Job {
        let job = jobs
            .insert(Job::new(JobKind::DocumentProcessing, "doc"))
            .await
            .unwrap();
        let owner = OwnerToken::new();
        let stale_before = at - chrono::Duration::seconds(60);
        match jobs.claim(job.id, owner, at, stale_before).await.unwrap() {
            ClaimOutcome::Claimed(job) => job,
            other => panic!("unexpected claim outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fresh_jobs_are_healthy() {
        let (monitor, jobs) = monitor(3);
        let now = Utc::now();
        let job = abandoned(&jobs, now).await;

        let decisions = monitor.scan_at(now + chrono::Duration::seconds(30)).await.unwrap();
        assert_eq!(decisions, vec![(job.id, MonitorDecision::Healthy)]);
    }

    #[tokio::test]
    async fn stale_heartbeat_is_resumed_from_checkpoint() {
        let (monitor, jobs) = monitor(3);
        let now = Utc::now() - chrono::Duration::seconds(120);
        let job = abandoned(&jobs, now).await;

        let decisions = monitor.scan_at(Utc::now()).await.unwrap();
        assert_eq!(decisions, vec![(job.id, MonitorDecision::Resumed { attempt: 1 })]);

        for _ in 0..200 {
            if jobs.get(job.id).await.unwrap().unwrap().is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let done = jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.resume_attempts, 1);
    }

    #[tokio::test]
    async fn exhausted_resume_budget_fails_the_job() {
        let (monitor, jobs) = monitor(0);
        let now = Utc::now() - chrono::Duration::seconds(120);
        let job = abandoned(&jobs, now).await;

        let decisions = monitor.scan_at(Utc::now()).await.unwrap();
        assert_eq!(
            decisions,
            vec![(
                job.id,
                MonitorDecision::Failed {
                    reason: ErrorKind::StuckJobTimeout
                }
            )]
        );
        let failed = jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.unwrap().kind, ErrorKind::StuckJobTimeout);
        assert!(failed.owner.is_none());
    }

    #[tokio::test]
    async fn spawned_monitor_resumes_within_a_scan_and_stops_on_shutdown() {
        let (monitor, jobs) = monitor(3);
        let stalled = abandoned(&jobs, Utc::now() - chrono::Duration::seconds(120)).await;

        let handle = Arc::new(monitor).spawn();
        for _ in 0..200 {
            if jobs.get(stalled.id).await.unwrap().unwrap().is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let done = jobs.get(stalled.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.resume_attempts, 1);

        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .expect("monitor did not stop");

        // Nothing scans any more.
        let later = abandoned(&jobs, Utc::now() - chrono::Duration::seconds(120)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let untouched = jobs.get(later.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, JobStatus::Running);
        assert_eq!(untouched.resume_attempts, 0);
        assert_eq!(untouched.owner, later.owner);
    }

    #[tokio::test]
    async fn hard_timeout_wins_over_a_live_heartbeat() {
        let (monitor, jobs) = monitor(3);
        let claimed_at = Utc::now() - chrono::Duration::seconds(900);
        let job = abandoned(&jobs, claimed_at).await;
        let now = Utc::now();
        assert!(
            jobs.heartbeat(job.id, job.owner.unwrap(), now)
                .await
                .unwrap()
        );

        let decisions = monitor.scan_at(now).await.unwrap();
        assert_eq!(
            decisions,
            vec![(
                job.id,
                MonitorDecision::Failed {
                    reason: ErrorKind::StuckJobTimeout
                }
            )]
        );
    }
}
