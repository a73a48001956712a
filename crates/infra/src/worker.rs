//! Job worker pool.
//!
//! Polls the job store for queued jobs and drives each on its own tokio task
//! through [`Orchestrator::run_job`], at most `max_concurrent` at a time.
//! When a sub-job finishes, its parent is resumed if it was only waiting on
//! required children.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use docpipe_core::JobId;

use crate::jobs::{Job, JobStatus};
use crate::orchestrator::{Orchestrator, OrchestratorError};

/// Job worker configuration.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// How often to poll for new jobs
    pub poll_interval: Duration,
    /// Maximum concurrently driven jobs
    pub max_concurrent: usize,
    /// Name for logging
    pub name: String,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            max_concurrent: 4,
            name: "job-worker".to_string(),
        }
    }
}

impl JobWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    /// Runs that ended with the job parked on required sub-jobs
    pub jobs_waiting: u64,
    /// Runs that ended in an orchestrator error (lost claim, storage)
    pub run_errors: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn record(&mut self, result: &Result<JobStatus, OrchestratorError>) {
        self.jobs_processed += 1;
        match result {
            Ok(JobStatus::Completed) => self.jobs_completed += 1,
            Ok(JobStatus::Failed) => self.jobs_failed += 1,
            Ok(JobStatus::Cancelled) => self.jobs_cancelled += 1,
            Ok(JobStatus::Running) => self.jobs_waiting += 1,
            Ok(JobStatus::Queued) => {}
            Err(_) => self.run_errors += 1,
        }
    }
}

fn lock(stats: &Mutex<WorkerStats>) -> MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct JobWorkerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl JobWorkerHandle {
    /// Stop polling and wait for in-flight jobs to finish their current run.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    /// Get current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        lock(&self.stats).clone()
    }
}

/// Background job worker.
pub struct JobWorker {
    orchestrator: Orchestrator,
    config: JobWorkerConfig,
}

impl JobWorker {
    pub fn new(orchestrator: Orchestrator, config: JobWorkerConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Spawn the polling loop on the current tokio runtime.
    pub fn spawn(self) -> JobWorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let join = tokio::spawn(worker_loop(self, shutdown_rx, stats.clone()));

        JobWorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

async fn worker_loop(
    worker: JobWorker,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    let JobWorker {
        orchestrator,
        config,
    } = worker;
    info!(worker = %config.name, max_concurrent = config.max_concurrent, "job worker started");

    let started = Instant::now();
    let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
    let in_flight: Arc<Mutex<HashSet<JobId>>> = Arc::new(Mutex::new(HashSet::new()));
    let mut tasks: JoinSet<()> = JoinSet::new();

    loop {
        while let Some(done) = tasks.try_join_next() {
            if let Err(e) = done {
                error!(worker = %config.name, error = %e, "job task panicked");
            }
        }
        if *shutdown.borrow() {
            break;
        }
        lock(&stats).uptime_secs = started.elapsed().as_secs();

        let free = permits.available_permits();
        if free > 0 {
            let busy = in_flight.lock().unwrap_or_else(PoisonError::into_inner).len();
            match orchestrator.jobs().next_queued(free + busy).await {
                Ok(queued) => {
                    for job in queued {
                        let Ok(permit) = permits.clone().try_acquire_owned() else {
                            break;
                        };
                        if !in_flight
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(job.id)
                        {
                            continue;
                        }
                        debug!(worker = %config.name, job_id = %job.id, kind = %job.kind, "dispatching job");
                        lock(&stats).current_running += 1;

                        let orchestrator = orchestrator.clone();
                        let stats = stats.clone();
                        let in_flight = in_flight.clone();
                        tasks.spawn(async move {
                            let _permit = permit;
                            drive(&orchestrator, &job, &stats).await;
                            in_flight
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .remove(&job.id);
                        });
                    }
                }
                Err(e) => error!(worker = %config.name, error = %e, "failed to poll queued jobs"),
            }
        }

        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
    }

    while tasks.join_next().await.is_some() {}
    info!(worker = %config.name, "job worker stopped");
}

async fn drive(orchestrator: &Orchestrator, job: &Job, stats: &Mutex<WorkerStats>) {
    let result = orchestrator.run_job(job.id).await;
    match &result {
        Ok(status) => debug!(job_id = %job.id, status = %status, "job run finished"),
        Err(OrchestratorError::AlreadyActive(_)) => {
            debug!(job_id = %job.id, "job picked up elsewhere")
        }
        Err(e) => warn!(job_id = %job.id, error = %e, "job run aborted"),
    }

    {
        let mut s = lock(stats);
        s.current_running = s.current_running.saturating_sub(1);
        s.record(&result);
    }

    // A finished sub-job may unblock its parent. A job that just parked is
    // re-checked too, in case its children settled before it parked.
    let waiting = match (&result, job.parent_job_id) {
        (Ok(JobStatus::Running), _) => Some(job.id),
        (Ok(status), Some(parent)) if status.is_terminal() => Some(parent),
        _ => None,
    };
    if let Some(waiting) = waiting {
        match orchestrator.resume_parent_if_settled(waiting).await {
            Ok(Some(status)) => info!(job_id = %waiting, status = %status, "waiting parent resumed"),
            Ok(None) => {}
            Err(OrchestratorError::AlreadyActive(_)) => {}
            Err(e) => warn!(job_id = %waiting, error = %e, "failed to resume waiting parent"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::jobs::{InMemoryJobStore, JobKind, JobStore};
    use crate::orchestrator::OrchestratorConfig;
    use crate::pipeline::{PipelineRegistry, StandardStages};
    use crate::retry::RetryPolicy;
    use crate::search::InMemoryVectorStore;
    use docpipe_enrichment::{InMemoryContentSource, LocalEnrichment};

    fn orchestrator() -> (Orchestrator, Arc<InMemoryJobStore>) {
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
        let config = OrchestratorConfig {
            retry: RetryPolicy::fixed(2, Duration::from_millis(1)),
            heartbeat_interval: Duration::from_millis(50),
            ..Default::default()
        };
        (
            Orchestrator::new(jobs.clone(), InMemoryCheckpointStore::arc(), Arc::new(registry), config),
            jobs,
        )
    }

    async fn wait_until_settled(jobs: &InMemoryJobStore, ids: &[JobId]) {
        for _ in 0..200 {
            let mut all = true;
            for id in ids {
                if !jobs.get(*id).await.unwrap().unwrap().is_terminal() {
                    all = false;
                }
            }
            if all {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("jobs did not settle");
    }

    #[tokio::test]
    async fn drains_the_queue_and_reports_stats() {
        let (orchestrator, jobs) = orchestrator();
        let mut ids = Vec::new();
        for i in 0..5 {
            let job = orchestrator
                .submit(JobKind::DocumentProcessing, format!("doc-{i}"))
                .await
                .unwrap();
            ids.push(job.id);
        }

        let handle = JobWorker::new(
            orchestrator,
            JobWorkerConfig::default()
                .with_max_concurrent(2)
                .with_poll_interval(Duration::from_millis(5)),
        )
        .spawn();
        wait_until_settled(&jobs, &ids).await;

        for id in &ids {
            assert_eq!(jobs.get(*id).await.unwrap().unwrap().status, JobStatus::Completed);
        }

        // Each document spawns a best-effort bulk enrichment sub-job.
        let mut children = Vec::new();
        for id in &ids {
            children.extend(jobs.children(*id).await.unwrap().into_iter().map(|c| c.id));
        }
        assert_eq!(children.len(), 5);
        wait_until_settled(&jobs, &children).await;

        let stats = handle.stats();
        handle.shutdown().await;
        assert!(stats.jobs_completed >= 5);
        assert_eq!(stats.jobs_failed, 0);
    }

    #[test]
    fn stats_record_outcomes() {
        let mut stats = WorkerStats::default();
        stats.record(&Ok(JobStatus::Completed));
        stats.record(&Ok(JobStatus::Running));
        stats.record(&Err(OrchestratorError::AlreadyActive(JobId::new())));
        assert_eq!(stats.jobs_processed, 3);
        assert_eq!(stats.jobs_completed, 1);
        assert_eq!(stats.jobs_waiting, 1);
        assert_eq!(stats.run_errors, 1);
    }
}
