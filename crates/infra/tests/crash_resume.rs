//! A four-stage job whose process dies after stage 2 is checkpointed, then
//! restarted against the same stores.

mod common;

use std::time::Duration;

use common::{Behavior, CountingStage, Durable, eventually, orchestrator, register};
use docpipe_infra::jobs::{JobKind, JobStatus};
use docpipe_infra::pipeline::PipelineRegistry;
use docpipe_infra::{MonitorConfig, MonitorDecision, OrchestratorError, StuckJobMonitor};

fn four_stage() -> JobKind {
    JobKind::custom("four_stage")
}

/// Drive a job until stage 3 hangs, then kill the driving task.
async fn crash_after_stage_two(stores: &Durable) -> docpipe_core::JobId {
    let doomed = [
        CountingStage::new("ingest", Behavior::Succeed),
        CountingStage::new("extract", Behavior::Succeed),
        CountingStage::new("classify", Behavior::Hang),
        CountingStage::new("embed", Behavior::Succeed),
    ];
    let mut registry = PipelineRegistry::new();
    register(&mut registry, &four_stage(), &doomed);
    let first = orchestrator(stores, registry);

    let job = first.submit(four_stage(), "doc-42").await.unwrap();
    let run = tokio::spawn({
        let first = first.clone();
        let id = job.id;
        async move { first.run_job(id).await }
    });

    let hung = doomed[2].clone();
    eventually("stage 3 to start", || {
        let hung = hung.clone();
        async move { hung.calls() == 1 }
    })
    .await;
    run.abort();
    let _ = run.await;

    assert_eq!(stores.latest_ordinal(job.id).await, Some(1));
    let crashed = stores.job(job.id).await;
    assert_eq!(crashed.status, JobStatus::Running);
    assert_eq!(crashed.progress_percent, 50);
    assert_eq!(crashed.current_stage.as_deref(), Some("classify"));
    assert!(crashed.owner.is_some());
    job.id
}

fn fresh_stages() -> [std::sync::Arc<CountingStage>; 4] {
    [
        CountingStage::new("ingest", Behavior::Succeed),
        CountingStage::new("extract", Behavior::Succeed),
        CountingStage::new("classify", Behavior::Succeed),
        CountingStage::new("embed", Behavior::Succeed),
    ]
}

#[tokio::test]
async fn restart_resumes_after_the_last_checkpoint() {
    let stores = Durable::new();
    let job_id = crash_after_stage_two(&stores).await;

    let stages = fresh_stages();
    let mut registry = PipelineRegistry::new();
    register(&mut registry, &four_stage(), &stages);
    let restarted = orchestrator(&stores, registry);

    // The dead owner's claim is still fresh.
    assert!(matches!(
        restarted.run_job(job_id).await,
        Err(OrchestratorError::AlreadyActive(_))
    ));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(restarted.run_job(job_id).await.unwrap(), JobStatus::Completed);

    assert_eq!(stages[0].calls(), 0);
    assert_eq!(stages[1].calls(), 0);
    assert_eq!(stages[2].calls(), 1);
    assert_eq!(stages[3].calls(), 1);

    let done = stores.job(job_id).await;
    assert_eq!(done.progress_percent, 100);
    assert_eq!(done.current_stage.as_deref(), Some("embed"));
    assert!(done.owner.is_none());
    assert_eq!(stores.latest_ordinal(job_id).await, Some(3));

    // Terminal jobs are left alone.
    let before = stores.job(job_id).await.updated_at;
    assert_eq!(restarted.run_job(job_id).await.unwrap(), JobStatus::Completed);
    assert_eq!(stores.job(job_id).await.updated_at, before);
    assert_eq!(stages[3].calls(), 1);
}

#[tokio::test]
async fn monitor_resumes_a_crashed_job_within_one_scan() {
    let stores = Durable::new();
    let job_id = crash_after_stage_two(&stores).await;

    let stages = fresh_stages();
    let mut registry = PipelineRegistry::new();
    register(&mut registry, &four_stage(), &stages);
    let monitor = StuckJobMonitor::new(
        orchestrator(&stores, registry),
        MonitorConfig {
            scan_interval: Duration::from_millis(20),
            heartbeat_timeout: Duration::from_millis(100),
            hard_timeout: Duration::from_secs(60),
            max_resume_attempts: 2,
        },
    );

    let now = chrono::Utc::now() + chrono::Duration::milliseconds(500);
    let decisions = monitor.scan_at(now).await.unwrap();
    assert_eq!(decisions, vec![(job_id, MonitorDecision::Resumed { attempt: 1 })]);

    eventually("resumed job to complete", || {
        let stores = stores.clone();
        async move { stores.job(job_id).await.status == JobStatus::Completed }
    })
    .await;
    assert_eq!(stages[0].calls() + stages[1].calls(), 0);
    assert_eq!(stores.job(job_id).await.resume_attempts, 1);
}

#[tokio::test]
async fn monitor_fails_a_job_that_exhausted_its_resume_budget() {
    let stores = Durable::new();
    let job_id = crash_after_stage_two(&stores).await;

    // Restarted, but stage 3 hangs again every time.
    let stages = [
        CountingStage::new("ingest", Behavior::Succeed),
        CountingStage::new("extract", Behavior::Succeed),
        CountingStage::new("classify", Behavior::Hang),
        CountingStage::new("embed", Behavior::Succeed),
    ];
    let mut registry = PipelineRegistry::new();
    register(&mut registry, &four_stage(), &stages);
    let monitor = StuckJobMonitor::new(
        orchestrator(&stores, registry),
        MonitorConfig {
            scan_interval: Duration::from_millis(20),
            heartbeat_timeout: Duration::from_millis(100),
            hard_timeout: Duration::from_secs(60),
            max_resume_attempts: 1,
        },
    );

    let later = || chrono::Utc::now() + chrono::Duration::seconds(5);
    assert_eq!(
        monitor.scan_at(later()).await.unwrap(),
        vec![(job_id, MonitorDecision::Resumed { attempt: 1 })]
    );
    let hung = stages[2].clone();
    eventually("resumed stage 3 to start", || {
        let hung = hung.clone();
        async move { hung.calls() == 1 }
    })
    .await;

    let decisions = monitor.scan_at(later()).await.unwrap();
    assert_eq!(
        decisions,
        vec![(
            job_id,
            MonitorDecision::Failed {
                reason: docpipe_core::ErrorKind::StuckJobTimeout
            }
        )]
    );

    let failed = stores.job(job_id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(
        failed.error.map(|e| e.kind),
        Some(docpipe_core::ErrorKind::StuckJobTimeout)
    );
    assert_eq!(failed.progress_percent, 50);
}
