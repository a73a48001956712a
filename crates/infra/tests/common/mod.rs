#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use docpipe_core::{JobId, PipelineDefinition, StageOutputRef};
use docpipe_infra::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use docpipe_infra::jobs::{InMemoryJobStore, Job, JobKind, JobStore, SubJobKind};
use docpipe_infra::pipeline::{
    DeferredWork, Pipeline, PipelineRegistry, Stage, StageContext, StageError, StageOutcome,
};
use docpipe_infra::retry::RetryPolicy;
use docpipe_infra::{Orchestrator, OrchestratorConfig};

#[derive(Clone)]
pub enum Behavior {
    Succeed,
    /// Never returns; stands in for a process that dies mid-stage.
    Hang,
    FailTerminal,
    DeferRequired(SubJobKind),
    DeferBestEffort(SubJobKind),
}

pub struct CountingStage {
    name: String,
    behavior: Behavior,
    calls: AtomicU32,
}

impl CountingStage {
    pub fn new(name: &str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            behavior,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for CountingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let output = StageOutputRef::items(format!("{}/{}", self.name, ctx.job_id()), 1);
        match &self.behavior {
            Behavior::Succeed => Ok(StageOutcome::new(output)),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                Ok(StageOutcome::new(output))
            }
            Behavior::FailTerminal => Err(StageError::InvalidInput("rejected by enrichment".into())),
            Behavior::DeferRequired(kind) => Ok(StageOutcome::new(output).with_deferred(
                DeferredWork::new(kind.clone(), ctx.payload_ref()).required(),
            )),
            Behavior::DeferBestEffort(kind) => Ok(StageOutcome::new(output)
                .with_deferred(DeferredWork::new(kind.clone(), ctx.payload_ref()))),
        }
    }
}

/// Stores that outlive any one orchestrator, the way a database outlives a process.
#[derive(Clone)]
pub struct Durable {
    pub jobs: Arc<InMemoryJobStore>,
    pub checkpoints: Arc<InMemoryCheckpointStore>,
}

impl Durable {
    pub fn new() -> Self {
        Self {
            jobs: InMemoryJobStore::arc(),
            checkpoints: InMemoryCheckpointStore::arc(),
        }
    }

    pub async fn job(&self, id: JobId) -> Job {
        self.jobs.get(id).await.unwrap().unwrap()
    }

    pub async fn latest_ordinal(&self, id: JobId) -> Option<u32> {
        self.checkpoints
            .get_latest(id)
            .await
            .unwrap()
            .map(|c| c.stage_ordinal)
    }
}

pub fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        retry: RetryPolicy::fixed(2, Duration::from_millis(1)),
        stage_timeout: None,
        heartbeat_interval: Duration::from_millis(10),
        heartbeat_timeout: Duration::from_millis(100),
    }
}

/// Register `stages` under `kind`, equal weights.
pub fn register(registry: &mut PipelineRegistry, kind: &JobKind, stages: &[Arc<CountingStage>]) {
    let weight = 100 / stages.len() as u32;
    let definition = PipelineDefinition::new(
        kind.type_name(),
        stages.iter().map(|s| (s.name().to_string(), weight)),
    )
    .unwrap();
    let executors: Vec<Arc<dyn Stage>> = stages.iter().map(|s| s.clone() as Arc<dyn Stage>).collect();
    registry.register(kind, Pipeline::new(definition, executors).unwrap());
}

pub fn orchestrator(stores: &Durable, registry: PipelineRegistry) -> Orchestrator {
    Orchestrator::new(
        stores.jobs.clone(),
        stores.checkpoints.clone(),
        Arc::new(registry),
        config(),
    )
}

/// Poll until `check` holds, failing the test after ~2s.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}
