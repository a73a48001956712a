//! Infrastructure wiring: stores, pipelines, orchestrator, search engine,
//! and the background worker pool + stuck-job monitor.

use std::sync::Arc;

use docpipe_enrichment::{ContentStore, HashEmbedder, InMemoryContentSource, LocalEnrichment};
use docpipe_infra::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use docpipe_infra::db::{self, PostgresStores};
use docpipe_infra::jobs::{InMemoryJobStore, JobStore};
use docpipe_infra::pipeline::{PipelineRegistry, StandardStages};
use docpipe_infra::search::{InMemoryVectorStore, RankingEngine, VectorStore};
use docpipe_infra::{
    JobWorker, JobWorkerHandle, MonitorHandle, Orchestrator, PipelineConfig, StuckJobMonitor,
};

/// Vector dimension of the local enrichment and query embedder.
pub const LOCAL_DIMENSION: usize = 256;

/// Shared application services, handed to handlers as an `Extension`.
#[derive(Clone)]
pub struct AppServices {
    pub orchestrator: Orchestrator,
    pub ranking: Arc<RankingEngine>,
    /// Document content the extraction stages read from.
    pub content: Arc<dyn ContentStore>,
    pub config: Arc<PipelineConfig>,
}

struct Stores {
    jobs: Arc<dyn JobStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    content: Arc<dyn ContentStore>,
    vectors: Arc<dyn VectorStore>,
}

impl Stores {
    fn in_memory() -> Self {
        Self {
            jobs: InMemoryJobStore::arc(),
            checkpoints: InMemoryCheckpointStore::arc(),
            content: Arc::new(InMemoryContentSource::new()),
            vectors: InMemoryVectorStore::arc(),
        }
    }
}

/// Build services backed by Postgres when `DATABASE_URL` is set, otherwise in memory.
pub async fn build_services(config: PipelineConfig) -> anyhow::Result<AppServices> {
    let stores = match config.database_url.as_deref() {
        Some(url) => {
            let pool = db::connect(url, config.worker_max_concurrent as u32 * 2 + 4).await?;
            db::ensure_schema(&pool).await?;
            tracing::info!("using postgres stores");
            let PostgresStores {
                jobs,
                checkpoints,
                content,
                vectors,
            } = PostgresStores::new(pool);
            Stores {
                jobs,
                checkpoints,
                content,
                vectors,
            }
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory stores");
            Stores::in_memory()
        }
    };

    assemble(config, stores)
}

/// In-memory services (dev/test).
pub fn build_in_memory_services(config: PipelineConfig) -> anyhow::Result<AppServices> {
    assemble(config, Stores::in_memory())
}

fn assemble(config: PipelineConfig, stores: Stores) -> anyhow::Result<AppServices> {
    let ranking_config = config.ranking();
    let spaces: Vec<String> = ranking_config
        .default_spaces
        .iter()
        .map(|s| s.space.clone())
        .collect();

    let content = stores.content;
    let registry = PipelineRegistry::standard(StandardStages {
        enrichment: Arc::new(LocalEnrichment::new("local", LOCAL_DIMENSION)),
        content: content.clone(),
        vectors: stores.vectors.clone(),
        spaces: spaces.clone(),
        stage_concurrency: config.stage_concurrency,
        batch_size: 32,
    })?;
    tracing::info!(kinds = ?registry.kinds(), "pipelines registered");

    let orchestrator = Orchestrator::new(
        stores.jobs,
        stores.checkpoints,
        Arc::new(registry),
        config.orchestrator(),
    );
    let ranking = Arc::new(RankingEngine::new(
        stores.vectors,
        Arc::new(HashEmbedder::new(spaces, LOCAL_DIMENSION)),
        ranking_config,
    ));

    Ok(AppServices {
        orchestrator,
        ranking,
        content,
        config: Arc::new(config),
    })
}

/// Worker pool and monitor running alongside the HTTP server.
pub struct Background {
    worker: JobWorkerHandle,
    monitor: MonitorHandle,
}

impl Background {
    pub fn start(services: &AppServices) -> Self {
        let worker = JobWorker::new(
            services.orchestrator.clone(),
            services.config.worker().with_name("docpipe-worker"),
        )
        .spawn();
        let monitor = Arc::new(StuckJobMonitor::new(
            services.orchestrator.clone(),
            services.config.monitor(),
        ))
        .spawn();
        Self { worker, monitor }
    }

    pub async fn shutdown(self) {
        self.monitor.shutdown().await;
        let stats = self.worker.stats();
        self.worker.shutdown().await;
        tracing::info!(
            processed = stats.jobs_processed,
            completed = stats.jobs_completed,
            failed = stats.jobs_failed,
            "background processing stopped"
        );
    }
}
