//! Postgres pool and schema wiring.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use docpipe_enrichment::ContentStore;

use crate::checkpoint::{CheckpointStore, PostgresCheckpointStore};
use crate::content::PostgresContentStore;
use crate::jobs::{JobStore, PostgresJobStore};
use crate::search::{PgVectorStore, VectorStore};

const SCHEMA: &str = include_str!("../migrations/0001_pipeline.sql");

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
}

/// Apply the pipeline schema. Every statement is `IF NOT EXISTS`, so this
/// is safe to run on each start.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    info!("pipeline schema ensured");
    Ok(())
}

/// The pipeline stores over one shared pool.
#[derive(Clone)]
pub struct PostgresStores {
    pub jobs: Arc<dyn JobStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub content: Arc<dyn ContentStore>,
    pub vectors: Arc<dyn VectorStore>,
}

impl PostgresStores {
    pub fn new(pool: PgPool) -> Self {
        Self {
            jobs: Arc::new(PostgresJobStore::new(pool.clone())),
            checkpoints: Arc::new(PostgresCheckpointStore::new(pool.clone())),
            content: Arc::new(PostgresContentStore::new(pool.clone())),
            vectors: Arc::new(PgVectorStore::new(pool)),
        }
    }
}
