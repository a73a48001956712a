//! Infrastructure layer: job, checkpoint and content stores, the orchestrator and the
//! processes around it (worker pool, stuck-job monitor), and multi-vector
//! search.

pub mod checkpoint;
pub mod config;
pub mod content;
pub mod db;
pub mod heartbeat;
pub mod jobs;
pub mod monitor;
pub mod orchestrator;
pub mod pipeline;
pub mod retry;
pub mod search;
pub mod subjobs;
pub mod worker;

pub use config::{ConfigError, PipelineConfig};
pub use content::PostgresContentStore;
pub use monitor::{MonitorConfig, MonitorDecision, MonitorHandle, StuckJobMonitor};
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorError};
pub use worker::{JobWorker, JobWorkerConfig, JobWorkerHandle, WorkerStats};
