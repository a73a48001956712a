//! Stage executors and the pipelines built from them.

pub mod fanout;
pub mod registry;
pub mod stage;
pub mod stages;

pub use fanout::for_each_bounded;
pub use registry::{Pipeline, PipelineRegistry, StandardStages};
pub use stage::{DeferredWork, Stage, StageContext, StageError, StageOutcome};
pub use stages::{BulkEnrichmentStage, EmbedStage, EnrichmentStage};
