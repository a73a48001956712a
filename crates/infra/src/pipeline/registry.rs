//! Job kind → pipeline routing.

use std::collections::HashMap;
use std::sync::Arc;

use docpipe_core::{DomainError, DomainResult, PipelineDefinition};
use docpipe_enrichment::{ContentSource, Enrichment};

use super::stage::{DeferredWork, Stage};
use super::stages::{BulkEnrichmentStage, EmbedStage, EnrichmentStage};
use crate::jobs::{JobKind, SubJobKind};
use crate::search::VectorStore;

/// A pipeline definition paired with the stage executors that implement it.
pub struct Pipeline {
    definition: PipelineDefinition,
    stages: Vec<Arc<dyn Stage>>,
}

impl Pipeline {
    /// Stage executors must line up with the definition one-to-one, by name.
    pub fn new(definition: PipelineDefinition, stages: Vec<Arc<dyn Stage>>) -> DomainResult<Self> {
        if stages.len() != definition.stages().len() {
            return Err(DomainError::validation(format!(
                "pipeline {} defines {} stages but {} executors were given",
                definition.name(),
                definition.stages().len(),
                stages.len()
            )));
        }
        for (def, stage) in definition.stages().iter().zip(&stages) {
            if def.name != stage.name() {
                return Err(DomainError::validation(format!(
                    "stage {} is implemented by executor {}",
                    def.name,
                    stage.name()
                )));
            }
        }
        Ok(Self { definition, stages })
    }

    pub fn definition(&self) -> &PipelineDefinition {
        &self.definition
    }

    pub fn stage(&self, ordinal: u32) -> Option<&Arc<dyn Stage>> {
        self.stages.get(ordinal as usize)
    }
}

/// Pipelines keyed by job kind name.
#[derive(Default)]
pub struct PipelineRegistry {
    pipelines: HashMap<String, Arc<Pipeline>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: &JobKind, pipeline: Pipeline) {
        self.pipelines
            .insert(kind.type_name().to_string(), Arc::new(pipeline));
    }

    pub fn get(&self, kind: &JobKind) -> Option<Arc<Pipeline>> {
        self.pipelines.get(kind.type_name()).cloned()
    }

    pub fn contains(&self, kind: &JobKind) -> bool {
        self.pipelines.contains_key(kind.type_name())
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.pipelines.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Document processing plus the sub-job pipelines it spawns.
    pub fn standard(deps: StandardStages) -> DomainResult<Self> {
        let mut registry = Self::new();
        let StandardStages {
            enrichment,
            content,
            vectors,
            spaces,
            stage_concurrency,
            batch_size,
        } = deps;

        let embed = |name: &str| -> Arc<dyn Stage> {
            Arc::new(EmbedStage::new(
                name,
                content.clone(),
                enrichment.clone(),
                vectors.clone(),
                spaces.clone(),
                stage_concurrency,
            ))
        };

        let document: Vec<Arc<dyn Stage>> = vec![
            Arc::new(EnrichmentStage::new("ingest", enrichment.clone(), "documents")),
            Arc::new(EnrichmentStage::new("extract", enrichment.clone(), "chunks")),
            Arc::new(
                EnrichmentStage::new("classify", enrichment.clone(), "labels")
                    .with_deferred(DeferredWork::new(SubJobKind::BulkEnrichment, "")),
            ),
            embed("embed"),
            Arc::new(EnrichmentStage::new("relate", enrichment.clone(), "relations")),
        ];
        registry.register(
            &JobKind::DocumentProcessing,
            Pipeline::new(PipelineDefinition::document_processing(), document)?,
        );

        registry.register(
            &JobKind::SubJob(SubJobKind::BulkEnrichment),
            Pipeline::new(
                PipelineDefinition::new("bulk_enrichment", [("enrich_batch", 100)])?,
                vec![Arc::new(BulkEnrichmentStage::new(
                    "enrich_batch",
                    content.clone(),
                    enrichment.clone(),
                    batch_size,
                    stage_concurrency,
                ))],
            )?,
        );

        registry.register(
            &JobKind::SubJob(SubJobKind::EmbeddingBackfill),
            Pipeline::new(
                PipelineDefinition::new("embedding_backfill", [("backfill", 100)])?,
                vec![embed("backfill")],
            )?,
        );

        Ok(registry)
    }
}

/// Dependencies of the standard pipelines.
#[derive(Clone)]
pub struct StandardStages {
    pub enrichment: Arc<dyn Enrichment>,
    pub content: Arc<dyn ContentSource>,
    pub vectors: Arc<dyn VectorStore>,
    pub spaces: Vec<String>,
    pub stage_concurrency: usize,
    pub batch_size: usize,
}
