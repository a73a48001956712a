use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use docpipe_core::StageOutputRef;

use crate::error::EnrichmentError;

/// Input handed to an external enrichment operation.
///
/// `subject` identifies what to work on (a payload reference, an item key).
/// `context` is the output reference of the previous stage, when there is one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentInput {
    pub subject: String,
    pub context: Option<StageOutputRef>,
    pub params: JsonValue,
}

impl EnrichmentInput {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            context: None,
            params: JsonValue::Null,
        }
    }

    pub fn with_context(mut self, context: Option<StageOutputRef>) -> Self {
        self.context = context;
        self
    }

    pub fn with_params(mut self, params: JsonValue) -> Self {
        self.params = params;
        self
    }
}

/// Result of an external enrichment operation.
///
/// Not persisted as-is: stages turn it into a compact [`StageOutputRef`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentOutput {
    /// Number of items produced (chunks, products, relations, ...).
    pub items: u64,

    /// Embedding vector, for operations that derive one.
    pub vector: Option<Vec<f32>>,

    /// Free-form summary (model name, labels, timings).
    pub summary: JsonValue,
}

impl EnrichmentOutput {
    pub fn new(items: u64) -> Self {
        Self {
            items,
            vector: None,
            summary: JsonValue::Null,
        }
    }

    pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
        self.vector = Some(vector);
        self
    }

    pub fn with_summary(mut self, summary: JsonValue) -> Self {
        self.summary = summary;
        self
    }
}

/// An injected external capability (extraction, OCR, classification, embedding).
///
/// The orchestrator is agnostic to what the operation does; it only relies on
/// the error classification to decide between retrying and failing the job.
#[async_trait]
pub trait Enrichment: Send + Sync + 'static {
    /// Stable operation name, used in logs and output references.
    fn name(&self) -> &str;

    async fn invoke(&self, input: EnrichmentInput) -> Result<EnrichmentOutput, EnrichmentError>;
}
