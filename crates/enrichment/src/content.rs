use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use docpipe_core::EntityId;

use crate::error::EnrichmentError;

/// One content unit produced by extraction (a chunk, a product, an image).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub entity_id: EntityId,
    pub text: String,
}

impl ContentItem {
    pub fn new(entity_id: EntityId, text: impl Into<String>) -> Self {
        Self {
            entity_id,
            text: text.into(),
        }
    }
}

/// Read access to the content a job's earlier stages produced.
///
/// Stages fetch items on demand instead of holding them across stages.
#[async_trait]
pub trait ContentSource: Send + Sync + 'static {
    /// All items for a payload reference, in a stable order.
    async fn items(&self, payload_ref: &str) -> Result<Vec<ContentItem>, EnrichmentError>;
}

/// Durable side of [`ContentSource`]: extraction output is written here and
/// later stages read it back by payload reference.
#[async_trait]
pub trait ContentStore: ContentSource {
    /// Replace every item stored under `payload_ref`, keeping their order.
    async fn put(&self, payload_ref: &str, items: Vec<ContentItem>) -> Result<(), EnrichmentError>;
}
