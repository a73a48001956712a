//! Stage output references.
//!
//! Checkpoints never hold raw stage payloads. They hold a small, typed pointer
//! to what the stage produced so later stages can fetch it on demand.

use serde::{Deserialize, Serialize};

/// Pointer/summary of what a stage produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageOutputRef {
    /// Stage produced nothing downstream stages need.
    Empty,
    /// Source document registered for processing.
    Document { uri: String, pages: u32 },
    /// A keyed collection of items (chunks, products, images, relations).
    Items { collection: String, count: u64 },
    /// Vectors written to the vector store.
    Embeddings { spaces: Vec<String>, count: u64 },
    /// Opaque summary produced by an external enrichment operation.
    Enriched {
        operation: String,
        summary: serde_json::Value,
    },
}

impl StageOutputRef {
    pub fn items(collection: impl Into<String>, count: u64) -> Self {
        Self::Items {
            collection: collection.into(),
            count,
        }
    }

    /// Number of items referenced, when the variant carries a count.
    pub fn item_count(&self) -> Option<u64> {
        match self {
            StageOutputRef::Items { count, .. } | StageOutputRef::Embeddings { count, .. } => {
                Some(*count)
            }
            StageOutputRef::Document { pages, .. } => Some(u64::from(*pages)),
            StageOutputRef::Empty | StageOutputRef::Enriched { .. } => None,
        }
    }

    pub fn collection(&self) -> Option<&str> {
        match self {
            StageOutputRef::Items { collection, .. } => Some(collection),
            _ => None,
        }
    }
}
