//! Named embedding spaces keyed by `(entity_id, space_name)`.
//!
//! Each space has one dimension, fixed by its first vector. Writing a vector
//! for an existing `(entity, space)` overwrites it in place. An entity with no
//! vector in a space is simply never returned for that space.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use docpipe_core::{Classify, EntityId, ErrorClass};

/// One entity's vector in one space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub entity_id: EntityId,
    pub space_name: String,
    pub vector: Vec<f32>,
}

impl VectorRecord {
    pub fn new(entity_id: EntityId, space_name: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            entity_id,
            space_name: space_name.into(),
            vector,
        }
    }

    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}

/// Entity retrieved from one space with its similarity to the query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpaceHit {
    pub entity_id: EntityId,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VectorStoreError {
    #[error("space {space} holds {expected}-dimensional vectors, got {got}")]
    DimensionMismatch {
        space: String,
        expected: usize,
        got: usize,
    },

    #[error("empty vector for space {0}")]
    EmptyVector(String),

    #[error("vector storage error: {0}")]
    Storage(String),
}

impl Classify for VectorStoreError {
    fn class(&self) -> ErrorClass {
        match self {
            VectorStoreError::Storage(_) => ErrorClass::Retryable,
            _ => ErrorClass::Terminal,
        }
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or overwrite the vector for `(entity_id, space_name)`.
    async fn upsert(&self, record: VectorRecord) -> Result<(), VectorStoreError>;

    async fn get(
        &self,
        entity_id: EntityId,
        space_name: &str,
    ) -> Result<Option<VectorRecord>, VectorStoreError>;

    /// Top `limit` entities in `space_name` by cosine similarity to `query`,
    /// best first, ties broken by entity id.
    async fn nearest(
        &self,
        space_name: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<SpaceHit>, VectorStoreError>;
}

/// Cosine similarity; 0 when either vector has no magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[derive(Debug, Default)]
struct Space {
    dimension: usize,
    vectors: HashMap<EntityId, Vec<f32>>,
}

/// In-memory vector store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    spaces: RwLock<HashMap<String, Space>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn poisoned() -> VectorStoreError {
    VectorStoreError::Storage("vector store lock poisoned".to_string())
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, record: VectorRecord) -> Result<(), VectorStoreError> {
        if record.vector.is_empty() {
            return Err(VectorStoreError::EmptyVector(record.space_name));
        }
        let mut spaces = self.spaces.write().map_err(|_| poisoned())?;
        let space = spaces.entry(record.space_name.clone()).or_insert_with(|| Space {
            dimension: record.dimension(),
            vectors: HashMap::new(),
        });
        if space.dimension != record.dimension() {
            return Err(VectorStoreError::DimensionMismatch {
                space: record.space_name,
                expected: space.dimension,
                got: record.vector.len(),
            });
        }
        space.vectors.insert(record.entity_id, record.vector);
        Ok(())
    }

    async fn get(
        &self,
        entity_id: EntityId,
        space_name: &str,
    ) -> Result<Option<VectorRecord>, VectorStoreError> {
        let spaces = self.spaces.read().map_err(|_| poisoned())?;
        Ok(spaces
            .get(space_name)
            .and_then(|s| s.vectors.get(&entity_id))
            .map(|v| VectorRecord::new(entity_id, space_name, v.clone())))
    }

    async fn nearest(
        &self,
        space_name: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<SpaceHit>, VectorStoreError> {
        let spaces = self.spaces.read().map_err(|_| poisoned())?;
        let Some(space) = spaces.get(space_name) else {
            return Ok(Vec::new());
        };
        if space.dimension != query.len() {
            return Err(VectorStoreError::DimensionMismatch {
                space: space_name.to_string(),
                expected: space.dimension,
                got: query.len(),
            });
        }

        let mut hits: Vec<SpaceHit> = space
            .vectors
            .iter()
            .map(|(entity_id, v)| SpaceHit {
                entity_id: *entity_id,
                similarity: cosine_similarity(query, v),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}
