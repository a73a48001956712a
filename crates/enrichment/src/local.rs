//! Deterministic in-process implementations of the enrichment boundary.
//!
//! Used when no external service is configured and throughout the test suites.
//! Vectors are hash-based bag-of-words embeddings: identical text maps to the
//! identical vector, and texts sharing words have positive cosine similarity.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::RwLock;

use async_trait::async_trait;
use fnv::FnvHasher;
use serde_json::json;

use crate::content::{ContentItem, ContentSource, ContentStore};
use crate::embedder::QueryEmbedder;
use crate::error::EnrichmentError;
use crate::operation::{Enrichment, EnrichmentInput, EnrichmentOutput};

/// FNV-1a of a token, stable across processes and platforms.
fn token_hash(token: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(token.as_bytes());
    hasher.finish()
}

/// L2-normalised bag-of-words vector of `dimension` buckets.
///
/// Text without any word yields the zero vector.
pub fn hash_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dimension.max(1)];
    for token in text.split_whitespace() {
        let token = token.to_lowercase();
        let idx = (token_hash(&token) % v.len() as u64) as usize;
        v[idx] += 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Enrichment operation that answers locally.
///
/// When `params.space` is set it derives a vector for `subject`; otherwise it
/// reports one item with a summary naming the operation.
#[derive(Debug, Clone)]
pub struct LocalEnrichment {
    name: String,
    dimension: usize,
}

impl LocalEnrichment {
    pub fn new(name: impl Into<String>, dimension: usize) -> Self {
        Self {
            name: name.into(),
            dimension,
        }
    }
}

#[async_trait]
impl Enrichment for LocalEnrichment {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, input: EnrichmentInput) -> Result<EnrichmentOutput, EnrichmentError> {
        if input.subject.trim().is_empty() {
            return Err(EnrichmentError::InvalidInput("empty subject".to_string()));
        }

        if let Some(space) = input.params.get("space").and_then(|s| s.as_str()) {
            return Ok(EnrichmentOutput::new(1)
                .with_vector(hash_embedding(&input.subject, self.dimension))
                .with_summary(json!({ "operation": self.name, "space": space })));
        }

        Ok(EnrichmentOutput::new(1).with_summary(json!({
            "operation": self.name,
            "subject": input.subject,
        })))
    }
}

/// Query embedder backed by [`hash_embedding`] for a fixed set of spaces.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    spaces: Vec<String>,
    dimension: usize,
}

impl HashEmbedder {
    pub fn new<I, S>(spaces: I, dimension: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            spaces: spaces.into_iter().map(Into::into).collect(),
            dimension,
        }
    }
}

#[async_trait]
impl QueryEmbedder for HashEmbedder {
    async fn embed_query(
        &self,
        space: &str,
        query: &str,
    ) -> Result<Option<Vec<f32>>, EnrichmentError> {
        if !self.spaces.iter().any(|s| s == space) || query.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(hash_embedding(query, self.dimension)))
    }
}

/// Content source holding items in memory, keyed by payload reference.
#[derive(Debug, Default)]
pub struct InMemoryContentSource {
    items: RwLock<HashMap<String, Vec<ContentItem>>>,
}

impl InMemoryContentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        payload_ref: impl Into<String>,
        items: Vec<ContentItem>,
    ) -> Result<(), EnrichmentError> {
        let mut guard = self
            .items
            .write()
            .map_err(|_| EnrichmentError::Unavailable("content lock poisoned".to_string()))?;
        guard.insert(payload_ref.into(), items);
        Ok(())
    }
}

#[async_trait]
impl ContentSource for InMemoryContentSource {
    async fn items(&self, payload_ref: &str) -> Result<Vec<ContentItem>, EnrichmentError> {
        let guard = self
            .items
            .read()
            .map_err(|_| EnrichmentError::Unavailable("content lock poisoned".to_string()))?;
        Ok(guard.get(payload_ref).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl ContentStore for InMemoryContentSource {
    async fn put(&self, payload_ref: &str, items: Vec<ContentItem>) -> Result<(), EnrichmentError> {
        self.insert(payload_ref, items)
    }
}
