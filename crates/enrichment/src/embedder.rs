use async_trait::async_trait;

use crate::error::EnrichmentError;

/// Derives the query-side vector for one named embedding space.
///
/// Returning `Ok(None)` means the query has no representation in that space
/// (e.g. a text-only query against an image space); the space is then skipped.
#[async_trait]
pub trait QueryEmbedder: Send + Sync + 'static {
    async fn embed_query(&self, space: &str, query: &str)
    -> Result<Option<Vec<f32>>, EnrichmentError>;
}
