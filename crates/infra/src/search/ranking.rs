//! Multi-vector ranking: one weighted merge across named embedding spaces.
//!
//! Every requested space is queried independently for its top `m` entities
//! (`m = top_k * oversample`). The per-space hits are then fused:
//!
//! ```text
//! combined_score(entity) = Σ weight[space] * similarity[space]
//! ```
//!
//! summed only over the spaces that actually retrieved the entity. Each hit
//! keeps the list of contributing spaces and the per-space similarity so a
//! caller can audit why it ranked where it did.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, instrument};

use docpipe_core::EntityId;
use docpipe_enrichment::{EnrichmentError, QueryEmbedder};

use super::vectors::{SpaceHit, VectorStore, VectorStoreError};
use crate::retry::{self, RetryPolicy};

pub const DEFAULT_OVERSAMPLE: usize = 3;

/// Weight assigned to one space for a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceWeight {
    pub space: String,
    pub weight: f64,
}

impl SpaceWeight {
    pub fn new(space: impl Into<String>, weight: f64) -> Self {
        Self {
            space: space.into(),
            weight,
        }
    }
}

/// Default spaces: text 0.4, caption 0.3, visual 0.3.
pub fn default_space_weights() -> Vec<SpaceWeight> {
    vec![
        SpaceWeight::new("text", 0.4),
        SpaceWeight::new("caption", 0.3),
        SpaceWeight::new("visual", 0.3),
    ]
}

/// Hits retrieved from one space, with that space's weight.
#[derive(Debug, Clone, PartialEq)]
pub struct SpaceResult {
    pub space: String,
    pub weight: f64,
    pub hits: Vec<SpaceHit>,
}

/// One fused result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedHit {
    pub entity_id: EntityId,
    pub combined_score: f64,
    /// Spaces that retrieved this entity, in request order.
    pub contributing_spaces: Vec<String>,
    /// Raw similarity per contributing space.
    pub space_scores: BTreeMap<String, f64>,
}

/// Candidates to fetch per space for a final list of `top_k`.
#[must_use]
pub const fn candidate_count(top_k: usize, oversample: usize) -> usize {
    let m = top_k.saturating_mul(oversample);
    if m < top_k { top_k } else { m }
}

/// Fuse per-space hits into one ranked list.
///
/// Sorted by `combined_score` descending, then `entity_id` ascending, and
/// truncated to `top_k`. An entity listed twice by the same space counts
/// once, with its first (best) similarity.
#[must_use]
#[instrument(
    name = "docpipe::merge_space_hits",
    skip(results),
    fields(spaces = results.len(), top_k)
)]
pub fn merge_space_hits(results: &[SpaceResult], top_k: usize) -> Vec<RankedHit> {
    if top_k == 0 {
        return Vec::new();
    }

    let capacity = results.iter().map(|r| r.hits.len()).sum();
    let mut merged: HashMap<EntityId, RankedHit> = HashMap::with_capacity(capacity);

    for result in results {
        for hit in &result.hits {
            let contribution = result.weight * hit.similarity;
            let entry = merged.entry(hit.entity_id).or_insert_with(|| RankedHit {
                entity_id: hit.entity_id,
                combined_score: 0.0,
                contributing_spaces: Vec::new(),
                space_scores: BTreeMap::new(),
            });
            if entry.space_scores.contains_key(&result.space) {
                continue;
            }
            entry.combined_score += contribution;
            entry.contributing_spaces.push(result.space.clone());
            entry.space_scores.insert(result.space.clone(), hit.similarity);
        }
    }

    let mut ranked: Vec<RankedHit> = merged.into_values().collect();
    ranked.sort_by(|a, b| {
        b.combined_score
            .total_cmp(&a.combined_score)
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
    ranked.truncate(top_k);

    debug!(returned = ranked.len(), "merged space hits");
    ranked
}

/// A search over one or more spaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    /// Spaces and weights to search; the engine defaults when absent or empty.
    #[serde(default)]
    pub spaces: Option<Vec<SpaceWeight>>,
    pub top_k: usize,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, top_k: usize) -> Self {
        Self {
            query: query.into(),
            spaces: None,
            top_k,
        }
    }

    pub fn with_spaces(mut self, spaces: Vec<SpaceWeight>) -> Self {
        self.spaces = Some(spaces);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    pub hits: Vec<RankedHit>,
    /// Spaces that produced a query vector and were searched.
    pub searched_spaces: Vec<String>,
    /// Spaces with no derivable query vector.
    pub skipped_spaces: Vec<String>,
}

impl SearchResults {
    fn empty() -> Self {
        Self {
            hits: Vec::new(),
            searched_spaces: Vec::new(),
            skipped_spaces: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid weight {weight} for space {space}")]
    InvalidWeight { space: String, weight: f64 },

    #[error("space {0} listed more than once")]
    DuplicateSpace(String),

    #[error("query embedding failed for space {space}: {source}")]
    Embedding {
        space: String,
        #[source]
        source: EnrichmentError,
    },

    #[error(transparent)]
    Vector(#[from] VectorStoreError),

    #[error("search task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone)]
pub struct RankingConfig {
    pub default_spaces: Vec<SpaceWeight>,
    pub oversample: usize,
    /// Applied to query-vector derivation.
    pub retry: RetryPolicy,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            default_spaces: default_space_weights(),
            oversample: DEFAULT_OVERSAMPLE,
            retry: RetryPolicy::default(),
        }
    }
}

enum SpaceOutcome {
    Searched(SpaceResult),
    Skipped(String),
}

/// Runs weighted multi-space searches.
#[derive(Clone)]
pub struct RankingEngine {
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn QueryEmbedder>,
    config: RankingConfig,
}

impl RankingEngine {
    pub fn new(
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn QueryEmbedder>,
        config: RankingConfig,
    ) -> Self {
        Self {
            vectors,
            embedder,
            config,
        }
    }

    pub fn config(&self) -> &RankingConfig {
        &self.config
    }

    fn resolve_spaces(&self, requested: Option<&[SpaceWeight]>) -> Result<Vec<SpaceWeight>, SearchError> {
        let spaces = match requested {
            Some(spaces) if !spaces.is_empty() => spaces.to_vec(),
            _ => self.config.default_spaces.clone(),
        };

        let mut seen = HashSet::with_capacity(spaces.len());
        for sw in &spaces {
            if !sw.weight.is_finite() || sw.weight <= 0.0 {
                return Err(SearchError::InvalidWeight {
                    space: sw.space.clone(),
                    weight: sw.weight,
                });
            }
            if !seen.insert(sw.space.as_str()) {
                return Err(SearchError::DuplicateSpace(sw.space.clone()));
            }
        }
        Ok(spaces)
    }

    /// Search every requested space in parallel and fuse the results.
    #[instrument(
        name = "docpipe::search",
        skip(self, request),
        fields(top_k = request.top_k, query_len = request.query.len()),
        err
    )]
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResults, SearchError> {
        let spaces = self.resolve_spaces(request.spaces.as_deref())?;
        if request.top_k == 0 {
            return Ok(SearchResults::empty());
        }

        let limit = candidate_count(request.top_k, self.config.oversample.max(1));
        let mut tasks = JoinSet::new();
        for (index, sw) in spaces.iter().cloned().enumerate() {
            let vectors = self.vectors.clone();
            let embedder = self.embedder.clone();
            let policy = self.config.retry.clone();
            let query = request.query.clone();
            tasks.spawn(async move {
                let outcome = search_space(vectors, embedder, &policy, &query, sw, limit).await;
                (index, outcome)
            });
        }

        let mut slots: Vec<Option<SpaceOutcome>> = (0..spaces.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (index, outcome) = joined.map_err(|e| SearchError::Join(e.to_string()))?;
            slots[index] = Some(outcome?);
        }

        let mut results = Vec::with_capacity(spaces.len());
        let mut searched_spaces = Vec::new();
        let mut skipped_spaces = Vec::new();
        for outcome in slots.into_iter().flatten() {
            match outcome {
                SpaceOutcome::Searched(result) => {
                    searched_spaces.push(result.space.clone());
                    results.push(result);
                }
                SpaceOutcome::Skipped(space) => skipped_spaces.push(space),
            }
        }

        let hits = merge_space_hits(&results, request.top_k);
        debug!(
            searched = searched_spaces.len(),
            skipped = skipped_spaces.len(),
            hits = hits.len(),
            "search complete"
        );
        Ok(SearchResults {
            hits,
            searched_spaces,
            skipped_spaces,
        })
    }
}

async fn search_space(
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn QueryEmbedder>,
    policy: &RetryPolicy,
    query: &str,
    space: SpaceWeight,
    limit: usize,
) -> Result<SpaceOutcome, SearchError> {
    let embedded = retry::execute(policy, |_| embedder.embed_query(&space.space, query))
        .await
        .map_err(|e| SearchError::Embedding {
            space: space.space.clone(),
            source: e.into_inner(),
        })?;

    let Some(query_vector) = embedded else {
        debug!(space = %space.space, "no query vector; space skipped");
        return Ok(SpaceOutcome::Skipped(space.space));
    };

    let hits = vectors.nearest(&space.space, &query_vector, limit).await?;
    Ok(SpaceOutcome::Searched(SpaceResult {
        space: space.space,
        weight: space.weight,
        hits,
    }))
}
