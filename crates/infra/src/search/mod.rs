//! Vector storage and multi-space ranking.

pub mod postgres;
pub mod ranking;
pub mod vectors;

pub use postgres::PgVectorStore;
pub use ranking::{
    RankedHit, RankingConfig, RankingEngine, SearchError, SearchRequest, SearchResults,
    SpaceResult, SpaceWeight, candidate_count, default_space_weights, merge_space_hits,
};
pub use vectors::{
    InMemoryVectorStore, SpaceHit, VectorRecord, VectorStore, VectorStoreError, cosine_similarity,
};
