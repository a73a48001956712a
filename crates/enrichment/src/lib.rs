//! `docpipe-enrichment`
//!
//! **Responsibility:** boundary to external content-understanding services.
//!
//! Extraction, OCR, vision, LLM and embedding calls are consumed through the
//! traits here. The crate knows nothing about jobs, checkpoints or storage; it
//! only defines input/output contracts and how failures classify for retry.

pub mod content;
pub mod embedder;
pub mod error;
pub mod local;
pub mod operation;

pub use content::{ContentItem, ContentSource, ContentStore};
pub use embedder::QueryEmbedder;
pub use error::EnrichmentError;
pub use local::{HashEmbedder, InMemoryContentSource, LocalEnrichment, hash_embedding};
pub use operation::{Enrichment, EnrichmentInput, EnrichmentOutput};
