//! `docpipe-core`: pipeline domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod output;
pub mod stage;

pub use error::{Classify, DomainError, DomainResult, ErrorClass, ErrorKind, JobError};
pub use id::{EntityId, JobId, OwnerToken};
pub use output::StageOutputRef;
pub use stage::{PipelineDefinition, StageDefinition};
