//! Job records: types, storage, listing.
//!
//! ## Components
//!
//! - `Job`: one row per top-level pipeline run or sub-job
//! - `JobStore`: claim-based persistence (in-memory or Postgres)
//! - `JobFilter` / `Pagination`: listing for the status surface

pub mod postgres;
pub mod query;
pub mod store;
pub mod types;

pub use postgres::PostgresJobStore;
pub use query::{JobFilter, JobPage, Pagination};
pub use store::{ClaimOutcome, InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{Job, JobKind, JobStatus, SubJobDependency, SubJobKind};
