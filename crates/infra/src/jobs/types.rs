//! Core job types.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use docpipe_core::{DomainError, JobError, JobId, OwnerToken};

/// Kind of deferred work a sub-job performs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubJobKind {
    /// Batch enrichment of the parent's content items.
    BulkEnrichment,
    /// Re-derive vectors for entities that are missing some spaces.
    EmbeddingBackfill,
    /// Anything registered under a custom name.
    Custom(String),
}

impl SubJobKind {
    pub fn as_str(&self) -> &str {
        match self {
            SubJobKind::BulkEnrichment => "bulk_enrichment",
            SubJobKind::EmbeddingBackfill => "embedding_backfill",
            SubJobKind::Custom(name) => name,
        }
    }
}

/// Job kind for routing to the pipeline registered under its name.
///
/// Serialized as its plain name (`"document_processing"`, `"bulk_enrichment"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum JobKind {
    /// The top-level ingest → extract → classify → embed → relate pipeline.
    DocumentProcessing,
    /// Child job spawned by a stage for deferred work.
    SubJob(SubJobKind),
    /// Generic/custom job
    Custom(String),
}

impl JobKind {
    pub fn custom(kind: impl Into<String>) -> Self {
        Self::Custom(kind.into())
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "document_processing" => JobKind::DocumentProcessing,
            "bulk_enrichment" => JobKind::SubJob(SubJobKind::BulkEnrichment),
            "embedding_backfill" => JobKind::SubJob(SubJobKind::EmbeddingBackfill),
            other => JobKind::Custom(other.to_string()),
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            JobKind::DocumentProcessing => "document_processing",
            JobKind::SubJob(sub_kind) => sub_kind.as_str(),
            JobKind::Custom(kind) => kind,
        }
    }

    pub fn sub_job_kind(&self) -> Option<&SubJobKind> {
        match self {
            JobKind::SubJob(sub_kind) => Some(sub_kind),
            _ => None,
        }
    }
}

impl From<JobKind> for String {
    fn from(kind: JobKind) -> Self {
        kind.type_name().to_string()
    }
}

impl From<String> for JobKind {
    fn from(name: String) -> Self {
        JobKind::from_name(&name)
    }
}

impl From<SubJobKind> for JobKind {
    fn from(sub_kind: SubJobKind) -> Self {
        match sub_kind {
            SubJobKind::Custom(name) => JobKind::Custom(name),
            other => JobKind::SubJob(other),
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted, waiting to be claimed
    Queued,
    /// Claimed by an executor (or waiting on required sub-jobs)
    Running,
    Completed,
    Failed,
    /// Cancelled by an external request
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a parent's completion waits for a sub-job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubJobDependency {
    /// Reported but non-blocking; failure never touches the parent.
    #[default]
    BestEffort,
    /// Parent completes only after this child completes.
    Required,
}

impl SubJobDependency {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubJobDependency::BestEffort => "best_effort",
            SubJobDependency::Required => "required",
        }
    }
}

impl FromStr for SubJobDependency {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "best_effort" => Ok(SubJobDependency::BestEffort),
            "required" => Ok(SubJobDependency::Required),
            other => Err(DomainError::validation(format!("unknown dependency: {other}"))),
        }
    }
}

/// A pipeline job (top-level or sub-job).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    /// Reference to the input (document URI, collection key); never the payload itself.
    pub payload_ref: String,
    pub status: JobStatus,
    /// Name of the last stage entered
    pub current_stage: Option<String>,
    pub progress_percent: u8,
    /// Set only on terminal failure
    pub error: Option<JobError>,
    pub parent_job_id: Option<JobId>,
    /// How the parent depends on this job (sub-jobs only)
    pub dependency: SubJobDependency,
    /// Items already processed by a batch sub-job
    pub batch_cursor: Option<u64>,
    pub sub_job_ids: Vec<JobId>,
    /// Claim token of the executor currently driving the job
    pub owner: Option<OwnerToken>,
    /// Automatic resumes performed by the stuck-job monitor
    pub resume_attempts: u32,
    pub cancel_requested: bool,
    /// All stages done; parked until required sub-jobs settle
    pub waiting_on_sub_jobs: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new queued job.
    pub fn new(kind: JobKind, payload_ref: impl Into<String>) -> Self {
        Self::with_id(JobId::new(), kind, payload_ref, Utc::now())
    }

    fn with_id(id: JobId, kind: JobKind, payload_ref: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind,
            payload_ref: payload_ref.into(),
            status: JobStatus::Queued,
            current_stage: None,
            progress_percent: 0,
            error: None,
            parent_job_id: None,
            dependency: SubJobDependency::BestEffort,
            batch_cursor: None,
            sub_job_ids: Vec::new(),
            owner: None,
            resume_attempts: 0,
            cancel_requested: false,
            waiting_on_sub_jobs: false,
            created_at: now,
            updated_at: now,
            last_heartbeat_at: None,
        }
    }

    /// Create the sub-job a parent's stage defers work to.
    ///
    /// The id is derived from the parent and stage ordinal, so spawning twice
    /// for the same stage yields the same child.
    pub fn sub_job(
        parent: &Job,
        stage_ordinal: u32,
        sub_kind: SubJobKind,
        payload_ref: impl Into<String>,
        dependency: SubJobDependency,
        now: DateTime<Utc>,
    ) -> Self {
        let id = JobId::derived_sub_job(parent.id, stage_ordinal);
        let mut job = Self::with_id(id, JobKind::from(sub_kind), payload_ref, now);
        job.parent_job_id = Some(parent.id);
        job.dependency = dependency;
        job.batch_cursor = Some(0);
        job
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_sub_job(&self) -> bool {
        self.parent_job_id.is_some()
    }

    /// Last proof of liveness; falls back to `updated_at` before the first beat.
    pub fn last_alive_at(&self) -> DateTime<Utc> {
        self.last_heartbeat_at.unwrap_or(self.updated_at)
    }

    /// A running job nobody is provably driving.
    pub fn is_claimable_running(&self, stale_before: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running
            && (self.owner.is_none() || self.last_alive_at() < stale_before)
    }

    /// Mark job as running under a fresh claim.
    pub fn mark_running(&mut self, owner: OwnerToken, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.owner = Some(owner);
        self.waiting_on_sub_jobs = false;
        self.updated_at = now;
        self.last_heartbeat_at = Some(now);
    }

    /// Mark job as completed.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.progress_percent = 100;
        self.owner = None;
        self.waiting_on_sub_jobs = false;
        self.updated_at = now;
    }

    /// Mark job as failed with a structured error.
    pub fn mark_failed(&mut self, error: JobError, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.owner = None;
        self.waiting_on_sub_jobs = false;
        self.updated_at = now;
    }

    /// Mark job as cancelled.
    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Cancelled;
        self.owner = None;
        self.waiting_on_sub_jobs = false;
        self.updated_at = now;
    }

    /// Park a finished parent until its required sub-jobs settle.
    pub fn mark_waiting(&mut self, now: DateTime<Utc>) {
        self.waiting_on_sub_jobs = true;
        self.owner = None;
        self.updated_at = now;
    }

    /// Raise progress; never lowers it.
    pub fn advance_progress(&mut self, percent: u8) {
        self.progress_percent = self.progress_percent.max(percent.min(100));
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_its_name() {
        for kind in [
            JobKind::DocumentProcessing,
            JobKind::SubJob(SubJobKind::BulkEnrichment),
            JobKind::SubJob(SubJobKind::EmbeddingBackfill),
            JobKind::custom("thumbnails"),
        ] {
            assert_eq!(JobKind::from_name(kind.type_name()), kind);
        }
        let json = serde_json::to_value(JobKind::DocumentProcessing).unwrap();
        assert_eq!(json, serde_json::json!("document_processing"));
    }

    #[test]
    fn status_parses_and_classifies() {
        assert_eq!("failed".parse::<JobStatus>().unwrap(), JobStatus::Failed);
        assert!("done".parse::<JobStatus>().is_err());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn job_lifecycle() {
        let mut job = Job::new(JobKind::DocumentProcessing, "s3://docs/catalog.pdf");
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.owner.is_none());

        let owner = OwnerToken::new();
        let now = Utc::now();
        job.mark_running(owner, now);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.owner, Some(owner));
        assert_eq!(job.last_heartbeat_at, Some(now));

        job.advance_progress(40);
        job.advance_progress(10);
        assert_eq!(job.progress_percent, 40);

        job.mark_completed(now);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress_percent, 100);
        assert!(job.owner.is_none());
    }

    #[test]
    fn sub_job_identity_is_derived_from_parent_and_ordinal() {
        let parent = Job::new(JobKind::DocumentProcessing, "doc-1");
        let now = Utc::now();
        let a = Job::sub_job(
            &parent,
            4,
            SubJobKind::BulkEnrichment,
            "doc-1",
            SubJobDependency::BestEffort,
            now,
        );
        let b = Job::sub_job(
            &parent,
            4,
            SubJobKind::BulkEnrichment,
            "doc-1",
            SubJobDependency::BestEffort,
            now,
        );
        assert_eq!(a.id, b.id);
        assert_eq!(a.parent_job_id, Some(parent.id));
        assert_eq!(a.batch_cursor, Some(0));
        assert_eq!(a.kind, JobKind::SubJob(SubJobKind::BulkEnrichment));
    }

    #[test]
    fn stale_heartbeat_makes_running_job_claimable() {
        let mut job = Job::new(JobKind::DocumentProcessing, "doc");
        let start = Utc::now();
        job.mark_running(OwnerToken::new(), start);

        assert!(!job.is_claimable_running(start - chrono::Duration::seconds(1)));
        assert!(job.is_claimable_running(start + chrono::Duration::seconds(1)));

        job.owner = None;
        assert!(job.is_claimable_running(start - chrono::Duration::seconds(1)));
    }
}
