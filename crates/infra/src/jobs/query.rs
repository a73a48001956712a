//! Job listing: filters and pagination.

use serde::{Deserialize, Serialize};

use docpipe_core::JobId;

use super::types::{Job, JobStatus};

/// Pagination parameters for job listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of jobs to return.
    pub limit: u32,
    /// Offset for pagination (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(1000),
            offset: offset.unwrap_or(0),
        }
    }
}

/// Filter criteria for job listings. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    /// Matched against [`super::JobKind::type_name`].
    pub kind: Option<String>,
    pub parent_job_id: Option<JobId>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self
                .kind
                .as_deref()
                .is_none_or(|k| job.kind.type_name() == k)
            && self.parent_job_id.is_none_or(|p| job.parent_job_id == Some(p))
    }
}

/// One page of a job listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    /// Number of jobs matching the filter (across all pages).
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

impl JobPage {
    pub fn new(jobs: Vec<Job>, total: u64, pagination: Pagination) -> Self {
        let has_more = u64::from(pagination.offset) + (jobs.len() as u64) < total;
        Self {
            jobs,
            total,
            pagination,
            has_more,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::JobKind;

    #[test]
    fn pagination_caps_limit() {
        assert_eq!(Pagination::new(Some(5000), None).limit, 1000);
        assert_eq!(Pagination::new(None, Some(7)), Pagination { limit: 50, offset: 7 });
    }

    #[test]
    fn filter_matches_on_status_and_kind() {
        let job = Job::new(JobKind::DocumentProcessing, "doc");
        assert!(JobFilter::default().matches(&job));
        assert!(
            JobFilter {
                status: Some(JobStatus::Queued),
                kind: Some("document_processing".into()),
                parent_job_id: None,
            }
            .matches(&job)
        );
        assert!(
            !JobFilter {
                status: Some(JobStatus::Failed),
                ..Default::default()
            }
            .matches(&job)
        );
        assert!(
            !JobFilter {
                parent_job_id: Some(JobId::new()),
                ..Default::default()
            }
            .matches(&job)
        );
    }
}
