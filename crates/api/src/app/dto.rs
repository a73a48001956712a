use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use docpipe_core::{EntityId, JobError, JobId};
use docpipe_enrichment::ContentItem;
use docpipe_infra::jobs::{Job, JobFilter, JobPage, JobStatus, Pagination};
use docpipe_infra::search::{SearchRequest, SpaceWeight};

use crate::app::errors;

pub const DEFAULT_TOP_K: usize = 10;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub kind: String,
    pub payload_ref: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub kind: Option<String>,
    pub parent_job_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl ListJobsQuery {
    pub fn into_filter(self) -> Result<(JobFilter, Pagination), axum::response::Response> {
        let status = match self.status.as_deref() {
            None => None,
            Some(s) => Some(s.parse::<JobStatus>().map_err(|_| {
                errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "invalid_status",
                    "status must be one of: queued, running, completed, failed, cancelled",
                )
            })?),
        };
        let parent_job_id = match self.parent_job_id.as_deref() {
            None => None,
            Some(id) => Some(errors::parse_job_id(id)?),
        };

        Ok((
            JobFilter {
                status,
                kind: self.kind,
                parent_job_id,
            },
            Pagination::new(self.limit, self.offset),
        ))
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchBody {
    pub query: String,
    #[serde(default)]
    pub spaces: Option<Vec<SpaceWeight>>,
    pub top_k: Option<usize>,
}

impl From<SearchBody> for SearchRequest {
    fn from(body: SearchBody) -> Self {
        let request = SearchRequest::new(body.query, body.top_k.unwrap_or(DEFAULT_TOP_K));
        match body.spaces {
            Some(spaces) => request.with_spaces(spaces),
            None => request,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ContentItemBody {
    /// Generated when omitted.
    pub entity_id: Option<EntityId>,
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct PutContentRequest {
    pub items: Vec<ContentItemBody>,
}

impl PutContentRequest {
    pub fn into_items(self) -> Result<Vec<ContentItem>, axum::response::Response> {
        self.items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                if item.text.trim().is_empty() {
                    return Err(errors::json_error(
                        StatusCode::BAD_REQUEST,
                        "validation_error",
                        format!("items[{index}].text must not be blank"),
                    ));
                }
                Ok(ContentItem::new(
                    item.entity_id.unwrap_or_else(EntityId::new),
                    item.text,
                ))
            })
            .collect()
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct DocumentContentResponse {
    pub payload_ref: String,
    pub items: Vec<ContentItem>,
}

/// Caller-visible job state. The claim token stays internal.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: JobId,
    pub kind: String,
    pub payload_ref: String,
    pub status: JobStatus,
    pub current_stage: Option<String>,
    pub progress_percent: u8,
    pub error: Option<JobError>,
    pub parent_job_id: Option<JobId>,
    pub dependency: Option<&'static str>,
    pub batch_cursor: Option<u64>,
    pub sub_job_ids: Vec<JobId>,
    pub resume_attempts: u32,
    pub cancel_requested: bool,
    pub waiting_on_sub_jobs: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        let dependency = job.is_sub_job().then(|| job.dependency.as_str());
        Self {
            id: job.id,
            kind: job.kind.type_name().to_string(),
            payload_ref: job.payload_ref,
            status: job.status,
            current_stage: job.current_stage,
            progress_percent: job.progress_percent,
            error: job.error,
            parent_job_id: job.parent_job_id,
            dependency,
            batch_cursor: job.batch_cursor,
            sub_job_ids: job.sub_job_ids,
            resume_attempts: job.resume_attempts,
            cancel_requested: job.cancel_requested,
            waiting_on_sub_jobs: job.waiting_on_sub_jobs,
            created_at: job.created_at,
            updated_at: job.updated_at,
            last_heartbeat_at: job.last_heartbeat_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobView>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
    pub has_more: bool,
}

impl From<JobPage> for JobListResponse {
    fn from(page: JobPage) -> Self {
        Self {
            jobs: page.jobs.into_iter().map(JobView::from).collect(),
            total: page.total,
            limit: page.pagination.limit,
            offset: page.pagination.offset,
            has_more: page.has_more,
        }
    }
}
