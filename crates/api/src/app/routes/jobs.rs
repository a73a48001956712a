use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use docpipe_infra::jobs::JobKind;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_job).get(list_jobs))
        .route("/stats", get(job_stats))
        .route("/:id", get(get_job))
        .route("/:id/cancel", post(cancel_job))
        .route("/:id/resume", post(resume_job))
        .route("/:id/sub-jobs", get(list_sub_jobs))
        .route("/:id/checkpoints", get(list_checkpoints))
}

pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::SubmitJobRequest>,
) -> axum::response::Response {
    if body.kind.trim().is_empty() || body.payload_ref.trim().is_empty() {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "kind and payload_ref are required",
        );
    }

    match services
        .orchestrator
        .submit(JobKind::from_name(&body.kind), body.payload_ref)
        .await
    {
        Ok(job) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "job_id": job.id,
                "status": job.status,
            })),
        )
            .into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let (filter, pagination) = match query.into_filter() {
        Ok(parsed) => parsed,
        Err(resp) => return resp,
    };

    match services.orchestrator.list_jobs(&filter, pagination).await {
        Ok(page) => Json(dto::JobListResponse::from(page)).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn job_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.orchestrator.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.orchestrator.get_job(job_id).await {
        Ok(job) => Json(dto::JobView::from(job)).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.orchestrator.cancel_job(job_id).await {
        Ok(job) => (StatusCode::ACCEPTED, Json(dto::JobView::from(job))).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

/// Re-open the job if needed and drive it in the background.
///
/// Terminal `completed`/`cancelled` jobs come back unchanged with 200.
pub async fn resume_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let job = match services.orchestrator.request_resume(job_id).await {
        Ok(job) => job,
        Err(e) => return errors::orchestrator_error_to_response(e),
    };
    if job.is_terminal() {
        return Json(dto::JobView::from(job)).into_response();
    }

    let orchestrator = services.orchestrator.clone();
    tokio::spawn(async move {
        match orchestrator.run_job(job_id).await {
            Ok(status) => tracing::info!(job_id = %job_id, %status, "manual resume finished"),
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "manual resume failed"),
        }
    });

    (StatusCode::ACCEPTED, Json(dto::JobView::from(job))).into_response()
}

pub async fn list_sub_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.orchestrator.sub_jobs(job_id).await {
        Ok(children) => Json(serde_json::json!({
            "parent_job_id": job_id,
            "sub_jobs": children.into_iter().map(dto::JobView::from).collect::<Vec<_>>(),
        }))
        .into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn list_checkpoints(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.orchestrator.checkpoints(job_id).await {
        Ok(checkpoints) => Json(serde_json::json!({
            "job_id": job_id,
            "checkpoints": checkpoints,
        }))
        .into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}
