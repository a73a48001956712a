use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use docpipe_enrichment::EnrichmentError;
use docpipe_infra::OrchestratorError;
use docpipe_infra::search::{SearchError, VectorStoreError};

pub fn orchestrator_error_to_response(err: OrchestratorError) -> axum::response::Response {
    match err {
        OrchestratorError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        OrchestratorError::UnknownKind(kind) => json_error(
            StatusCode::BAD_REQUEST,
            "unknown_kind",
            format!("no pipeline registered for job kind {kind}"),
        ),
        e @ OrchestratorError::AlreadyActive(_) => {
            json_error(StatusCode::CONFLICT, "already_active", e.to_string())
        }
        e @ OrchestratorError::OwnershipLost(_) => {
            json_error(StatusCode::CONFLICT, "ownership_lost", e.to_string())
        }
        OrchestratorError::Store(e) => {
            tracing::error!(error = %e, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
        OrchestratorError::Checkpoint(e) => {
            tracing::error!(error = %e, "checkpoint store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "checkpoint_error", e.to_string())
        }
    }
}

pub fn search_error_to_response(err: SearchError) -> axum::response::Response {
    match err {
        e @ (SearchError::InvalidWeight { .. } | SearchError::DuplicateSpace(_)) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
        }
        e @ SearchError::Embedding { .. } => {
            json_error(StatusCode::BAD_GATEWAY, "embedding_error", e.to_string())
        }
        SearchError::Vector(VectorStoreError::Storage(msg)) => {
            tracing::error!(error = %msg, "vector store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
        e @ SearchError::Vector(_) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "vector_error", e.to_string())
        }
        e @ SearchError::Join(_) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "search_failed", e.to_string())
        }
    }
}

pub fn content_error_to_response(err: EnrichmentError) -> axum::response::Response {
    match err {
        e @ EnrichmentError::InvalidInput(_) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
        }
        e => {
            tracing::error!(error = %e, "content store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn parse_job_id(s: &str) -> Result<docpipe_core::JobId, axum::response::Response> {
    s.parse()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"))
}
