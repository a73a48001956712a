use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::put,
    Json, Router,
};

use docpipe_enrichment::{ContentSource, ContentStore};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// Document content that `payload_ref`s of submitted jobs resolve to.
pub fn router() -> Router {
    Router::new().route("/:payload_ref/content", put(put_content).get(get_content))
}

pub async fn put_content(
    Extension(services): Extension<Arc<AppServices>>,
    Path(payload_ref): Path<String>,
    Json(body): Json<dto::PutContentRequest>,
) -> axum::response::Response {
    if payload_ref.trim().is_empty() {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "payload_ref is required",
        );
    }
    let items = match body.into_items() {
        Ok(items) => items,
        Err(resp) => return resp,
    };

    match services.content.put(&payload_ref, items.clone()).await {
        Ok(()) => {
            tracing::info!(payload_ref = %payload_ref, items = items.len(), "document content stored");
            Json(dto::DocumentContentResponse { payload_ref, items }).into_response()
        }
        Err(e) => errors::content_error_to_response(e),
    }
}

pub async fn get_content(
    Extension(services): Extension<Arc<AppServices>>,
    Path(payload_ref): Path<String>,
) -> axum::response::Response {
    match services.content.items(&payload_ref).await {
        Ok(items) if items.is_empty() => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no content stored for {payload_ref}"),
        ),
        Ok(items) => Json(dto::DocumentContentResponse { payload_ref, items }).into_response(),
        Err(e) => errors::content_error_to_response(e),
    }
}
