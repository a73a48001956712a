use std::sync::Arc;

use axum::{extract::Extension, response::IntoResponse, Json};

use docpipe_infra::search::SearchRequest;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub async fn search(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::SearchBody>,
) -> axum::response::Response {
    let request = SearchRequest::from(body);
    match services.ranking.search(&request).await {
        Ok(results) => {
            tracing::debug!(
                hits = results.hits.len(),
                searched = ?results.searched_spaces,
                "search served"
            );
            Json(results).into_response()
        }
        Err(e) => errors::search_error_to_response(e),
    }
}
