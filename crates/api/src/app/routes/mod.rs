use axum::{routing::post, Router};

pub mod documents;
pub mod jobs;
pub mod search;
pub mod system;

/// Router for the pipeline status/control surface, document content and search.
pub fn router() -> Router {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/documents", documents::router())
        .route("/search", post(search::search))
}
