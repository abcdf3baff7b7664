use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, head, post};
use tower_http::trace::TraceLayer;

use crate::auth::TokenVerifier;
use crate::config::UploadPolicy;
use crate::db::MetadataStore;
use crate::files::FileManager;

mod error;
mod serve;
mod upload;

pub use error::{ApiError, ErrorResponse};
pub use upload::UploadResponse;

#[derive(Clone)]
pub struct AppState {
    pub files: Arc<FileManager>,
    pub db: Arc<dyn MetadataStore>,
    pub policy: Arc<UploadPolicy>,
    /// `None` when no signing secret is configured; only guests can upload then.
    pub tokens: Option<Arc<TokenVerifier>>,
}

impl AppState {
    pub fn new(
        files: Arc<FileManager>,
        db: Arc<dyn MetadataStore>,
        policy: UploadPolicy,
        tokens: Option<TokenVerifier>,
    ) -> Self {
        Self {
            files,
            db,
            policy: Arc::new(policy),
            tokens: tokens.map(Arc::new),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/v1/upload",
            // size limits depend on the uploader and are enforced while spooling
            post(upload::upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/v1/heartbeat", head(serve::heartbeat))
        .route("/api/v1/{key}", get(serve::serve_file))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
