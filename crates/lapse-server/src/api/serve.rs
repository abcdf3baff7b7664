use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::api::{ApiError, AppState};
use crate::storage::StorageError;

/// HEAD /api/v1/heartbeat
pub(super) async fn heartbeat() -> StatusCode {
    StatusCode::OK
}

/// GET /api/v1/:key - Stream a public file by name
pub(super) async fn serve_file(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    let record = state
        .db
        .find_public_record(&key)?
        .ok_or(ApiError::NotFound)?;

    let storage = state.files.storage();
    let not_found = |err: StorageError| match err {
        StorageError::NotFound => ApiError::NotFound,
        other => ApiError::Storage(other),
    };

    // the file may be reclaimed between the lookup and the read
    let meta = storage.object_meta(&record.location).await.map_err(not_found)?;
    let stream = storage.get_object(&record.location).await.map_err(not_found)?;
    debug!(filename = %record.filename, size = meta.size, "Serving file");

    Ok((
        [
            (CONTENT_TYPE, record.mime_type),
            (CONTENT_LENGTH, meta.size.to_string()),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}
