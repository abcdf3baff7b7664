use axum::Json;
use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::auth::AuthError;
use crate::db::DbError;
use crate::files::SaveError;
use crate::storage::StorageError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Guest file uploads are disabled")]
    GuestUploadsDisabled,

    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("Upload exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No file to upload provided")]
    MissingFile,

    #[error("{0} files are not allowed")]
    DisallowedType(String),

    #[error("Malformed multipart body: {0}")]
    Multipart(#[from] MultipartError),

    #[error("File not found")]
    NotFound,

    #[error(transparent)]
    Save(#[from] SaveError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    /// Render with a request ID attached to the body.
    pub fn into_response_with_id(self, request_id: Option<String>) -> Response {
        let (status, error, detail) = match &self {
            ApiError::GuestUploadsDisabled => (
                StatusCode::UNAUTHORIZED,
                "Guest uploads disabled",
                None,
            ),
            ApiError::Unauthorized(e) => (
                StatusCode::UNAUTHORIZED,
                "Invalid token",
                Some(e.to_string()),
            ),
            ApiError::TooLarge { limit } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "File too large",
                Some(format!("limit is {limit} bytes")),
            ),
            ApiError::InvalidRequest(msg) => (
                StatusCode::BAD_REQUEST,
                "Invalid request",
                Some(msg.clone()),
            ),
            ApiError::MissingFile => (StatusCode::BAD_REQUEST, "No file provided", None),
            ApiError::DisallowedType(mime) => (
                StatusCode::BAD_REQUEST,
                "File type not allowed",
                Some(mime.clone()),
            ),
            ApiError::Multipart(e) => (e.status(), "Invalid upload", Some(e.body_text())),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "Not found", None),
            ApiError::Save(SaveError::UserNotFound(user)) => (
                StatusCode::NOT_FOUND,
                "User not found",
                Some(user.clone()),
            ),
            ApiError::Save(e) => {
                error!(error = %e, request_id = ?request_id, "Failed to save upload");
                (StatusCode::INTERNAL_SERVER_ERROR, "Failed to save file", None)
            }
            ApiError::Database(e) => {
                error!(error = %e, request_id = ?request_id, "Database error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error", None)
            }
            ApiError::Storage(e) => {
                error!(error = %e, request_id = ?request_id, "Storage error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Storage error", None)
            }
            ApiError::Io(e) => {
                error!(error = %e, request_id = ?request_id, "I/O error");
                (StatusCode::INTERNAL_SERVER_ERROR, "I/O error", None)
            }
        };

        let body = ErrorResponse {
            error: error.to_string(),
            detail,
            request_id,
        };

        (status, Json(body)).into_response()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.into_response_with_id(None)
    }
}
