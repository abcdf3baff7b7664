use axum::Json;
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::header::CONTENT_LENGTH;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use jiff::Timestamp;
use serde::Serialize;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::api::{ApiError, AppState};
use crate::auth::{AuthError, bearer_token};
use crate::db::FileRecord;
use crate::files::{NewFile, RANDOM_NAME_LEN, UploadSource, random_name};
use crate::mime::{SNIFF_LEN, sniff};

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub request_id: String,
    /// Path the file can be fetched from, if it is public.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub file: FileRecord,
}

/// Who is uploading, as far as limits and expiry go.
struct Uploader {
    owner_id: String,
    expires_at: i64,
    limit: Option<u64>,
}

/// A file part spooled to disk.
struct Spooled {
    file: NamedTempFile,
    filename: String,
    head: Vec<u8>,
}

/// POST /api/v1/upload - Multipart upload with a `file` part
pub(super) async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
) -> Result<Response, Response> {
    let request_id = random_name(RANDOM_NAME_LEN);
    debug!(request_id = %request_id, "Upload started");

    match handle_upload(&state, &headers, request, &request_id).await {
        Ok(response) => Ok((StatusCode::CREATED, Json(response)).into_response()),
        Err(err) => {
            debug!(request_id = %request_id, error = %err, "Upload rejected");
            Err(err.into_response_with_id(Some(request_id)))
        }
    }
}

async fn handle_upload(
    state: &AppState,
    headers: &HeaderMap,
    request: Request,
    request_id: &str,
) -> Result<UploadResponse, ApiError> {
    let uploader = identify(state, headers)?;

    // reject early when the client announces an oversized body
    if let Some(limit) = uploader.limit
        && let Some(length) = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        && length > limit
    {
        return Err(ApiError::TooLarge { limit });
    }

    let mut multipart = Multipart::from_request(request, state)
        .await
        .map_err(|rejection| ApiError::InvalidRequest(rejection.body_text()))?;

    let mut spooled = None;
    let mut private = false;
    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("file") if spooled.is_none() => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let file = NamedTempFile::new()?;
                let mut out = tokio::fs::File::create(file.path()).await?;
                let mut head = Vec::with_capacity(SNIFF_LEN);
                let mut total = 0u64;

                while let Some(chunk) = field.chunk().await? {
                    total += chunk.len() as u64;
                    if let Some(limit) = uploader.limit
                        && total > limit
                    {
                        return Err(ApiError::TooLarge { limit });
                    }
                    if head.len() < SNIFF_LEN {
                        let take = (SNIFF_LEN - head.len()).min(chunk.len());
                        head.extend_from_slice(&chunk[..take]);
                    }
                    out.write_all(&chunk).await?;
                }
                out.flush().await?;
                out.sync_all().await?;

                spooled = Some(Spooled {
                    file,
                    filename,
                    head,
                });
            }
            Some("private") => {
                let value = field.text().await?;
                private = matches!(value.trim(), "1" | "true" | "on" | "yes");
            }
            _ => {}
        }
    }

    let spooled = spooled.ok_or(ApiError::MissingFile)?;
    let mime_type = sniff(&spooled.head);
    if !state.policy.is_allowed(mime_type) {
        return Err(ApiError::DisallowedType(mime_type.to_string()));
    }

    let file = NewFile {
        owner_id: uploader.owner_id,
        filename: spooled.filename,
        mime_type: mime_type.to_string(),
        expires_at: uploader.expires_at,
        private,
    };
    let record = state
        .files
        .save(file, UploadSource::Spooled(spooled.file.into_temp_path()))
        .await?;

    info!(
        request_id = %request_id,
        filename = %record.filename,
        mime_type = %record.mime_type,
        "Upload complete"
    );

    Ok(UploadResponse {
        request_id: request_id.to_string(),
        url: (!record.private).then(|| format!("/api/v1/{}", record.filename)),
        file: record,
    })
}

fn identify(state: &AppState, headers: &HeaderMap) -> Result<Uploader, ApiError> {
    let policy = &state.policy;
    match bearer_token(headers) {
        None => {
            if !policy.allow_guest_uploads {
                return Err(ApiError::GuestUploadsDisabled);
            }
            Ok(Uploader {
                owner_id: String::new(),
                expires_at: policy.guest_expires_at(Timestamp::now().as_second()),
                limit: policy.size_limit(true),
            })
        }
        Some(token) => {
            let verifier = state.tokens.as_ref().ok_or(AuthError::NotConfigured)?;
            Ok(Uploader {
                owner_id: verifier.verify(token)?,
                expires_at: 0,
                limit: policy.size_limit(false),
            })
        }
    }
}
