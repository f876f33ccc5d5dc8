//! Single-shot detection endpoint.

use axum::extract::multipart::{Field, MultipartRejection};
use axum::extract::{Multipart, State};
use axum::Json;
use serde::Serialize;

use detgate_models::MediaKind;

use crate::error::{ApiError, ApiResult};
use crate::services::MediaUpload;
use crate::state::AppState;

/// Successful detection body.
#[derive(Debug, Serialize)]
pub struct DetectResponse {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// `POST /api/detect`: multipart upload with one file field (`image`,
/// `video` or `file`).
pub async fn detect(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<DetectResponse>> {
    let multipart = multipart.map_err(|e| ApiError::invalid_input(e.body_text()))?;
    let upload = read_upload(multipart).await?;

    let detection = state.detector.detect_detached(upload).await?;

    Ok(Json(DetectResponse {
        label: detection.label,
        confidence: detection.confidence_hint,
    }))
}

/// Pull the first recognised file field out of the form.
async fn read_upload(mut multipart: Multipart) -> ApiResult<MediaUpload> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::invalid_input(e.body_text()))?
    {
        let Some(field_kind) = field.name().and_then(MediaKind::from_field_name) else {
            continue;
        };
        return read_file_field(field, field_kind).await;
    }

    Err(ApiError::invalid_input("no file field in upload"))
}

async fn read_file_field(field: Field<'_>, field_kind: MediaKind) -> ApiResult<MediaUpload> {
    let file_name = field
        .file_name()
        .map(str::to_string)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| ApiError::invalid_input("field is not a file"))?;

    let media_kind = field
        .content_type()
        .and_then(MediaKind::from_content_type)
        .unwrap_or(field_kind);

    let bytes = field
        .bytes()
        .await
        .map_err(|e| ApiError::invalid_input(e.body_text()))?;
    if bytes.is_empty() {
        return Err(ApiError::invalid_input("empty file"));
    }

    Ok(MediaUpload {
        bytes: bytes.to_vec(),
        file_name,
        media_kind,
    })
}
