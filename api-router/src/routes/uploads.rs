use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use axum_typed_multipart::{FieldData, TryFromMultipart, TypedMultipart};
use common::storage::types::organization::Organization;
use serde::Serialize;
use tracing::info;

use crate::{api_state::ApiState, error::ApiError};

#[derive(Debug, TryFromMultipart)]
pub struct UploadParams {
    #[form_data(limit = "unlimited")]
    #[form_data(default)]
    pub files: Vec<FieldData<Bytes>>,
}

#[derive(Debug, Serialize)]
pub struct AcceptedUpload {
    pub upload_id: String,
    pub file_name: String,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub upload_id: String,
    pub status: &'static str,
    pub uploads: Vec<AcceptedUpload>,
}

/// Accepts one or more files (or archives) for a tender and queues their discovery.
pub async fn upload_files(
    State(state): State<ApiState>,
    Extension(org): Extension<Organization>,
    Path(tender_id): Path<String>,
    TypedMultipart(input): TypedMultipart<UploadParams>,
) -> Result<impl IntoResponse, ApiError> {
    if input.files.is_empty() {
        return Err(ApiError::ValidationError(
            "expected at least one file in the `files` field".to_string(),
        ));
    }

    let max_bytes = state.config.max_upload_bytes;
    if let Some(too_big) = input.files.iter().find(|file| file.contents.len() > max_bytes) {
        return Err(ApiError::PayloadTooLarge(format!(
            "{} exceeds {max_bytes} bytes",
            too_big.metadata.file_name.as_deref().unwrap_or("upload")
        )));
    }

    info!(
        org_id = %org.id,
        tender_id = %tender_id,
        file_count = input.files.len(),
        "Received tender upload"
    );

    let mut uploads = Vec::with_capacity(input.files.len());
    for file in input.files {
        let file_name = file.metadata.file_name.unwrap_or_default();
        let upload = state
            .pipeline
            .submit_upload(&org.id, &tender_id, &file_name, file.contents)
            .await?;
        uploads.push(AcceptedUpload {
            upload_id: upload.id,
            file_name: upload.file_name,
            status: "queued",
        });
    }

    let first = uploads
        .first()
        .map(|upload| upload.upload_id.clone())
        .unwrap_or_default();

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            upload_id: first,
            status: "queued",
            uploads,
        }),
    ))
}
