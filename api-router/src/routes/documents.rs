use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Extension, Json,
};
use common::storage::{
    progress::ProgressView,
    types::{document::Document, organization::Organization},
};
use serde_json::json;

use crate::{api_state::ApiState, error::ApiError};

async fn owned_document(
    state: &ApiState,
    org: &Organization,
    document_id: &str,
) -> Result<Document, ApiError> {
    let document = Document::get(document_id, &state.db).await?;
    if document.org_id != org.id {
        return Err(ApiError::NotFound(format!("document {document_id}")));
    }
    Ok(document)
}

pub async fn document_progress(
    State(state): State<ApiState>,
    Extension(org): Extension<Organization>,
    Path(document_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let document = owned_document(&state, &org, &document_id).await?;
    let snapshot = state.progress.get(&document.id).await?;

    Ok(Json(ProgressView::from_state(
        &document.doc_hash,
        document.state,
        document.last_error.as_deref(),
        snapshot.as_ref(),
    )))
}

pub async fn retry_document(
    State(state): State<ApiState>,
    Extension(org): Extension<Organization>,
    Path(document_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let document = owned_document(&state, &org, &document_id).await?;
    let stage = state.pipeline.retry_document(&document.id).await?;

    Ok(Json(json!({
        "document_id": document.id,
        "resumed_stage": stage.lock_name(),
    })))
}
