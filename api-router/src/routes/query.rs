use axum::{extract::State, response::IntoResponse, Extension, Json};
use common::storage::types::organization::Organization;
use serde::Deserialize;
use tracing::info;

use crate::{api_state::ApiState, error::ApiError};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub question: String,
    #[serde(alias = "fileId")]
    pub document_id: String,
    #[serde(default)]
    pub top_k: Option<usize>,
}

/// Answers a question from one document's index.
pub async fn query_document(
    State(state): State<ApiState>,
    Extension(org): Extension<Organization>,
    Json(request): Json<QueryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let question = request.question.trim();
    if question.is_empty() {
        return Err(ApiError::ValidationError("question must not be empty".into()));
    }

    let passages = state
        .engine
        .search_document(&org.id, &request.document_id, question, request.top_k)
        .await?;
    let answer = state.composer.answer(question, &passages).await?;

    info!(
        org_id = %org.id,
        document_id = %request.document_id,
        passages = passages.len(),
        citations = answer.citations.len(),
        "query answered"
    );
    Ok(Json(answer))
}
