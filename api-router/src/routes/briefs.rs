use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Extension, Json,
};
use common::storage::types::organization::Organization;

use crate::{api_state::ApiState, error::ApiError};

pub async fn generate_brief(
    State(state): State<ApiState>,
    Extension(org): Extension<Organization>,
    Path(tender_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let brief = state.briefs.generate_brief(&org.id, &tender_id).await?;
    Ok(Json(brief))
}
