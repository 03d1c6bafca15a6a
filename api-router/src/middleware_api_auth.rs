use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use common::storage::types::organization::Organization;

use crate::{api_state::ApiState, error::ApiError};

/// Resolves the calling organisation from `X-API-Key` or a bearer token.
pub async fn api_auth(
    State(state): State<ApiState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let api_key = extract_api_key(&request)
        .ok_or_else(|| ApiError::Unauthorized("You have to be authenticated".to_string()))?;

    let org = Organization::find_by_api_key(&api_key, &state.db)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("Unknown API key".to_string()))?;

    request.extensions_mut().insert(org);

    Ok(next.run(request).await)
}

fn extract_api_key(request: &Request) -> Option<String> {
    request
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            request
                .headers()
                .get("Authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|auth| auth.strip_prefix("Bearer ").map(str::trim))
        })
        .filter(|key| !key.is_empty())
        .map(String::from)
}
