use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::api_state::ApiState;

/// Process is up. Never touches dependencies.
pub async fn live() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

/// 200 once the database answers, 503 otherwise. Also reports artifact cache occupancy.
pub async fn ready(State(state): State<ApiState>) -> impl IntoResponse {
    let cache = state.engine.cache().stats();
    let cache = json!({
        "entries": cache.entry_count,
        "bytes": cache.weighted_size,
    });

    match state.db.client.query("RETURN true").await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "checks": { "db": "ok" },
                "artifact_cache": cache,
            })),
        ),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "error",
                "checks": { "db": "fail" },
                "reason": err.to_string(),
            })),
        ),
    }
}
