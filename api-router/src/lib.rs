use api_state::ApiState;
use axum::{
    extract::{DefaultBodyLimit, FromRef},
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use middleware_api_auth::api_auth;
use routes::{
    briefs::generate_brief,
    documents::{document_progress, retry_document},
    health::{live, ready},
    query::query_document,
    uploads::upload_files,
};

pub mod api_state;
pub mod error;
mod middleware_api_auth;
mod routes;

/// Multipart framing on top of the file bytes themselves.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Router for API functionality, version 1
pub fn api_routes_v1<S>(app_state: &ApiState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    ApiState: FromRef<S>,
{
    // Public, unauthenticated health endpoints
    let public = Router::new()
        .route("/ready", get(ready))
        .route("/live", get(live));

    let upload_limit = app_state
        .config
        .max_upload_bytes
        .saturating_add(MULTIPART_OVERHEAD_BYTES);

    let protected = Router::new()
        .route(
            "/tenders/{tender_id}/uploads",
            post(upload_files).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/tenders/{tender_id}/brief", post(generate_brief))
        .route("/documents/{document_id}/progress", get(document_progress))
        .route("/documents/{document_id}/retry", post(retry_document))
        .route("/query", post(query_document))
        .route_layer(from_fn_with_state(app_state.clone(), api_auth));

    public.merge(protected)
}

#[cfg(test)]
mod tests;
