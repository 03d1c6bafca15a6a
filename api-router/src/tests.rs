use std::{sync::Arc, time::Duration};

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use chrono::Utc;
use common::{
    storage::{
        db::SurrealDbClient,
        lock::LockManager,
        progress::ProgressStore,
        store::testing::memory_storage,
        types::{
            document::{Document, DocumentState},
            job_payload::Stage,
            organization::{Organization, Plan, BRIEF_CREDITS_EXHAUSTED},
            pipeline_job::PipelineJob,
            tender::Tender,
        },
    },
    utils::{config::AppConfig, embedding::EmbeddingProvider},
};
use ingestion_pipeline::{DefaultPipelineServices, IngestionConfig, IngestionPipeline};
use retrieval_pipeline::{AnswerComposer, BriefService, RetrievalConfig, RetrievalEngine};
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

use crate::{
    api_routes_v1,
    api_state::ApiState,
    error::{INDEX_FAILED, INDEX_NOT_READY},
};

const API_KEY: &str = "test-key";
const BOUNDARY: &str = "tender-upload-boundary";

struct TestApp {
    router: Router,
    state: ApiState,
    org: Organization,
}

async fn test_app(brief_credits: u32) -> TestApp {
    let db = Arc::new(
        SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb"),
    );
    db.ensure_initialized().await.expect("schema");

    let config = AppConfig::default();
    let storage = memory_storage();
    let progress = ProgressStore::new(Arc::clone(&db), Duration::from_secs(600));
    let locks = LockManager::new(Arc::clone(&db));
    let embeddings = Arc::new(EmbeddingProvider::fallback());

    let pipeline = Arc::new(IngestionPipeline::new(
        Arc::clone(&db),
        storage.clone(),
        locks.clone(),
        progress.clone(),
        IngestionConfig::from_app_config(&config),
        Arc::new(DefaultPipelineServices::new(Arc::clone(&embeddings), None)),
    ));
    let engine = Arc::new(RetrievalEngine::new(
        Arc::clone(&db),
        storage,
        embeddings,
        RetrievalConfig::from_app_config(&config),
    ));
    let composer = Arc::new(AnswerComposer::new(None, config.context_char_budget));
    let briefs = Arc::new(BriefService::new(
        Arc::clone(&db),
        locks,
        Arc::clone(&engine),
        Arc::clone(&composer),
    ));

    let org = Organization::new("Acme".into(), API_KEY.into(), Plan::Trial, brief_credits);
    db.store_item(org.clone()).await.expect("store org");

    let state = ApiState {
        db,
        config,
        progress,
        pipeline,
        engine,
        composer,
        briefs,
    };
    let router = Router::new()
        .nest("/api/v1", api_routes_v1(&state))
        .with_state(state.clone());

    TestApp { router, state, org }
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
    let response = app
        .router
        .clone()
        .oneshot(request)
        .await
        .expect("router response");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("X-API-Key", API_KEY)
        .body(Body::empty())
        .expect("request")
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {API_KEY}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn multipart_upload(uri: &str, file_name: &str, contents: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{file_name}\"\r\nContent-Type: text/plain\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(contents);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri(uri)
        .header("X-API-Key", API_KEY)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .expect("request")
}

async fn drain(app: &TestApp) {
    loop {
        let mut progressed = false;
        for stage in Stage::ALL {
            let claimed = PipelineJob::claim_next_ready(
                &app.state.db,
                stage,
                "test-worker",
                Utc::now(),
                Duration::from_secs(60),
            )
            .await
            .expect("claim");
            if let Some(job) = claimed {
                let _ = app.state.pipeline.process_job(job).await;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
}

async fn stored_document(app: &TestApp, state: DocumentState) -> Document {
    let mut document = Document::new(
        app.org.id.clone(),
        "t1".into(),
        Uuid::new_v4().simple().to_string(),
        "draft.txt".into(),
        4,
        "text/plain".into(),
        "raw/draft.txt".into(),
        "upload-1".into(),
    );
    document.state = state;
    document.last_error = (state == DocumentState::Failed).then(|| "extraction failed".into());
    app.state
        .db
        .store_item(document.clone())
        .await
        .expect("store document");
    document
}

#[tokio::test]
async fn health_checks_are_public_and_everything_else_needs_a_key() {
    let app = test_app(1).await;

    let live = Request::builder()
        .uri("/api/v1/live")
        .body(Body::empty())
        .expect("request");
    assert_eq!(send(&app, live).await.0, StatusCode::OK);

    let ready = Request::builder()
        .uri("/api/v1/ready")
        .body(Body::empty())
        .expect("request");
    assert_eq!(send(&app, ready).await.0, StatusCode::OK);

    let anonymous = Request::builder()
        .uri("/api/v1/documents/any/progress")
        .body(Body::empty())
        .expect("request");
    assert_eq!(send(&app, anonymous).await.0, StatusCode::UNAUTHORIZED);

    let wrong_key = Request::builder()
        .uri("/api/v1/documents/any/progress")
        .header("X-API-Key", "nope")
        .body(Body::empty())
        .expect("request");
    assert_eq!(send(&app, wrong_key).await.0, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn uploaded_document_is_indexed_and_answers_with_citations() {
    let app = test_app(1).await;

    let (status, body) = send(
        &app,
        multipart_upload(
            "/api/v1/tenders/t1/uploads",
            "alpha.txt",
            b"Alpha Beta\x0cGamma Delta",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["upload_id"].as_str().is_some_and(|id| !id.is_empty()));
    assert_eq!(body["status"], "queued");

    drain(&app).await;

    let documents = Document::list_by_tender(&app.org.id, "t1", &app.state.db)
        .await
        .expect("documents");
    assert_eq!(documents.len(), 1);
    let document_id = documents[0].id.clone();

    let (status, progress) =
        send(&app, get(&format!("/api/v1/documents/{document_id}/progress"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(progress["stage"], "complete");
    assert_eq!(progress["docHash"], documents[0].doc_hash.as_str());

    let (status, answer) = send(
        &app,
        post_json(
            "/api/v1/query",
            &serde_json::json!({ "question": "Alpha Beta", "fileId": document_id, "topK": 1 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(answer["citations"][0]["docId"], document_id.as_str());
    assert_eq!(answer["citations"][0]["pageStart"], 1);
    assert!(answer["answer"]
        .as_str()
        .is_some_and(|text| text.contains("Alpha Beta")));
}

#[tokio::test]
async fn queries_distinguish_indexing_from_failed_documents() {
    let app = test_app(1).await;
    let pending = stored_document(&app, DocumentState::Embedding).await;
    let failed = stored_document(&app, DocumentState::Failed).await;

    let (status, body) = send(
        &app,
        post_json(
            "/api/v1/query",
            &serde_json::json!({ "question": "scope?", "documentId": pending.id }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], INDEX_NOT_READY);

    let (status, body) = send(
        &app,
        post_json(
            "/api/v1/query",
            &serde_json::json!({ "question": "scope?", "documentId": failed.id }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], INDEX_FAILED);

    let (status, _) = send(
        &app,
        post_json(
            "/api/v1/query",
            &serde_json::json!({ "question": "  ", "documentId": pending.id }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn progress_and_retry_of_failed_documents() {
    let app = test_app(1).await;
    let failed = stored_document(&app, DocumentState::Failed).await;

    let (status, progress) =
        send(&app, get(&format!("/api/v1/documents/{}/progress", failed.id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(progress["stage"], "failed");
    assert_eq!(progress["message"], "extraction failed");

    let (status, body) = send(
        &app,
        post_json(
            &format!("/api/v1/documents/{}/retry", failed.id),
            &Value::Null,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resumed_stage"], "extract");

    let (status, _) = send(
        &app,
        post_json(
            &format!("/api/v1/documents/{}/retry", failed.id),
            &Value::Null,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, get("/api/v1/documents/missing/progress")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn briefs_without_credits_are_forbidden() {
    let app = test_app(0).await;
    app.state
        .db
        .store_item(Tender::new("t1".into(), app.org.id.clone(), "Harbour works".into()))
        .await
        .expect("tender");

    let (status, body) = send(
        &app,
        post_json("/api/v1/tenders/t1/brief", &Value::Null),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], BRIEF_CREDITS_EXHAUSTED);

    let org = Organization::get(&app.org.id, &app.state.db)
        .await
        .expect("org");
    assert_eq!(org.used_briefs, 0);
}
