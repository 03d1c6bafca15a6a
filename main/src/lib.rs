//! Composition root shared by the `server`, `worker` and combined `main` binaries.
//!
//! Every client is built here once and handed down explicitly.

use std::{sync::Arc, time::Duration};

use api_router::{api_routes_v1, api_state::ApiState};
use async_openai::{config::OpenAIConfig, Client};
use axum::Router;
use common::{
    storage::{
        db::SurrealDbClient, lock::LockManager, progress::ProgressStore, store::StorageManager,
    },
    utils::{
        config::{get_config, AppConfig},
        embedding::EmbeddingProvider,
        llm::{LanguageModel, OpenAiLanguageModel},
    },
};
use ingestion_pipeline::{DefaultPipelineServices, IngestionConfig, IngestionPipeline};
use retrieval_pipeline::{AnswerComposer, BriefService, RetrievalConfig, RetrievalEngine};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub struct Runtime {
    pub config: AppConfig,
    pub db: Arc<SurrealDbClient>,
    pub locks: LockManager,
    pub pipeline: Arc<IngestionPipeline>,
    pub api_state: ApiState,
}

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();
}

pub async fn connect_db(config: &AppConfig) -> anyhow::Result<Arc<SurrealDbClient>> {
    let db = SurrealDbClient::new(
        &config.surrealdb_address,
        &config.surrealdb_username,
        &config.surrealdb_password,
        &config.surrealdb_namespace,
        &config.surrealdb_database,
    )
    .await?;
    db.ensure_initialized().await?;
    Ok(Arc::new(db))
}

/// Wires providers, pipeline and retrieval on top of an initialized database and store.
pub fn build_runtime(
    config: AppConfig,
    db: Arc<SurrealDbClient>,
    storage: StorageManager,
) -> Runtime {
    let openai_client = config
        .openai_api_key
        .as_deref()
        .filter(|_| config.has_openai_key())
        .map(|key| {
            Arc::new(Client::with_config(
                OpenAIConfig::new()
                    .with_api_key(key)
                    .with_api_base(&config.openai_base_url),
            ))
        });

    let embeddings = Arc::new(EmbeddingProvider::from_config(
        &config,
        openai_client.clone(),
    ));
    let language_model: Option<Arc<dyn LanguageModel>> = openai_client.map(|client| {
        Arc::new(OpenAiLanguageModel::new(client, config.chat_model.clone()))
            as Arc<dyn LanguageModel>
    });
    info!(
        embedding_model = %embeddings.model_code(),
        embedding_dimension = embeddings.dimension(),
        language_model = language_model.as_ref().map_or("none", |llm| llm.model_name()),
        "providers initialized"
    );

    let locks = LockManager::new(Arc::clone(&db));
    let progress = ProgressStore::new(
        Arc::clone(&db),
        Duration::from_secs(config.progress_ttl_secs.max(1)),
    );

    let pipeline = Arc::new(IngestionPipeline::new(
        Arc::clone(&db),
        storage.clone(),
        locks.clone(),
        progress.clone(),
        IngestionConfig::from_app_config(&config),
        Arc::new(DefaultPipelineServices::new(
            Arc::clone(&embeddings),
            language_model.clone(),
        )),
    ));

    let engine = Arc::new(RetrievalEngine::new(
        Arc::clone(&db),
        storage,
        embeddings,
        RetrievalConfig::from_app_config(&config),
    ));
    let composer = Arc::new(AnswerComposer::new(
        language_model,
        config.context_char_budget,
    ));
    let briefs = Arc::new(BriefService::new(
        Arc::clone(&db),
        locks.clone(),
        Arc::clone(&engine),
        Arc::clone(&composer),
    ));

    let api_state = ApiState {
        db: Arc::clone(&db),
        config: config.clone(),
        progress,
        pipeline: Arc::clone(&pipeline),
        engine,
        composer,
        briefs,
    };

    Runtime {
        config,
        db,
        locks,
        pipeline,
        api_state,
    }
}

/// Loads configuration and connects every backend the binaries share.
pub async fn bootstrap() -> anyhow::Result<Runtime> {
    let config = get_config()?;
    let db = connect_db(&config).await?;
    let storage = StorageManager::new(&config).await?;
    info!(
        backend = ?storage.backend_kind(),
        bucket = storage.bucket(),
        "Object storage initialized"
    );

    let runtime = build_runtime(config, db, storage);
    spawn_lock_self_check(&runtime.locks);
    Ok(runtime)
}

pub fn router(runtime: &Runtime) -> Router {
    Router::new()
        .nest("/api/v1", api_routes_v1(&runtime.api_state))
        .with_state(runtime.api_state.clone())
}

/// Runs the lock self-check in the background and reports its outcome.
pub fn spawn_lock_self_check(locks: &LockManager) -> JoinHandle<()> {
    let check = locks.spawn_self_check();
    tokio::spawn(async move {
        match check.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "lock self-check failed"),
            Err(err) => error!(error = %err, "lock self-check task panicked"),
        }
    })
}

pub async fn serve(runtime: &Runtime) -> anyhow::Result<()> {
    let serve_address = format!("0.0.0.0:{}", runtime.config.http_port);
    info!("Starting server listening on {serve_address}");
    let listener = tokio::net::TcpListener::bind(serve_address).await?;
    axum::serve(listener, router(runtime)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, http::StatusCode};
    use common::{storage::store::testing::memory_storage, utils::config::StorageKind};
    use tower::ServiceExt;
    use uuid::Uuid;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn smoke_startup_with_in_memory_surrealdb() {
        let database = format!("test_db_{}", Uuid::new_v4());
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &database)
                .await
                .expect("in-memory surrealdb"),
        );
        db.ensure_initialized().await.expect("schema");

        let config = AppConfig {
            surrealdb_database: database,
            http_port: 0,
            storage: StorageKind::Memory,
            ..Default::default()
        };
        let runtime = build_runtime(config, db, memory_storage());

        spawn_lock_self_check(&runtime.locks)
            .await
            .expect("self-check task");

        let app = router(&runtime);
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/live")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("router response");
        assert_eq!(response.status(), StatusCode::OK);

        let ready_response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/ready")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("ready response");
        assert_eq!(ready_response.status(), StatusCode::OK);
    }
}
