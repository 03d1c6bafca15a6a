use std::sync::Arc;

use common::{
    storage::{db::SurrealDbClient, progress::ProgressStore},
    utils::config::AppConfig,
};
use ingestion_pipeline::IngestionPipeline;
use retrieval_pipeline::{AnswerComposer, BriefService, RetrievalEngine};

/// Everything the HTTP handlers reach for. Built once in the composition root.
#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub config: AppConfig,
    pub progress: ProgressStore,
    pub pipeline: Arc<IngestionPipeline>,
    pub engine: Arc<RetrievalEngine>,
    pub composer: Arc<AnswerComposer>,
    pub briefs: Arc<BriefService>,
}
