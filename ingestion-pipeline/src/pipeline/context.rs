use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        progress::{ProgressPhase, ProgressStore},
        store::StorageManager,
        types::{
            document::Document,
            job_payload::{DocumentJob, Stage},
            pipeline_job::PipelineJob,
        },
    },
};
use tracing::{error, warn};

use super::{config::IngestionConfig, services::PipelineServices};

/// Everything a stage handler may touch while running one job.
pub struct StageContext<'a> {
    pub job_id: String,
    pub attempt: u32,
    pub stage: Stage,
    pub db: &'a SurrealDbClient,
    pub storage: &'a StorageManager,
    pub progress: &'a ProgressStore,
    pub config: &'a IngestionConfig,
    pub services: &'a dyn PipelineServices,
}

impl<'a> StageContext<'a> {
    pub fn new(
        job: &PipelineJob,
        db: &'a SurrealDbClient,
        storage: &'a StorageManager,
        progress: &'a ProgressStore,
        config: &'a IngestionConfig,
        services: &'a dyn PipelineServices,
    ) -> Self {
        Self {
            job_id: job.id.clone(),
            attempt: job.attempts,
            stage: job.stage,
            db,
            storage,
            progress,
            config,
            services,
        }
    }

    pub async fn document(&self, job: &DocumentJob) -> Result<Document, AppError> {
        let document = Document::get(&job.document_id, self.db).await?;
        if document.doc_hash != job.doc_hash {
            return Err(AppError::Consistency(format!(
                "job expects {} but document {} has hash {}",
                job.doc_hash, document.id, document.doc_hash
            )));
        }
        Ok(document)
    }

    /// Progress is advisory; a failed write is logged and otherwise ignored.
    pub async fn report(
        &self,
        document_id: &str,
        phase: ProgressPhase,
        percent: f32,
        message: &str,
    ) {
        if let Err(err) = self
            .progress
            .set_phase(document_id, phase, percent, Some(message.to_string()))
            .await
        {
            warn!(document_id, phase = phase.as_str(), error = %err, "progress update failed");
        }
    }

    pub fn abort(&self, err: AppError) -> AppError {
        error!(
            job_id = %self.job_id,
            stage = self.stage.as_str(),
            attempt = self.attempt,
            error = %err,
            "pipeline stage aborted"
        );
        err
    }
}
