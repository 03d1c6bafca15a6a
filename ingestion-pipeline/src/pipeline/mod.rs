mod config;
mod context;
mod services;
mod stages;

pub use config::{IngestionConfig, IngestionTuning};
#[allow(clippy::module_name_repetitions)]
pub use services::{DefaultPipelineServices, PipelineServices};
pub use stages::document_job;

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use common::{
    error::{truncate_error_message, AppError},
    storage::{
        db::SurrealDbClient,
        keys,
        lock::LockManager,
        progress::{ProgressPhase, ProgressStore},
        store::StorageManager,
        types::{
            document::{Document, DocumentState, MAX_ERROR_CHARS},
            job_payload::{ChunkJob, EmbedJob, JobPayload, ManifestJob, Stage, SummaryJob},
            pipeline_job::{JobErrorInfo, PipelineJob},
            tender::Tender,
            upload::Upload,
        },
    },
};
use tracing::{debug, info, warn};

use crate::utils::archive::guess_mime;

use self::{context::StageContext, stages::embed::embeddings_published};

#[allow(clippy::module_name_repetitions)]
pub struct IngestionPipeline {
    db: Arc<SurrealDbClient>,
    storage: StorageManager,
    locks: LockManager,
    progress: ProgressStore,
    pipeline_config: IngestionConfig,
    services: Arc<dyn PipelineServices>,
}

impl IngestionPipeline {
    pub fn new(
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        locks: LockManager,
        progress: ProgressStore,
        pipeline_config: IngestionConfig,
        services: Arc<dyn PipelineServices>,
    ) -> Self {
        Self {
            db,
            storage,
            locks,
            progress,
            pipeline_config,
            services,
        }
    }

    pub fn config(&self) -> &IngestionConfig {
        &self.pipeline_config
    }

    /// Stores an uploaded payload and queues its manifest discovery.
    #[tracing::instrument(skip_all, fields(org_id = %org_id, tender_id = %tender_id))]
    pub async fn submit_upload(
        &self,
        org_id: &str,
        tender_id: &str,
        file_name: &str,
        bytes: Bytes,
    ) -> Result<Upload, AppError> {
        let file_name = keys::sanitize_file_name(file_name);
        if file_name.is_empty() {
            return Err(AppError::Validation("upload needs a file name".into()));
        }
        if bytes.is_empty() {
            return Err(AppError::Validation(format!("{file_name} is empty")));
        }

        Tender::get_or_create(tender_id, org_id, &self.db).await?;

        let mut upload = Upload::new(
            org_id.to_string(),
            tender_id.to_string(),
            file_name.clone(),
            String::new(),
            guess_mime(&file_name),
            bytes.len() as u64,
        );
        upload.storage_key = keys::upload_key(org_id, tender_id, &upload.id, &file_name);

        self.storage.put(&upload.storage_key, bytes).await?;
        self.db.store_item(upload.clone()).await?;

        PipelineJob::enqueue(
            JobPayload::Manifest(ManifestJob {
                org_id: org_id.to_string(),
                tender_id: tender_id.to_string(),
                upload_id: upload.id.clone(),
                filename: file_name,
                bucket: self.storage.bucket().to_string(),
                storage_key: upload.storage_key.clone(),
            }),
            &self.db,
        )
        .await?;

        info!(upload_id = %upload.id, bytes = upload.byte_size, "upload accepted");
        Ok(upload)
    }

    #[tracing::instrument(
        skip_all,
        fields(
            job_id = %job.id,
            stage = job.stage.as_str(),
            attempt = job.attempts,
            worker_id = job.worker_id.as_deref().unwrap_or("unknown-worker")
        )
    )]
    pub async fn process_job(&self, job: PipelineJob) -> Result<(), AppError> {
        let job = job.mark_processing(&self.db).await?;
        let ctx = StageContext::new(
            &job,
            &self.db,
            &self.storage,
            &self.progress,
            &self.pipeline_config,
            self.services.as_ref(),
        );

        match self.run_locked(&ctx, &job.payload).await {
            Ok(None) => {
                let delay = self.pipeline_config.tuning.lock_busy_delay();
                job.defer(delay, &self.db).await?;
                info!(
                    job_id = %job.id,
                    retry_in_secs = delay.as_secs(),
                    "stage lock held by another worker; job deferred"
                );
                Ok(())
            }
            Ok(Some(successors)) => {
                for payload in successors {
                    PipelineJob::enqueue(payload, &self.db).await?;
                }
                job.mark_succeeded(&self.db).await?;
                debug!(job_id = %job.id, "pipeline job succeeded");
                Ok(())
            }
            Err(err) => {
                let reason = truncate_error_message(&err.to_string(), MAX_ERROR_CHARS);
                let error_info = JobErrorInfo {
                    code: Some(err.code().to_string()),
                    message: reason.clone(),
                };

                if err.is_retryable() && job.can_retry() {
                    let delay = self.retry_delay(job.attempts);
                    job.mark_failed(error_info, delay, &self.db).await?;
                    warn!(
                        job_id = %job.id,
                        attempt = job.attempts,
                        retry_in_secs = delay.as_secs(),
                        "pipeline job failed; scheduled retry"
                    );
                } else {
                    let failed = job
                        .mark_failed(error_info.clone(), Duration::from_secs(0), &self.db)
                        .await?;
                    failed.mark_dead_letter(error_info, &self.db).await?;
                    self.record_terminal_failure(&job.payload, &reason).await?;
                    warn!(
                        job_id = %job.id,
                        attempt = job.attempts,
                        "pipeline job failed; moved to dead letter queue"
                    );
                }

                Err(AppError::Processing(reason))
            }
        }
    }

    /// Runs the stage under its per-document lock. Returns `None` without running anything
    /// when another worker holds the lock.
    async fn run_locked(
        &self,
        ctx: &StageContext<'_>,
        payload: &JobPayload,
    ) -> Result<Option<Vec<JobPayload>>, AppError> {
        let stage = payload.stage();
        let key = match (payload, payload.document()) {
            (_, Some(document)) => keys::stage_lock_key(&document.document_id, stage.lock_name()),
            (JobPayload::Manifest(job), None) => {
                keys::stage_lock_key(&job.upload_id, stage.lock_name())
            }
            (_, None) => {
                return Err(AppError::InternalError(format!(
                    "{} job without document fields",
                    stage.as_str()
                )))
            }
        };

        let outcome = self
            .locks
            .with_lock(&key, self.pipeline_config.tuning.lock_ttl(), || {
                Self::dispatch(ctx, payload)
            })
            .await?;

        if outcome.is_none() {
            debug!(lock_key = %key, "stage lock busy");
        }
        Ok(outcome)
    }

    async fn dispatch(
        ctx: &StageContext<'_>,
        payload: &JobPayload,
    ) -> Result<Vec<JobPayload>, AppError> {
        let result = match payload {
            JobPayload::Manifest(job) => stages::manifest::discover(ctx, job).await,
            JobPayload::Extract(job) => stages::extract::extract(ctx, job).await,
            JobPayload::Chunk(job) => stages::chunk::chunk(ctx, job).await,
            JobPayload::Embed(job) => stages::embed::embed(ctx, job).await,
            JobPayload::Summary(job) => stages::summary::summarize(ctx, job).await,
        };
        result.map_err(|err| ctx.abort(err))
    }

    async fn record_terminal_failure(
        &self,
        payload: &JobPayload,
        reason: &str,
    ) -> Result<(), AppError> {
        match payload {
            JobPayload::Manifest(job) => {
                Upload::mark_failed(&job.upload_id, reason, &self.db).await
            }
            other => {
                let Some(document) = other.document() else {
                    return Ok(());
                };
                Document::mark_failed(&document.document_id, reason, &self.db).await?;
                if let Err(err) = self
                    .progress
                    .set_phase(
                        &document.document_id,
                        ProgressPhase::Failed,
                        0.0,
                        Some(reason.to_string()),
                    )
                    .await
                {
                    warn!(
                        document_id = %document.document_id,
                        error = %err,
                        "progress update failed"
                    );
                }
                Ok(())
            }
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let tuning = &self.pipeline_config.tuning;
        let capped_attempt = attempt
            .saturating_sub(1)
            .min(tuning.retry_backoff_cap_exponent);
        let multiplier = 2_u64.pow(capped_attempt);
        let delay = tuning.retry_base_delay_secs.saturating_mul(multiplier);

        Duration::from_secs(delay.min(tuning.retry_max_delay_secs))
    }

    /// Requeues a failed document at the first stage whose output is missing.
    #[tracing::instrument(skip_all, fields(document_id = %document_id))]
    pub async fn retry_document(&self, document_id: &str) -> Result<Stage, AppError> {
        let document = Document::get(document_id, &self.db).await?;
        if document.state != DocumentState::Failed {
            return Err(AppError::Validation(format!(
                "document {document_id} is {}; only failed documents can be retried",
                document.state.as_str()
            )));
        }

        let job = stages::document_job(&document, self.storage.bucket());
        let (stage, resume_at) = if !self.storage.exists(&job.storage.extracted_key).await? {
            (Stage::Extract, DocumentState::Extracting)
        } else if !self.storage.exists(&job.storage.chunks_key).await? {
            (Stage::Chunk, DocumentState::Chunking)
        } else if !embeddings_published(&self.db, self.pipeline_config.index_path, &document)
            .await?
        {
            (Stage::Embed, DocumentState::Embedding)
        } else {
            (Stage::Summary, DocumentState::Summarizing)
        };

        if Document::reset_for_retry(document_id, resume_at, &self.db)
            .await?
            .is_none()
        {
            return Err(AppError::Validation(format!(
                "document {document_id} left the failed state during retry"
            )));
        }

        let payload = match stage {
            Stage::Chunk => JobPayload::Chunk(ChunkJob {
                document: job,
                extracted_pages: document.page_count,
            }),
            Stage::Embed => JobPayload::Embed(EmbedJob {
                document: job,
                chunk_count: document.chunk_count,
            }),
            Stage::Summary => JobPayload::Summary(SummaryJob {
                document: job,
                section_count: document.chunk_count,
            }),
            Stage::Extract | Stage::Manifest => JobPayload::Extract(job),
        };

        PipelineJob::enqueue(payload, &self.db).await?;
        if let Err(err) = self
            .progress
            .set_phase(
                &document.id,
                ProgressPhase::Queued,
                0.0,
                Some(format!("retrying from {}", stage.lock_name())),
            )
            .await
        {
            warn!(document_id, error = %err, "progress update failed");
        }

        info!(document_id, resumed_stage = stage.as_str(), "failed document requeued");
        Ok(stage)
    }
}
