#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod pipeline;
pub mod utils;

use chrono::Utc;
use common::storage::{
    db::SurrealDbClient,
    types::{
        job_payload::Stage,
        pipeline_job::{PipelineJob, DEFAULT_LEASE_SECS},
    },
};
pub use pipeline::{
    DefaultPipelineServices, IngestionConfig, IngestionPipeline, IngestionTuning,
    PipelineServices,
};
use std::sync::Arc;
use tokio::{
    task::JoinHandle,
    time::{sleep, Duration},
};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Claims and processes jobs of one stage until the task is dropped.
pub async fn run_worker_loop(
    db: Arc<SurrealDbClient>,
    ingestion_pipeline: Arc<IngestionPipeline>,
    stage: Stage,
) {
    let worker_id = format!("{}-worker-{}", stage.lock_name(), Uuid::new_v4());
    let lease_duration = Duration::from_secs(u64::try_from(DEFAULT_LEASE_SECS).unwrap_or(300));
    let idle_backoff = Duration::from_millis(500);

    loop {
        match PipelineJob::claim_next_ready(&db, stage, &worker_id, Utc::now(), lease_duration)
            .await
        {
            Ok(Some(job)) => {
                let job_id = job.id.clone();
                info!(
                    %worker_id,
                    %job_id,
                    stage = stage.as_str(),
                    attempt = job.attempts,
                    "claimed pipeline job"
                );
                if let Err(err) = ingestion_pipeline.process_job(job).await {
                    error!(%worker_id, %job_id, error = %err, "pipeline job failed");
                }
            }
            Ok(None) => {
                sleep(idle_backoff).await;
            }
            Err(err) => {
                error!(%worker_id, error = %err, "failed to claim pipeline job");
                warn!("Backing off for 1s after claim error");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Starts the configured number of workers for every stage.
pub fn spawn_worker_pools(
    db: &Arc<SurrealDbClient>,
    ingestion_pipeline: &Arc<IngestionPipeline>,
) -> Vec<JoinHandle<()>> {
    let tuning = &ingestion_pipeline.config().tuning;
    let mut handles = Vec::new();

    for stage in Stage::ALL {
        let workers = tuning.workers_for(stage);
        info!(stage = stage.as_str(), workers, "starting stage worker pool");
        for _ in 0..workers {
            handles.push(tokio::spawn(run_worker_loop(
                Arc::clone(db),
                Arc::clone(ingestion_pipeline),
                stage,
            )));
        }
    }

    handles
}
