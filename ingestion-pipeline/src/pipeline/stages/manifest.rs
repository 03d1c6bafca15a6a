use bytes::Bytes;
use common::{
    artifact::codec::sha256_hex,
    error::AppError,
    storage::{
        keys,
        progress::ProgressPhase,
        types::{
            document::{Document, DocumentState},
            job_payload::{JobPayload, ManifestJob},
            pipeline_job::PipelineJob,
            tender::Tender,
            upload::Upload,
        },
    },
};
use tracing::{debug, info, instrument};

use super::{super::context::StageContext, document_job};
use crate::utils::archive::{discover_files, DiscoveredFile};

/// Expands an upload into documents and queues extraction for every new one.
#[instrument(
    skip_all,
    fields(job_id = %ctx.job_id, upload_id = %job.upload_id, tender_id = %job.tender_id)
)]
pub async fn discover(
    ctx: &StageContext<'_>,
    job: &ManifestJob,
) -> Result<Vec<JobPayload>, AppError> {
    let bytes = ctx.storage.get(&job.storage_key).await?;
    let file_name = job.filename.clone();
    let max_entries = ctx.config.tuning.max_archive_entries;
    let contents = tokio::task::spawn_blocking(move || {
        discover_files(&file_name, bytes.to_vec(), max_entries)
    })
    .await??;

    Tender::get_or_create(&job.tender_id, &job.org_id, ctx.db).await?;

    let discovered = u32::try_from(contents.files.len()).unwrap_or(u32::MAX);
    let mut successors = Vec::with_capacity(contents.files.len());
    for file in contents.files {
        if let Some(payload) = register_document(ctx, job, file).await? {
            successors.push(payload);
        }
    }

    Upload::mark_completed(&job.upload_id, discovered, contents.truncated, ctx.db).await?;
    Tender::refresh_readiness(
        &job.tender_id,
        &job.org_id,
        ctx.config.tuning.partial_ready_ratio,
        ctx.db,
    )
    .await?;

    info!(
        discovered,
        queued = successors.len(),
        truncated = contents.truncated,
        "upload manifest processed"
    );
    Ok(successors)
}

/// Stores one discovered file under its content hash. Returns the extraction job to queue, or
/// `None` when the same bytes are already known to the tender.
async fn register_document(
    ctx: &StageContext<'_>,
    job: &ManifestJob,
    file: DiscoveredFile,
) -> Result<Option<JobPayload>, AppError> {
    let doc_hash = sha256_hex(&file.bytes);
    let raw_key = keys::raw_key(&job.org_id, &job.tender_id, &doc_hash, &file.name);
    let byte_size = file.bytes.len() as u64;

    if !ctx.storage.exists(&raw_key).await? {
        ctx.storage.put(&raw_key, Bytes::from(file.bytes)).await?;
    }

    let candidate = Document::new(
        job.org_id.clone(),
        job.tender_id.clone(),
        doc_hash.clone(),
        file.name,
        byte_size,
        file.mime_type,
        raw_key,
        job.upload_id.clone(),
    );
    let (document, created) = Document::create_or_get(candidate, ctx.db).await?;

    if !created {
        // a replayed manifest may have stored the document without queueing its extraction
        let orphaned = document.state == DocumentState::Pending
            && document.upload_id == job.upload_id
            && PipelineJob::active_for_document(&document.id, ctx.db)
                .await?
                .is_empty();
        if !orphaned {
            debug!(doc_hash = %doc_hash, document_id = %document.id, "duplicate document skipped");
            return Ok(None);
        }
    }

    ctx.report(&document.id, ProgressPhase::Queued, 0.0, "queued for extraction")
        .await;

    Ok(Some(JobPayload::Extract(document_job(
        &document,
        ctx.storage.bucket(),
    ))))
}
