use bytes::Bytes;
use common::{
    artifact::codec::{gunzip_json, gzip_json, sha256_hex},
    error::AppError,
    storage::{
        progress::ProgressPhase,
        types::{
            document::{Document, DocumentState},
            job_payload::{ChunkJob, DocumentJob, JobPayload},
        },
    },
};
use tracing::{debug, info, instrument};

use super::super::context::StageContext;
use crate::utils::text_extraction::ExtractedPage;

#[instrument(skip_all, fields(job_id = %ctx.job_id, doc_hash = %job.doc_hash))]
pub async fn extract(
    ctx: &StageContext<'_>,
    job: &DocumentJob,
) -> Result<Vec<JobPayload>, AppError> {
    if let Some(existing) = ctx.storage.get_opt(&job.storage.extracted_key).await? {
        let pages: Vec<ExtractedPage> = gunzip_json(&existing)?;
        debug!(pages = pages.len(), "extracted pages already stored");
        return Ok(vec![successor(job, &pages)]);
    }

    let document = ctx.document(job).await?;
    Document::advance_state(&document.id, DocumentState::Extracting, ctx.db).await?;
    ctx.report(&job.document_id, ProgressPhase::Extracting, 5.0, "extracting text")
        .await;

    let raw = ctx.storage.get(&job.storage.raw_key).await?;
    let recomputed = sha256_hex(&raw);
    if recomputed != job.doc_hash {
        return Err(AppError::Consistency(format!(
            "raw bytes of {} hash to {recomputed}, expected {}",
            job.filename, job.doc_hash
        )));
    }

    let pages = ctx
        .services
        .extract_pages(raw.to_vec(), &document.mime_type, &document.title)
        .await?;

    let has_text = pages.iter().any(|page| !page.text.is_empty());
    let page_count = u32::try_from(pages.len()).unwrap_or(u32::MAX);

    ctx.storage
        .put(&job.storage.extracted_key, Bytes::from(gzip_json(&pages)?))
        .await?;
    Document::record_extraction(&document.id, page_count, has_text, ctx.db).await?;
    ctx.report(&job.document_id, ProgressPhase::Extracting, 20.0, "text extracted")
        .await;

    info!(page_count, has_text, "document text extracted");
    Ok(vec![successor(job, &pages)])
}

fn successor(job: &DocumentJob, pages: &[ExtractedPage]) -> JobPayload {
    JobPayload::Chunk(ChunkJob {
        document: job.clone(),
        extracted_pages: u32::try_from(pages.len()).unwrap_or(u32::MAX),
    })
}
