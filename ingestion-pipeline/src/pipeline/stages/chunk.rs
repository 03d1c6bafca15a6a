use bytes::Bytes;
use common::{
    artifact::{
        codec::{gunzip_json, gunzip_jsonl, gzip_jsonl},
        ChunkRecord,
    },
    error::AppError,
    storage::{
        progress::ProgressPhase,
        types::{
            document::{Document, DocumentState},
            job_payload::{ChunkJob, EmbedJob, JobPayload},
        },
    },
};
use tracing::{debug, info, instrument};

use super::super::context::StageContext;
use crate::utils::{chunking::chunk_pages, text_extraction::ExtractedPage};

#[instrument(
    skip_all,
    fields(job_id = %ctx.job_id, doc_hash = %job.document.doc_hash, pages = job.extracted_pages)
)]
pub async fn chunk(ctx: &StageContext<'_>, job: &ChunkJob) -> Result<Vec<JobPayload>, AppError> {
    let target = &job.document;

    if let Some(existing) = ctx.storage.get_opt(&target.storage.chunks_key).await? {
        let records: Vec<ChunkRecord> = gunzip_jsonl(&existing)?;
        debug!(chunks = records.len(), "chunk stream already stored");
        return Ok(vec![successor(job, records.len())]);
    }

    let document = ctx.document(target).await?;
    Document::advance_state(&document.id, DocumentState::Chunking, ctx.db).await?;
    ctx.report(&target.document_id, ProgressPhase::Chunking, 25.0, "splitting text")
        .await;

    let pages: Vec<ExtractedPage> =
        gunzip_json(&ctx.storage.get(&target.storage.extracted_key).await?)?;

    let tuning = &ctx.config.tuning;
    let records = build_records(&document.id, &pages, tuning.chunk_size, tuning.chunk_overlap);

    ctx.storage
        .put(&target.storage.chunks_key, Bytes::from(gzip_jsonl(&records)?))
        .await?;
    let chunk_count = u32::try_from(records.len()).unwrap_or(u32::MAX);
    Document::record_chunking(&document.id, chunk_count, ctx.db).await?;

    info!(chunk_count, "document chunked");
    Ok(vec![successor(job, records.len())])
}

/// Chunk records for a document, numbered in page order.
pub fn build_records(
    document_id: &str,
    pages: &[ExtractedPage],
    size: usize,
    overlap: usize,
) -> Vec<ChunkRecord> {
    chunk_pages(pages, size, overlap)
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| {
            let chunk_index = u32::try_from(index).unwrap_or(u32::MAX);
            ChunkRecord {
                id: format!("{document_id}:{chunk_index}"),
                file_id: document_id.to_string(),
                chunk_index,
                page_start: chunk.page,
                page_end: chunk.page,
                heading: chunk.heading,
                token_estimate: ChunkRecord::estimate_tokens(&chunk.text),
                text: chunk.text,
            }
        })
        .collect()
}

fn successor(job: &ChunkJob, chunk_count: usize) -> JobPayload {
    JobPayload::Embed(EmbedJob {
        document: job.document.clone(),
        chunk_count: u32::try_from(chunk_count).unwrap_or(u32::MAX),
    })
}
