use bytes::Bytes;
use common::{
    artifact::codec::gunzip_json,
    error::AppError,
    storage::{
        progress::ProgressPhase,
        types::{
            document::{Document, DocumentState},
            job_payload::{JobPayload, SummaryJob},
            tender::Tender,
        },
    },
};
use tracing::{debug, info, instrument};

use super::super::context::StageContext;
use crate::utils::text_extraction::ExtractedPage;

/// Summarises the document and marks it ready. Last stage: nothing is queued after it.
#[instrument(
    skip_all,
    fields(job_id = %ctx.job_id, doc_hash = %job.document.doc_hash, sections = job.section_count)
)]
pub async fn summarize(
    ctx: &StageContext<'_>,
    job: &SummaryJob,
) -> Result<Vec<JobPayload>, AppError> {
    let target = &job.document;
    let document = ctx.document(target).await?;
    if document.state == DocumentState::Ready {
        debug!("document already ready");
        return Ok(Vec::new());
    }

    Document::advance_state(&document.id, DocumentState::Summarizing, ctx.db).await?;
    ctx.report(&target.document_id, ProgressPhase::Summarizing, 90.0, "writing summary")
        .await;

    let summary = match ctx.storage.get_opt(&target.storage.summary_key).await? {
        Some(stored) => String::from_utf8_lossy(&stored).into_owned(),
        None => {
            let pages: Vec<ExtractedPage> =
                gunzip_json(&ctx.storage.get(&target.storage.extracted_key).await?)?;
            let text = pages
                .iter()
                .map(|page| page.text.as_str())
                .filter(|text| !text.is_empty())
                .collect::<Vec<_>>()
                .join("\n");

            let summary = ctx.services.summarize(&document.title, &text).await?;
            ctx.storage
                .put(&target.storage.summary_key, Bytes::from(summary.clone()))
                .await?;
            summary
        }
    };

    Document::record_summary(&document.id, &summary, ctx.db).await?;
    Document::advance_state(&document.id, DocumentState::Ready, ctx.db).await?;
    ctx.report(&target.document_id, ProgressPhase::Complete, 100.0, "ready")
        .await;

    let tender = Tender::refresh_readiness(
        &target.tender_id,
        &target.org_id,
        ctx.config.tuning.partial_ready_ratio,
        ctx.db,
    )
    .await?;

    info!(
        documents_ready = tender.documents_ready,
        documents_total = tender.documents_total,
        partially_ready = tender.partially_ready,
        "document ready"
    );
    Ok(Vec::new())
}
