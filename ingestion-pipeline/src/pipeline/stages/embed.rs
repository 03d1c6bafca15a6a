use bytes::Bytes;
use chrono::Utc;
use common::{
    artifact::{
        self,
        codec::{decode_f32, encode_f32, gunzip_jsonl},
        ArtifactInput, ChunkRecord, NameEntry, NamesMap,
    },
    error::AppError,
    storage::{
        db::SurrealDbClient,
        keys,
        progress::{BatchProgress, ProgressPhase},
        types::{
            document::{Document, DocumentState},
            index_artifact::IndexArtifact,
            job_payload::{EmbedJob, JobPayload, SummaryJob},
            text_chunk::TextChunk,
        },
    },
    utils::{
        config::IndexPath,
        embedding::{
            hashed_embedding, is_transient_provider_error, FALLBACK_DIMENSION, FALLBACK_MODEL,
        },
    },
};
use tracing::{debug, info, instrument, warn};

use super::super::context::StageContext;

/// Vectors for every chunk of a document, in chunk order.
#[derive(Debug, Clone)]
pub struct EmbeddedChunks {
    pub vectors: Vec<Vec<f32>>,
    pub model: String,
    pub dimension: u32,
}

impl EmbeddedChunks {
    fn fallback(texts: &[String]) -> Self {
        Self {
            vectors: texts
                .iter()
                .map(|text| hashed_embedding(text, FALLBACK_DIMENSION))
                .collect(),
            model: FALLBACK_MODEL.to_string(),
            dimension: u32::try_from(FALLBACK_DIMENSION).unwrap_or(u32::MAX),
        }
    }
}

#[instrument(
    skip_all,
    fields(job_id = %ctx.job_id, doc_hash = %job.document.doc_hash, chunks = job.chunk_count)
)]
pub async fn embed(ctx: &StageContext<'_>, job: &EmbedJob) -> Result<Vec<JobPayload>, AppError> {
    let target = &job.document;
    let document = ctx.document(target).await?;

    if embeddings_published(ctx.db, ctx.config.index_path, &document).await? {
        debug!("embeddings already published");
        return Ok(vec![successor(job, document.chunk_count)]);
    }

    Document::advance_state(&document.id, DocumentState::Embedding, ctx.db).await?;

    let records: Vec<ChunkRecord> =
        gunzip_jsonl(&ctx.storage.get(&target.storage.chunks_key).await?)?;
    let partial_key =
        keys::partial_embeddings_key(&target.org_id, &target.tender_id, &target.doc_hash);

    let embedded = embed_records(ctx, &target.document_id, &partial_key, &records).await?;
    let chunk_count = u32::try_from(records.len()).unwrap_or(u32::MAX);

    let version = match ctx.config.index_path {
        IndexPath::Artifact => Some(package(ctx, &document, records, &embedded).await?),
        IndexPath::Incremental => {
            persist_rows(ctx, &document, records, &embedded).await?;
            None
        }
    };

    Document::record_embedding(
        &document.id,
        &embedded.model,
        embedded.dimension,
        version,
        ctx.db,
    )
    .await?;
    ctx.storage.delete(&partial_key).await?;

    info!(
        chunk_count,
        model = %embedded.model,
        dimension = embedded.dimension,
        artifact_version = version,
        "document embedded"
    );
    Ok(vec![successor(job, chunk_count)])
}

/// Whether the embedding output for `document` is already durable on the configured path.
pub async fn embeddings_published(
    db: &SurrealDbClient,
    index_path: IndexPath,
    document: &Document,
) -> Result<bool, AppError> {
    match index_path {
        IndexPath::Artifact => Ok(IndexArtifact::latest_ready(&document.id, db)
            .await?
            .is_some()),
        IndexPath::Incremental => {
            if document.embedding_model.is_none() {
                return Ok(false);
            }
            let rows = TextChunk::count_for_document(&document.id, db).await?;
            Ok(rows == document.chunk_count as usize)
        }
    }
}

/// Embeds chunk texts batch by batch, persisting the partial buffer after each batch so a
/// re-claimed job continues where the last one stopped.
async fn embed_records(
    ctx: &StageContext<'_>,
    document_id: &str,
    partial_key: &str,
    records: &[ChunkRecord],
) -> Result<EmbeddedChunks, AppError> {
    let texts: Vec<String> = records.iter().map(|r| r.text.clone()).collect();
    let batch_size = ctx.config.tuning.embedding_batch_size.max(1);
    let batches_total = u32::try_from(texts.chunks(batch_size).count()).unwrap_or(u32::MAX);
    let model = ctx.services.embedding_model();
    let dimension = ctx.services.embedding_dimension();
    let dimension_u32 = u32::try_from(dimension).unwrap_or(u32::MAX);

    let (mut vectors, start_batch) = resume_state(
        ctx,
        document_id,
        partial_key,
        &model,
        dimension,
        batch_size,
        texts.len(),
    )
    .await?;
    let batches_at_start = u32::try_from(start_batch).unwrap_or(u32::MAX);
    let started_at = Utc::now();

    for (batch_index, batch) in texts.chunks(batch_size).enumerate().skip(start_batch) {
        let batch_vectors = match ctx.services.embed_batch(batch.to_vec()).await {
            Ok(batch_vectors) => batch_vectors,
            Err(err) if is_transient_provider_error(&err) => {
                warn!(
                    document_id,
                    batch = batch_index,
                    error = %err,
                    "embedding provider unreachable; using hashed embedding for the document"
                );
                return Ok(EmbeddedChunks::fallback(&texts));
            }
            Err(err) => {
                return Err(AppError::Processing(format!(
                    "embedding batch {batch_index} failed: {err}"
                )))
            }
        };

        if batch_vectors.len() != batch.len()
            || batch_vectors.iter().any(|vector| vector.len() != dimension)
        {
            return Err(AppError::Processing(format!(
                "embedding batch {batch_index} returned {} vectors of unexpected shape",
                batch_vectors.len()
            )));
        }
        vectors.extend(batch_vectors);

        let flat: Vec<f32> = vectors.iter().flatten().copied().collect();
        ctx.storage
            .put(partial_key, Bytes::from(encode_f32(&flat)))
            .await?;

        let progress = BatchProgress {
            batches_done: u32::try_from(batch_index.saturating_add(1)).unwrap_or(u32::MAX),
            batches_total,
            vectors_done: u32::try_from(vectors.len()).unwrap_or(u32::MAX),
            dimension: dimension_u32,
            model: model.clone(),
            batches_at_start,
            started_at,
        };
        if let Err(err) = ctx.progress.record_batch(document_id, &progress).await {
            warn!(document_id, error = %err, "failed to record embedding progress");
        }
    }

    Ok(EmbeddedChunks {
        vectors,
        model,
        dimension: dimension_u32,
    })
}

/// Vectors and next batch index from an interrupted run, or an empty start when nothing
/// usable was left behind.
async fn resume_state(
    ctx: &StageContext<'_>,
    document_id: &str,
    partial_key: &str,
    model: &str,
    dimension: usize,
    batch_size: usize,
    total: usize,
) -> Result<(Vec<Vec<f32>>, usize), AppError> {
    let Some(resume) = ctx.progress.resume_point(document_id).await? else {
        return Ok((Vec::new(), 0));
    };
    if resume.model != model || resume.dimension as usize != dimension || dimension == 0 {
        return Ok((Vec::new(), 0));
    }
    let Some(partial) = ctx.storage.get_opt(partial_key).await? else {
        return Ok((Vec::new(), 0));
    };

    let flat = decode_f32(&partial)?;
    let done = resume.vectors_done as usize;
    let batches_done = resume.batches_done as usize;
    let expected = batches_done.saturating_mul(batch_size).min(total);
    if done != expected || flat.len() != done.saturating_mul(dimension) {
        warn!(document_id, "partial embeddings do not match recorded progress; starting over");
        return Ok((Vec::new(), 0));
    }

    debug!(document_id, batches_done, vectors = done, "resuming embedding run");
    let vectors = flat.chunks_exact(dimension).map(<[f32]>::to_vec).collect();
    Ok((vectors, batches_done))
}

async fn package(
    ctx: &StageContext<'_>,
    document: &Document,
    records: Vec<ChunkRecord>,
    embedded: &EmbeddedChunks,
) -> Result<u32, AppError> {
    ctx.report(&document.id, ProgressPhase::Packaging, 85.0, "packaging index")
        .await;

    let building = IndexArtifact::begin_build(
        &document.org_id,
        &document.tender_id,
        &document.id,
        &document.doc_hash,
        |version| {
            keys::artifact_key(&document.org_id, &document.tender_id, &document.doc_hash, version)
        },
        ctx.db,
    )
    .await?;

    let mut names = NamesMap::new();
    names.insert(
        document.id.clone(),
        NameEntry {
            path: document.raw_key.clone(),
            name: document.title.clone(),
            page_count: document.page_count,
        },
    );
    let tuning = &ctx.config.tuning;
    let input = ArtifactInput {
        doc_hash: document.doc_hash.clone(),
        chunks: records,
        embeddings: embedded.vectors.clone(),
        pages: document.page_count,
        chunk_size: u32::try_from(tuning.chunk_size).unwrap_or(u32::MAX),
        chunk_overlap: u32::try_from(tuning.chunk_overlap).unwrap_or(u32::MAX),
        model: embedded.model.clone(),
        dimension: embedded.dimension,
        names,
    };

    match publish(ctx, &building, input).await {
        Ok(ready) => Ok(ready.version),
        Err(err) => {
            if let Err(mark_err) = building.mark_failed(ctx.db).await {
                warn!(
                    artifact_id = %building.id,
                    error = %mark_err,
                    "could not mark artifact failed"
                );
            }
            Err(err)
        }
    }
}

/// Builds, self-verifies and uploads the artifact, then flips its record to `Ready`.
async fn publish(
    ctx: &StageContext<'_>,
    building: &IndexArtifact,
    input: ArtifactInput,
) -> Result<IndexArtifact, AppError> {
    let (bytes, manifest) = tokio::task::spawn_blocking(move || {
        let (bytes, manifest) = artifact::build(&input)?;
        artifact::load(&bytes)?;
        Ok::<_, AppError>((bytes, manifest))
    })
    .await??;

    let size = bytes.len();
    ctx.storage
        .put(&building.storage_key, Bytes::from(bytes))
        .await?;

    let ready = building
        .mark_ready(
            &manifest.checksum,
            manifest.stats.total_chunks,
            manifest.params.embedding_dimension,
            &manifest.params.embedding_model,
            ctx.db,
        )
        .await?;

    info!(
        version = ready.version,
        bytes = size,
        checksum = %manifest.checksum,
        "index artifact published"
    );
    Ok(ready)
}

async fn persist_rows(
    ctx: &StageContext<'_>,
    document: &Document,
    records: Vec<ChunkRecord>,
    embedded: &EmbeddedChunks,
) -> Result<(), AppError> {
    let rows: Vec<TextChunk> = records
        .into_iter()
        .zip(embedded.vectors.iter())
        .map(|(record, vector)| {
            TextChunk::new(
                document.id.clone(),
                document.org_id.clone(),
                document.tender_id.clone(),
                record.chunk_index,
                record.page_start,
                record.page_end,
                record.heading,
                record.text,
                vector.clone(),
            )
        })
        .collect();

    TextChunk::replace_for_document(&document.id, rows, ctx.db).await?;
    Ok(())
}

fn successor(job: &EmbedJob, section_count: u32) -> JobPayload {
    JobPayload::Summary(SummaryJob {
        document: job.document.clone(),
        section_count,
    })
}
