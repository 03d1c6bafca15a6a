//! Fixtures shared by the engine, answer and brief tests.

use std::sync::Arc;

use bytes::Bytes;
use common::{
    artifact::{self, ArtifactInput, ChunkRecord, NameEntry, NamesMap},
    storage::{
        db::SurrealDbClient,
        keys,
        store::{testing::memory_storage, StorageManager},
        types::{
            document::{Document, DocumentState},
            index_artifact::IndexArtifact,
            text_chunk::TextChunk,
        },
    },
    utils::{
        config::IndexPath,
        embedding::{hashed_embedding, EmbeddingProvider, FALLBACK_DIMENSION, FALLBACK_MODEL},
    },
};
use uuid::Uuid;

use crate::engine::{RetrievalConfig, RetrievalEngine};

pub struct Fixture {
    pub db: Arc<SurrealDbClient>,
    pub storage: StorageManager,
    pub engine: RetrievalEngine,
}

pub async fn fixture(index_path: IndexPath) -> Fixture {
    let db = Arc::new(
        SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb"),
    );
    db.ensure_initialized().await.expect("schema");
    let storage = memory_storage();
    let engine = RetrievalEngine::new(
        Arc::clone(&db),
        storage.clone(),
        Arc::new(EmbeddingProvider::fallback()),
        RetrievalConfig {
            index_path,
            ..RetrievalConfig::default()
        },
    );
    Fixture {
        db,
        storage,
        engine,
    }
}

/// Stores a ready document whose pages are `pages`, one chunk per page.
pub async fn indexed_document(
    fixture: &Fixture,
    tender_id: &str,
    title: &str,
    pages: &[&str],
) -> Document {
    let doc_hash = Uuid::new_v4().simple().to_string();
    let mut document = Document::new(
        "org-1".into(),
        tender_id.into(),
        doc_hash.clone(),
        title.into(),
        10,
        "text/plain".into(),
        keys::raw_key("org-1", tender_id, &doc_hash, title),
        "upload-1".into(),
    );
    document.state = DocumentState::Ready;
    document.page_count = u32::try_from(pages.len()).expect("pages");
    document.chunk_count = document.page_count;
    document.embedding_model = Some(FALLBACK_MODEL.into());
    fixture
        .db
        .store_item(document.clone())
        .await
        .expect("store document");

    let chunks: Vec<ChunkRecord> = pages
        .iter()
        .enumerate()
        .map(|(i, text)| {
            let index = u32::try_from(i).expect("index");
            ChunkRecord {
                id: format!("{}:{index}", document.id),
                file_id: document.id.clone(),
                chunk_index: index,
                page_start: index + 1,
                page_end: index + 1,
                heading: None,
                text: (*text).to_string(),
                token_estimate: 2,
            }
        })
        .collect();
    let embeddings: Vec<Vec<f32>> = pages
        .iter()
        .map(|text| hashed_embedding(text, FALLBACK_DIMENSION))
        .collect();

    let rows = chunks
        .iter()
        .zip(&embeddings)
        .map(|(chunk, vector)| {
            TextChunk::new(
                document.id.clone(),
                "org-1".into(),
                tender_id.into(),
                chunk.chunk_index,
                chunk.page_start,
                chunk.page_end,
                None,
                chunk.text.clone(),
                vector.clone(),
            )
        })
        .collect();
    TextChunk::replace_for_document(&document.id, rows, &fixture.db)
        .await
        .expect("rows");

    let mut names = NamesMap::new();
    names.insert(
        document.id.clone(),
        NameEntry {
            path: document.raw_key.clone(),
            name: title.into(),
            page_count: document.page_count,
        },
    );
    let input = ArtifactInput {
        doc_hash: doc_hash.clone(),
        chunks,
        embeddings,
        pages: document.page_count,
        chunk_size: 20,
        chunk_overlap: 5,
        model: FALLBACK_MODEL.into(),
        dimension: u32::try_from(FALLBACK_DIMENSION).expect("dimension"),
        names,
    };
    let (bytes, manifest) = artifact::build(&input).expect("build");
    let building = IndexArtifact::begin_build(
        "org-1",
        tender_id,
        &document.id,
        &doc_hash,
        |version| keys::artifact_key("org-1", tender_id, &doc_hash, version),
        &fixture.db,
    )
    .await
    .expect("begin build");
    fixture
        .storage
        .put(&building.storage_key, Bytes::from(bytes))
        .await
        .expect("upload artifact");
    building
        .mark_ready(
            &manifest.checksum,
            manifest.stats.total_chunks,
            manifest.params.embedding_dimension,
            &manifest.params.embedding_model,
            &fixture.db,
        )
        .await
        .expect("ready");

    document
}
