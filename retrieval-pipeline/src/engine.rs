use std::sync::Arc;

use common::{
    artifact::{self, LoadedArtifact},
    error::AppError,
    storage::{
        db::SurrealDbClient,
        store::StorageManager,
        types::{
            document::{Document, DocumentState},
            index_artifact::IndexArtifact,
            text_chunk::TextChunk,
        },
    },
    utils::{
        config::{AppConfig, IndexPath},
        embedding::EmbeddingProvider,
    },
};
use tracing::{debug, info, instrument};

use crate::{
    cache::ArtifactCache,
    search::{clamp_top_k, search_artifact, search_chunk_rows, sort_passages, ScoredPassage},
};

/// Read-side settings.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub index_path: IndexPath,
    pub cache_entries: u64,
    pub cache_bytes: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 8,
            index_path: IndexPath::Artifact,
            cache_entries: 32,
            cache_bytes: 256 * 1024 * 1024,
        }
    }
}

impl RetrievalConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            top_k: clamp_top_k(config.retrieval_top_k),
            index_path: config.index_path,
            cache_entries: config.artifact_cache_entries,
            cache_bytes: config.artifact_cache_bytes,
        }
    }
}

/// Answers similarity queries against indexed documents.
pub struct RetrievalEngine {
    db: Arc<SurrealDbClient>,
    storage: StorageManager,
    embeddings: Arc<EmbeddingProvider>,
    cache: ArtifactCache,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        embeddings: Arc<EmbeddingProvider>,
        config: RetrievalConfig,
    ) -> Self {
        let cache = ArtifactCache::new(config.cache_entries, config.cache_bytes);
        Self {
            db,
            storage,
            embeddings,
            cache,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Top passages of one document for `question`.
    #[instrument(skip_all, fields(org_id = %org_id, document_id = %document_id))]
    pub async fn search_document(
        &self,
        org_id: &str,
        document_id: &str,
        question: &str,
        top_k: Option<usize>,
    ) -> Result<Vec<ScoredPassage>, AppError> {
        let document = Document::get(document_id, &self.db).await?;
        if document.org_id != org_id {
            return Err(AppError::NotFound(format!("document {document_id}")));
        }
        let top_k = clamp_top_k(top_k.unwrap_or(self.config.top_k));

        let passages = match self.config.index_path {
            IndexPath::Artifact => self.search_artifact_path(&document, question, top_k).await?,
            IndexPath::Incremental => self.search_rows_path(&document, question, top_k).await?,
        };
        debug!(hits = passages.len(), top_k, "document searched");
        Ok(passages)
    }

    /// Top passages across every ready document of a tender.
    #[instrument(skip_all, fields(org_id = %org_id, tender_id = %tender_id))]
    pub async fn search_tender(
        &self,
        org_id: &str,
        tender_id: &str,
        question: &str,
        top_k: Option<usize>,
    ) -> Result<Vec<ScoredPassage>, AppError> {
        let top_k = clamp_top_k(top_k.unwrap_or(self.config.top_k));
        let documents = Document::list_by_tender(org_id, tender_id, &self.db).await?;
        let ready: Vec<Document> = documents
            .into_iter()
            .filter(|document| document.state == DocumentState::Ready)
            .collect();
        if ready.is_empty() {
            return Err(AppError::IndexNotReady(format!("tender {tender_id}")));
        }

        let mut passages = Vec::new();
        for document in &ready {
            let hits = match self.config.index_path {
                IndexPath::Artifact => self.search_artifact_path(document, question, top_k).await,
                IndexPath::Incremental => self.search_rows_path(document, question, top_k).await,
            };
            passages.extend(hits?);
        }
        sort_passages(&mut passages);
        passages.truncate(top_k);

        info!(documents = ready.len(), hits = passages.len(), "tender searched");
        Ok(passages)
    }

    async fn search_artifact_path(
        &self,
        document: &Document,
        question: &str,
        top_k: usize,
    ) -> Result<Vec<ScoredPassage>, AppError> {
        let Some(record) = IndexArtifact::latest_ready(&document.id, &self.db).await? else {
            return Err(not_indexed(document));
        };
        let loaded = self.load_artifact(&record).await?;
        let query = self
            .embeddings
            .for_model(loaded.model())
            .embed(question)
            .await?;
        search_artifact(&loaded, &query, top_k)
    }

    async fn search_rows_path(
        &self,
        document: &Document,
        question: &str,
        top_k: usize,
    ) -> Result<Vec<ScoredPassage>, AppError> {
        let Some(model) = document.embedding_model.as_deref() else {
            return Err(not_indexed(document));
        };
        let rows = TextChunk::list_for_document(&document.id, &self.db).await?;
        let query = self.embeddings.for_model(model).embed(question).await?;
        Ok(search_chunk_rows(&rows, &document.title, &query, top_k))
    }

    /// Returns the decoded artifact, loading and verifying it on a cache miss.
    pub async fn load_artifact(
        &self,
        record: &IndexArtifact,
    ) -> Result<Arc<LoadedArtifact>, AppError> {
        if let Some(hit) = self.cache.get(&record.storage_key) {
            return Ok(hit);
        }

        let bytes = self.storage.get(&record.storage_key).await?;
        let loaded = tokio::task::spawn_blocking(move || artifact::load(&bytes)).await??;
        if record
            .checksum
            .as_deref()
            .is_some_and(|checksum| checksum != loaded.manifest.checksum)
        {
            return Err(AppError::Consistency(format!(
                "artifact v{} of {} does not match its recorded checksum",
                record.version, record.doc_hash
            )));
        }

        let loaded = Arc::new(loaded);
        self.cache.insert(&record.storage_key, Arc::clone(&loaded));
        debug!(
            artifact_key = %record.storage_key,
            bytes = loaded.byte_size(),
            "artifact loaded into cache"
        );
        Ok(loaded)
    }
}

fn not_indexed(document: &Document) -> AppError {
    if document.state == DocumentState::Failed {
        AppError::IndexFailed(document.id.clone())
    } else {
        AppError::IndexNotReady(document.id.clone())
    }
}
