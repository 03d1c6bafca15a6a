use surrealdb::{opt::PatchOp, sql::Datetime as SurrealDatetime};
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::{truncate_error_message, AppError},
    storage::db::SurrealDbClient,
    stored_object,
};

/// Longest error message persisted on a document.
pub const MAX_ERROR_CHARS: usize = 500;

#[derive(Debug, Default, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq, Hash)]
pub enum DocumentState {
    #[default]
    Pending,
    Extracting,
    Chunking,
    Embedding,
    Summarizing,
    Ready,
    Failed,
}

impl DocumentState {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentState::Pending => "Pending",
            DocumentState::Extracting => "Extracting",
            DocumentState::Chunking => "Chunking",
            DocumentState::Embedding => "Embedding",
            DocumentState::Summarizing => "Summarizing",
            DocumentState::Ready => "Ready",
            DocumentState::Failed => "Failed",
        }
    }

    /// Position in the forward pipeline order. `Failed` sits outside it.
    pub fn rank(self) -> Option<u8> {
        match self {
            DocumentState::Pending => Some(0),
            DocumentState::Extracting => Some(1),
            DocumentState::Chunking => Some(2),
            DocumentState::Embedding => Some(3),
            DocumentState::Summarizing => Some(4),
            DocumentState::Ready => Some(5),
            DocumentState::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DocumentState::Ready | DocumentState::Failed)
    }

    /// States a document may move forward from when entering `target`.
    fn predecessors_of(target: DocumentState) -> Vec<&'static str> {
        let Some(target_rank) = target.rank() else {
            return Vec::new();
        };
        [
            DocumentState::Pending,
            DocumentState::Extracting,
            DocumentState::Chunking,
            DocumentState::Embedding,
            DocumentState::Summarizing,
        ]
        .into_iter()
        .filter(|state| state.rank().is_some_and(|rank| rank <= target_rank))
        .map(DocumentState::as_str)
        .collect()
    }
}

stored_object!(Document, "document", {
    org_id: String,
    tender_id: String,
    doc_hash: String,
    title: String,
    byte_size: u64,
    mime_type: String,
    raw_key: String,
    upload_id: String,
    state: DocumentState,
    #[serde(default)]
    page_count: u32,
    #[serde(default)]
    has_text: bool,
    #[serde(default)]
    chunk_count: u32,
    #[serde(default)]
    last_error: Option<String>,
    #[serde(default)]
    embedding_model: Option<String>,
    #[serde(default)]
    embedding_dimension: Option<u32>,
    #[serde(default)]
    artifact_version: Option<u32>,
    #[serde(default)]
    summary: Option<String>
});

impl Document {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        org_id: String,
        tender_id: String,
        doc_hash: String,
        title: String,
        byte_size: u64,
        mime_type: String,
        raw_key: String,
        upload_id: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            org_id,
            tender_id,
            doc_hash,
            title,
            byte_size,
            mime_type,
            raw_key,
            upload_id,
            state: DocumentState::Pending,
            page_count: 0,
            has_text: false,
            chunk_count: 0,
            last_error: None,
            embedding_model: None,
            embedding_dimension: None,
            artifact_version: None,
            summary: None,
        }
    }

    pub async fn find_by_hash(
        org_id: &str,
        tender_id: &str,
        doc_hash: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Document>, AppError> {
        let mut result = db
            .client
            .query(
                "SELECT * FROM type::table($table)
                 WHERE org_id = $org_id AND tender_id = $tender_id AND doc_hash = $doc_hash
                 LIMIT 1",
            )
            .bind(("table", Self::table_name()))
            .bind(("org_id", org_id.to_string()))
            .bind(("tender_id", tender_id.to_string()))
            .bind(("doc_hash", doc_hash.to_string()))
            .await?;

        let document: Option<Document> = result.take(0)?;
        Ok(document)
    }

    /// Stores `document` unless one with the same hash already exists in the tender.
    ///
    /// Returns the persisted document and whether it was newly created.
    pub async fn create_or_get(
        document: Document,
        db: &SurrealDbClient,
    ) -> Result<(Document, bool), AppError> {
        if let Some(existing) =
            Self::find_by_hash(&document.org_id, &document.tender_id, &document.doc_hash, db)
                .await?
        {
            return Ok((existing, false));
        }

        match db.store_item(document.clone()).await {
            Ok(stored) => Ok((stored.unwrap_or(document), true)),
            Err(err) if err.to_string().contains("already contains") => {
                debug!(doc_hash = %document.doc_hash, "lost dedup race; reusing existing document");
                let existing = Self::find_by_hash(
                    &document.org_id,
                    &document.tender_id,
                    &document.doc_hash,
                    db,
                )
                .await?
                .ok_or_else(|| AppError::NotFound(document.doc_hash.clone()))?;
                Ok((existing, false))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get(id: &str, db: &SurrealDbClient) -> Result<Document, AppError> {
        db.get_item::<Document>(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("document {id}")))
    }

    pub async fn list_by_tender(
        org_id: &str,
        tender_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Document>, AppError> {
        let documents: Vec<Document> = db
            .client
            .query(
                "SELECT * FROM type::table($table)
                 WHERE org_id = $org_id AND tender_id = $tender_id
                 ORDER BY created_at ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("org_id", org_id.to_string()))
            .bind(("tender_id", tender_id.to_string()))
            .await?
            .take(0)?;
        Ok(documents)
    }

    /// Moves the document forward to `target`.
    ///
    /// Returns `None` when the document is failed, ready, or already past `target`.
    pub async fn advance_state(
        id: &str,
        target: DocumentState,
        db: &SurrealDbClient,
    ) -> Result<Option<Document>, AppError> {
        const ADVANCE_QUERY: &str = r"
            UPDATE type::thing($table, $id)
            SET state = $target,
                updated_at = $now
            WHERE state IN $allowed
            RETURN AFTER;
        ";

        let mut result = db
            .client
            .query(ADVANCE_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("target", target.as_str()))
            .bind(("allowed", DocumentState::predecessors_of(target)))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?;

        let updated: Option<Document> = result.take(0)?;
        Ok(updated)
    }

    /// Moves any non-ready document to `Failed`, keeping at most [`MAX_ERROR_CHARS`] of `error`.
    pub async fn mark_failed(
        id: &str,
        error: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Document>, AppError> {
        const FAIL_QUERY: &str = r"
            UPDATE type::thing($table, $id)
            SET state = $failed,
                last_error = $error,
                updated_at = $now
            WHERE state != $ready
            RETURN AFTER;
        ";

        let mut result = db
            .client
            .query(FAIL_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("failed", DocumentState::Failed.as_str()))
            .bind(("ready", DocumentState::Ready.as_str()))
            .bind(("error", truncate_error_message(error, MAX_ERROR_CHARS)))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?;

        let updated: Option<Document> = result.take(0)?;
        Ok(updated)
    }

    /// The only way out of `Failed`: resume at `resume_at`, clearing the recorded error.
    pub async fn reset_for_retry(
        id: &str,
        resume_at: DocumentState,
        db: &SurrealDbClient,
    ) -> Result<Option<Document>, AppError> {
        if resume_at.is_terminal() {
            return Err(AppError::Validation(format!(
                "cannot resume a document at {}",
                resume_at.as_str()
            )));
        }

        const RETRY_QUERY: &str = r"
            UPDATE type::thing($table, $id)
            SET state = $resume_at,
                last_error = NONE,
                updated_at = $now
            WHERE state = $failed
            RETURN AFTER;
        ";

        let mut result = db
            .client
            .query(RETRY_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("resume_at", resume_at.as_str()))
            .bind(("failed", DocumentState::Failed.as_str()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?;

        let updated: Option<Document> = result.take(0)?;
        Ok(updated)
    }

    pub async fn record_extraction(
        id: &str,
        page_count: u32,
        has_text: bool,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let _res: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace("/page_count", page_count))
            .patch(PatchOp::replace("/has_text", has_text))
            .patch(PatchOp::replace(
                "/updated_at",
                SurrealDatetime::from(Utc::now()),
            ))
            .await?;
        Ok(())
    }

    pub async fn record_chunking(
        id: &str,
        chunk_count: u32,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        let _res: Option<Self> = db
            .update((Self::table_name(), id))
            .patch(PatchOp::replace("/chunk_count", chunk_count))
            .patch(PatchOp::replace(
                "/updated_at",
                SurrealDatetime::from(Utc::now()),
            ))
            .await?;
        Ok(())
    }

    pub async fn record_embedding(
        id: &str,
        model: &str,
        dimension: u32,
        artifact_version: Option<u32>,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing($table, $id)
                 SET embedding_model = $model,
                     embedding_dimension = $dimension,
                     artifact_version = $version,
                     updated_at = $now;",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("model", model.to_string()))
            .bind(("dimension", dimension))
            .bind(("version", artifact_version))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn record_summary(
        id: &str,
        summary: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.client
            .query("UPDATE type::thing($table, $id) SET summary = $summary, updated_at = $now;")
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("summary", summary.to_string()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?
            .check()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> SurrealDbClient {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb");
        db.ensure_initialized().await.expect("schema");
        db
    }

    fn sample(hash: &str) -> Document {
        Document::new(
            "org".into(),
            "tender".into(),
            hash.into(),
            "spec.pdf".into(),
            10,
            "application/pdf".into(),
            "tenders/org/tender/raw/h/spec.pdf".into(),
            "upload-1".into(),
        )
    }

    #[tokio::test]
    async fn identical_hash_resolves_to_existing_document() {
        let db = memory_db().await;
        let (first, created) = Document::create_or_get(sample("h1"), &db)
            .await
            .expect("create");
        assert!(created);

        let (second, created_again) = Document::create_or_get(sample("h1"), &db)
            .await
            .expect("dedup");
        assert!(!created_again);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn state_only_moves_forward() {
        let db = memory_db().await;
        let (doc, _) = Document::create_or_get(sample("h2"), &db)
            .await
            .expect("create");

        let chunking = Document::advance_state(&doc.id, DocumentState::Chunking, &db)
            .await
            .expect("advance")
            .expect("moved");
        assert_eq!(chunking.state, DocumentState::Chunking);

        let same = Document::advance_state(&doc.id, DocumentState::Chunking, &db)
            .await
            .expect("re-enter");
        assert!(same.is_some());

        let back = Document::advance_state(&doc.id, DocumentState::Extracting, &db)
            .await
            .expect("regress attempt");
        assert!(back.is_none());

        let stored = Document::get(&doc.id, &db).await.expect("get");
        assert_eq!(stored.state, DocumentState::Chunking);
    }

    #[tokio::test]
    async fn failure_truncates_and_retry_is_the_only_exit() {
        let db = memory_db().await;
        let (doc, _) = Document::create_or_get(sample("h3"), &db)
            .await
            .expect("create");

        let failed = Document::mark_failed(&doc.id, &"x".repeat(900), &db)
            .await
            .expect("fail")
            .expect("updated");
        assert_eq!(failed.state, DocumentState::Failed);
        assert_eq!(
            failed.last_error.as_deref().map(str::len),
            Some(MAX_ERROR_CHARS)
        );

        let blocked = Document::advance_state(&doc.id, DocumentState::Embedding, &db)
            .await
            .expect("advance attempt");
        assert!(blocked.is_none());

        let resumed = Document::reset_for_retry(&doc.id, DocumentState::Embedding, &db)
            .await
            .expect("retry")
            .expect("reset");
        assert_eq!(resumed.state, DocumentState::Embedding);
        assert!(resumed.last_error.is_none());
    }

    #[tokio::test]
    async fn ready_documents_cannot_fail() {
        let db = memory_db().await;
        let (doc, _) = Document::create_or_get(sample("h4"), &db)
            .await
            .expect("create");
        Document::advance_state(&doc.id, DocumentState::Ready, &db)
            .await
            .expect("ready");

        let result = Document::mark_failed(&doc.id, "late", &db)
            .await
            .expect("fail attempt");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn patches_record_stage_outputs() {
        let db = memory_db().await;
        let (doc, _) = Document::create_or_get(sample("h5"), &db)
            .await
            .expect("create");

        Document::record_extraction(&doc.id, 2, true, &db)
            .await
            .expect("extraction");
        Document::record_chunking(&doc.id, 7, &db).await.expect("chunks");
        Document::record_embedding(&doc.id, "hashed-fallback-v1", 256, Some(1), &db)
            .await
            .expect("embedding");

        let stored = Document::get(&doc.id, &db).await.expect("get");
        assert_eq!(stored.page_count, 2);
        assert!(stored.has_text);
        assert_eq!(stored.chunk_count, 7);
        assert_eq!(stored.embedding_dimension, Some(256));
        assert_eq!(stored.artifact_version, Some(1));
    }
}
