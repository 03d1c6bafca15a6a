use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(TextChunk, "text_chunk", {
    document_id: String,
    org_id: String,
    tender_id: String,
    chunk_index: u32,
    page_start: u32,
    page_end: u32,
    #[serde(default)]
    heading: Option<String>,
    text: String,
    embedding: Vec<f32>
});

impl TextChunk {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        document_id: String,
        org_id: String,
        tender_id: String,
        chunk_index: u32,
        page_start: u32,
        page_end: u32,
        heading: Option<String>,
        text: String,
        embedding: Vec<f32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            document_id,
            org_id,
            tender_id,
            chunk_index,
            page_start,
            page_end,
            heading,
            text,
            embedding,
        }
    }

    pub async fn delete_by_document(
        document_id: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.client
            .query("DELETE type::table($table) WHERE document_id = $document_id")
            .bind(("table", Self::table_name()))
            .bind(("document_id", document_id.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    /// Replaces every chunk row of a document in one transaction.
    pub async fn replace_for_document(
        document_id: &str,
        chunks: Vec<TextChunk>,
        db: &SurrealDbClient,
    ) -> Result<usize, AppError> {
        const REPLACE_QUERY: &str = r"
            BEGIN TRANSACTION;
            DELETE type::table($table) WHERE document_id = $document_id;
            FOR $chunk IN $chunks {
                CREATE type::thing($table, $chunk.id) CONTENT {
                    document_id: $chunk.document_id,
                    org_id: $chunk.org_id,
                    tender_id: $chunk.tender_id,
                    chunk_index: $chunk.chunk_index,
                    page_start: $chunk.page_start,
                    page_end: $chunk.page_end,
                    heading: $chunk.heading,
                    text: $chunk.text,
                    embedding: $chunk.embedding,
                    created_at: time::now(),
                    updated_at: time::now()
                };
            };
            COMMIT TRANSACTION;
        ";

        let count = chunks.len();
        db.client
            .query(REPLACE_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("document_id", document_id.to_string()))
            .bind(("chunks", chunks))
            .await?
            .check()?;
        Ok(count)
    }

    pub async fn count_for_document(
        document_id: &str,
        db: &SurrealDbClient,
    ) -> Result<usize, AppError> {
        let mut result = db
            .client
            .query(
                "SELECT count() AS total FROM type::table($table)
                 WHERE document_id = $document_id GROUP ALL",
            )
            .bind(("table", Self::table_name()))
            .bind(("document_id", document_id.to_string()))
            .await?;

        let total: Option<usize> = result.take("total")?;
        Ok(total.unwrap_or(0))
    }

    pub async fn list_for_document(
        document_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<TextChunk>, AppError> {
        let chunks: Vec<TextChunk> = db
            .client
            .query(
                "SELECT * FROM type::table($table)
                 WHERE document_id = $document_id
                 ORDER BY chunk_index ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("document_id", document_id.to_string()))
            .await?
            .take(0)?;
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> SurrealDbClient {
        SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb")
    }

    fn chunk(document_id: &str, index: u32, text: &str) -> TextChunk {
        TextChunk::new(
            document_id.into(),
            "org".into(),
            "tender".into(),
            index,
            1,
            1,
            None,
            text.into(),
            vec![0.5, 0.5],
        )
    }

    #[tokio::test]
    async fn replace_is_wholesale_and_idempotent() {
        let db = memory_db().await;
        let doc = "doc-1";

        TextChunk::replace_for_document(doc, vec![chunk(doc, 0, "a"), chunk(doc, 1, "b")], &db)
            .await
            .expect("first write");
        TextChunk::replace_for_document(doc, vec![chunk(doc, 0, "a"), chunk(doc, 1, "b")], &db)
            .await
            .expect("second write");

        assert_eq!(TextChunk::count_for_document(doc, &db).await.expect("count"), 2);

        let listed = TextChunk::list_for_document(doc, &db).await.expect("list");
        let indices: Vec<u32> = listed.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[tokio::test]
    async fn delete_only_touches_one_document() {
        let db = memory_db().await;
        TextChunk::replace_for_document("a", vec![chunk("a", 0, "x")], &db)
            .await
            .expect("a");
        TextChunk::replace_for_document("b", vec![chunk("b", 0, "y")], &db)
            .await
            .expect("b");

        TextChunk::delete_by_document("a", &db).await.expect("delete");
        assert_eq!(TextChunk::count_for_document("a", &db).await.expect("count"), 0);
        assert_eq!(TextChunk::count_for_document("b", &db).await.expect("count"), 1);
    }
}
