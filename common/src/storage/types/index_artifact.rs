use surrealdb::sql::Datetime as SurrealDatetime;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Default, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum ArtifactState {
    #[default]
    Building,
    Ready,
    Failed,
}

impl ArtifactState {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactState::Building => "Building",
            ArtifactState::Ready => "Ready",
            ArtifactState::Failed => "Failed",
        }
    }
}

stored_object!(IndexArtifact, "index_artifact", {
    org_id: String,
    tender_id: String,
    document_id: String,
    doc_hash: String,
    version: u32,
    storage_key: String,
    state: ArtifactState,
    #[serde(default)]
    checksum: Option<String>,
    #[serde(default)]
    chunk_count: u32,
    #[serde(default)]
    dimension: u32,
    #[serde(default)]
    model: Option<String>
});

impl IndexArtifact {
    /// Reserves the next version for `doc_hash` and stores a `Building` record for it.
    pub async fn begin_build(
        org_id: &str,
        tender_id: &str,
        document_id: &str,
        doc_hash: &str,
        storage_key_for: impl Fn(u32) -> String,
        db: &SurrealDbClient,
    ) -> Result<IndexArtifact, AppError> {
        let version = Self::latest_version(doc_hash, db).await?.map_or(1, |v| v.saturating_add(1));
        let now = Utc::now();
        let artifact = IndexArtifact {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            org_id: org_id.to_string(),
            tender_id: tender_id.to_string(),
            document_id: document_id.to_string(),
            doc_hash: doc_hash.to_string(),
            version,
            storage_key: storage_key_for(version),
            state: ArtifactState::Building,
            checksum: None,
            chunk_count: 0,
            dimension: 0,
            model: None,
        };

        db.store_item(artifact.clone()).await?;
        Ok(artifact)
    }

    pub async fn latest_version(
        doc_hash: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<u32>, AppError> {
        let mut result = db
            .client
            .query(
                "SELECT VALUE version FROM type::table($table)
                 WHERE doc_hash = $doc_hash
                 ORDER BY version DESC LIMIT 1",
            )
            .bind(("table", Self::table_name()))
            .bind(("doc_hash", doc_hash.to_string()))
            .await?;

        let version: Option<u32> = result.take(0)?;
        Ok(version)
    }

    /// Newest `Ready` artifact of a document, if any.
    pub async fn latest_ready(
        document_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<IndexArtifact>, AppError> {
        let mut result = db
            .client
            .query(
                "SELECT * FROM type::table($table)
                 WHERE document_id = $document_id AND state = $ready
                 ORDER BY version DESC LIMIT 1",
            )
            .bind(("table", Self::table_name()))
            .bind(("document_id", document_id.to_string()))
            .bind(("ready", ArtifactState::Ready.as_str()))
            .await?;

        let artifact: Option<IndexArtifact> = result.take(0)?;
        Ok(artifact)
    }

    /// Building -> Ready. Ready artifacts are never touched again.
    pub async fn mark_ready(
        &self,
        checksum: &str,
        chunk_count: u32,
        dimension: u32,
        model: &str,
        db: &SurrealDbClient,
    ) -> Result<IndexArtifact, AppError> {
        const READY_QUERY: &str = r"
            UPDATE type::thing($table, $id)
            SET state = $ready,
                checksum = $checksum,
                chunk_count = $chunk_count,
                dimension = $dimension,
                model = $model,
                updated_at = $now
            WHERE state = $building
            RETURN AFTER;
        ";

        let mut result = db
            .client
            .query(READY_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("ready", ArtifactState::Ready.as_str()))
            .bind(("building", ArtifactState::Building.as_str()))
            .bind(("checksum", checksum.to_string()))
            .bind(("chunk_count", chunk_count))
            .bind(("dimension", dimension))
            .bind(("model", model.to_string()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?;

        let updated: Option<IndexArtifact> = result.take(0)?;
        updated.ok_or_else(|| {
            AppError::Consistency(format!(
                "artifact {} v{} left the Building state before publish",
                self.doc_hash, self.version
            ))
        })
    }

    pub async fn mark_failed(&self, db: &SurrealDbClient) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing($table, $id)
                 SET state = $failed, updated_at = $now
                 WHERE state = $building;",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("failed", ArtifactState::Failed.as_str()))
            .bind(("building", ArtifactState::Building.as_str()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?
            .check()?;
        Ok(())
    }
}
