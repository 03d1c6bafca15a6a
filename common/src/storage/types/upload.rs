use surrealdb::sql::Datetime as SurrealDatetime;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Default, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum UploadState {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl UploadState {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadState::Pending => "Pending",
            UploadState::Completed => "Completed",
            UploadState::Failed => "Failed",
        }
    }
}

stored_object!(Upload, "upload", {
    org_id: String,
    tender_id: String,
    file_name: String,
    storage_key: String,
    mime_type: String,
    byte_size: u64,
    state: UploadState,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    discovered_documents: u32,
    #[serde(default)]
    truncated_entries: u32
});

impl Upload {
    pub fn new(
        org_id: String,
        tender_id: String,
        file_name: String,
        storage_key: String,
        mime_type: String,
        byte_size: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            org_id,
            tender_id,
            file_name,
            storage_key,
            mime_type,
            byte_size,
            state: UploadState::Pending,
            error_message: None,
            discovered_documents: 0,
            truncated_entries: 0,
        }
    }

    /// Pending -> Completed. A completed upload is never reopened.
    pub async fn mark_completed(
        id: &str,
        discovered_documents: u32,
        truncated_entries: u32,
        db: &SurrealDbClient,
    ) -> Result<Option<Upload>, AppError> {
        let mut result = db
            .client
            .query(
                "UPDATE type::thing($table, $id)
                 SET state = $completed,
                     discovered_documents = $discovered,
                     truncated_entries = $truncated,
                     updated_at = $now
                 WHERE state = $pending
                 RETURN AFTER;",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("completed", UploadState::Completed.as_str()))
            .bind(("pending", UploadState::Pending.as_str()))
            .bind(("discovered", discovered_documents))
            .bind(("truncated", truncated_entries))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?;

        let updated: Option<Upload> = result.take(0)?;
        Ok(updated)
    }

    /// Records a failure. Completed uploads only receive the error annotation.
    pub async fn mark_failed(
        id: &str,
        message: &str,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing($table, $id)
                 SET state = IF state = $completed THEN state ELSE $failed END,
                     error_message = $message,
                     updated_at = $now;",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("completed", UploadState::Completed.as_str()))
            .bind(("failed", UploadState::Failed.as_str()))
            .bind(("message", message.to_string()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?
            .check()?;
        Ok(())
    }
}
