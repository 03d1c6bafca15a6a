use surrealdb::sql::Datetime as SurrealDatetime;
use uuid::Uuid;

use crate::{
    error::AppError,
    storage::db::SurrealDbClient,
    stored_object,
};

use super::document::{Document, DocumentState};

stored_object!(Tender, "tender", {
    org_id: String,
    name: String,
    #[serde(default)]
    documents_total: u32,
    #[serde(default)]
    documents_ready: u32,
    #[serde(default)]
    partially_ready: bool
});

impl Tender {
    pub fn new(id: String, org_id: String, name: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: now,
            updated_at: now,
            org_id,
            name,
            documents_total: 0,
            documents_ready: 0,
            partially_ready: false,
        }
    }

    /// Returns the tender, creating an empty one the first time an org uploads to `tender_id`.
    pub async fn get_or_create(
        tender_id: &str,
        org_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Tender, AppError> {
        if let Some(existing) = db.get_item::<Tender>(tender_id).await? {
            if existing.org_id != org_id {
                return Err(AppError::NotFound(format!("tender {tender_id}")));
            }
            return Ok(existing);
        }

        let tender = Tender::new(tender_id.to_string(), org_id.to_string(), tender_id.to_string());
        match db.store_item(tender.clone()).await {
            Ok(stored) => Ok(stored.unwrap_or(tender)),
            Err(err) if err.to_string().contains("already exists") => db
                .get_item::<Tender>(tender_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("tender {tender_id}"))),
            Err(err) => Err(err.into()),
        }
    }

    /// Recounts the tender's documents and flips `partially_ready` once `ready / total >= ratio`.
    ///
    /// The flag never clears again once set.
    pub async fn refresh_readiness(
        tender_id: &str,
        org_id: &str,
        ratio: f64,
        db: &SurrealDbClient,
    ) -> Result<Tender, AppError> {
        let documents = Document::list_by_tender(org_id, tender_id, db).await?;
        let total = u32::try_from(documents.len()).unwrap_or(u32::MAX);
        let ready = u32::try_from(
            documents
                .iter()
                .filter(|doc| doc.state == DocumentState::Ready)
                .count(),
        )
        .unwrap_or(u32::MAX);

        let reached = total > 0 && f64::from(ready) / f64::from(total) >= ratio;

        Self::get_or_create(tender_id, org_id, db).await?;

        let mut result = db
            .client
            .query(
                "UPDATE type::thing($table, $id)
                 SET documents_total = $total,
                     documents_ready = $ready,
                     partially_ready = partially_ready OR $reached,
                     updated_at = $now
                 RETURN AFTER;",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", tender_id.to_string()))
            .bind(("total", total))
            .bind(("ready", ready))
            .bind(("reached", reached))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?;

        let updated: Option<Tender> = result.take(0)?;
        updated.ok_or_else(|| AppError::NotFound(format!("tender {tender_id}")))
    }
}
