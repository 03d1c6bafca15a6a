use surrealdb::sql::Datetime as SurrealDatetime;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

pub const TENDER_BRIEF_LIMIT: &str = "TENDER_BRIEF_LIMIT";
pub const BRIEF_CREDITS_EXHAUSTED: &str = "BRIEF_CREDITS_EXHAUSTED";

#[derive(Debug, Default, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum Plan {
    #[default]
    Trial,
    Paid,
}

stored_object!(Organization, "organization", {
    name: String,
    api_key: String,
    plan: Plan,
    brief_credits: u32,
    #[serde(default)]
    used_briefs: u32,
    #[serde(default)]
    briefed_tenders: Vec<String>,
    #[serde(default)]
    pending_refunds: Vec<String>
});

impl Organization {
    pub fn new(name: String, api_key: String, plan: Plan, brief_credits: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            name,
            api_key,
            plan,
            brief_credits,
            used_briefs: 0,
            briefed_tenders: Vec::new(),
            pending_refunds: Vec::new(),
        }
    }

    pub async fn get(id: &str, db: &SurrealDbClient) -> Result<Organization, AppError> {
        db.get_item::<Organization>(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("organization {id}")))
    }

    pub async fn find_by_api_key(
        api_key: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Organization>, AppError> {
        let mut result = db
            .client
            .query("SELECT * FROM type::table($table) WHERE api_key = $api_key LIMIT 1")
            .bind(("table", Self::table_name()))
            .bind(("api_key", api_key.to_string()))
            .await?;

        let org: Option<Organization> = result.take(0)?;
        Ok(org)
    }

    /// Checks whether another brief for `tender_id` is allowed under the current counters.
    pub fn check_brief_allowed(&self, tender_id: &str) -> Result<(), AppError> {
        if self.plan == Plan::Paid {
            return Ok(());
        }
        if self.briefed_tenders.iter().any(|t| t == tender_id) {
            return Err(AppError::UsageLimit {
                code: TENDER_BRIEF_LIMIT,
                message: format!(
                    "trial plans get one brief per tender; {tender_id} was already briefed"
                ),
            });
        }
        if self.brief_credits == 0 {
            return Err(AppError::UsageLimit {
                code: BRIEF_CREDITS_EXHAUSTED,
                message: "no brief credits left".to_string(),
            });
        }
        Ok(())
    }

    /// Counters with the reservation for `tender_id` given back.
    fn refunded(mut self, tender_id: &str) -> Self {
        self.briefed_tenders.retain(|t| t != tender_id);
        if self.plan == Plan::Trial {
            self.brief_credits = self.brief_credits.saturating_add(1);
        }
        self.used_briefs = self.used_briefs.saturating_sub(1);
        self
    }

    /// Spends one brief for `tender_id`, settling queued refunds first. Callers hold the
    /// org-usage lock.
    pub async fn reserve_brief(
        id: &str,
        tender_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Organization, AppError> {
        let org = Self::get(id, db).await?;
        let settled = org.pending_refunds.clone();
        let mut org = settled
            .iter()
            .fold(org, |org, pending| org.refunded(pending));
        org.check_brief_allowed(tender_id)?;

        if !org.briefed_tenders.iter().any(|t| t == tender_id) {
            org.briefed_tenders.push(tender_id.to_string());
        }
        if org.plan == Plan::Trial {
            org.brief_credits = org.brief_credits.saturating_sub(1);
        }
        org.used_briefs = org.used_briefs.saturating_add(1);

        Self::write_counters(&org, &settled, db).await
    }

    /// Undoes [`Organization::reserve_brief`] after a failed generation. Callers hold the
    /// org-usage lock.
    pub async fn refund_brief(
        id: &str,
        tender_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Organization, AppError> {
        let org = Self::get(id, db).await?.refunded(tender_id);
        Self::write_counters(&org, &[], db).await
    }

    /// Queues a refund for the next reservation. A single statement, so it needs no lock.
    pub async fn queue_refund(
        id: &str,
        tender_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Organization, AppError> {
        let updated: Option<Organization> = db
            .client
            .query(
                "UPDATE type::thing($table, $id)
                 SET pending_refunds += $tender_id, updated_at = $now
                 RETURN AFTER;",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("tender_id", tender_id.to_string()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?
            .take(0)?;

        updated.ok_or_else(|| AppError::NotFound(format!("organization {id}")))
    }

    /// Writes the counters of `org` and drops `settled` from the refund queue. Refunds queued
    /// since `org` was read stay queued.
    async fn write_counters(
        org: &Organization,
        settled: &[String],
        db: &SurrealDbClient,
    ) -> Result<Organization, AppError> {
        let updated: Option<Organization> = db
            .client
            .query(
                "UPDATE type::thing($table, $id)
                 SET brief_credits = $credits,
                     used_briefs = $used,
                     briefed_tenders = $tenders,
                     pending_refunds = array::complement(pending_refunds ?? [], $settled),
                     updated_at = $now
                 RETURN AFTER;",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", org.id.clone()))
            .bind(("credits", org.brief_credits))
            .bind(("used", org.used_briefs))
            .bind(("tenders", org.briefed_tenders.clone()))
            .bind(("settled", settled.to_vec()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?
            .take(0)?;

        updated.ok_or_else(|| AppError::NotFound(format!("organization {}", org.id)))
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

    #[tokio::test]
    async fn api_key_lookup() {
        let db = memory_db().await;
        let org = Organization::new("Acme".into(), "key-1".into(), Plan::Trial, 3);
        db.store_item(org.clone()).await.expect("store");

        let found = Organization::find_by_api_key("key-1", &db)
            .await
            .expect("query")
            .expect("org");
        assert_eq!(found.id, org.id);
        assert!(Organization::find_by_api_key("nope", &db)
            .await
            .expect("query")
            .is_none());
    }

    #[tokio::test]
    async fn trial_orgs_brief_each_tender_once() {
        let db = memory_db().await;
        let org = Organization::new("Acme".into(), "k".into(), Plan::Trial, 3);
        db.store_item(org.clone()).await.expect("store");

        let after = Organization::reserve_brief(&org.id, "t1", &db)
            .await
            .expect("reserve");
        assert_eq!(after.brief_credits, 2);
        assert_eq!(after.used_briefs, 1);
        assert_eq!(after.briefed_tenders, vec!["t1".to_string()]);

        let again = Organization::reserve_brief(&org.id, "t1", &db).await;
        assert!(matches!(
            again,
            Err(AppError::UsageLimit { code: TENDER_BRIEF_LIMIT, .. })
        ));
    }

    #[tokio::test]
    async fn exhausted_credits_are_rejected_and_refunds_restore() {
        let db = memory_db().await;
        let org = Organization::new("Acme".into(), "k".into(), Plan::Trial, 1);
        db.store_item(org.clone()).await.expect("store");

        Organization::reserve_brief(&org.id, "t1", &db)
            .await
            .expect("reserve");
        let denied = Organization::reserve_brief(&org.id, "t2", &db).await;
        assert!(matches!(
            denied,
            Err(AppError::UsageLimit { code: BRIEF_CREDITS_EXHAUSTED, .. })
        ));

        let refunded = Organization::refund_brief(&org.id, "t1", &db)
            .await
            .expect("refund");
        assert_eq!(refunded.brief_credits, 1);
        assert_eq!(refunded.used_briefs, 0);
        assert!(refunded.briefed_tenders.is_empty());
    }

    #[tokio::test]
    async fn queued_refunds_are_settled_on_the_next_reservation() {
        let db = memory_db().await;
        let org = Organization::new("Acme".into(), "k".into(), Plan::Trial, 1);
        db.store_item(org.clone()).await.expect("store");

        Organization::reserve_brief(&org.id, "t1", &db)
            .await
            .expect("reserve");
        let queued = Organization::queue_refund(&org.id, "t1", &db)
            .await
            .expect("queue");
        assert_eq!(queued.pending_refunds, vec!["t1".to_string()]);
        assert_eq!(queued.brief_credits, 0);

        let after = Organization::reserve_brief(&org.id, "t1", &db)
            .await
            .expect("refund settles before the limit check");
        assert_eq!(after.brief_credits, 0);
        assert_eq!(after.used_briefs, 1);
        assert_eq!(after.briefed_tenders, vec!["t1".to_string()]);
        assert!(after.pending_refunds.is_empty());
    }

    #[test]
    fn paid_plans_are_not_limited() {
        let mut org = Organization::new("Acme".into(), "k".into(), Plan::Paid, 0);
        org.briefed_tenders.push("t1".into());
        assert!(org.check_brief_allowed("t1").is_ok());
    }
}
