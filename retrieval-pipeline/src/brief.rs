use std::{future::Future, sync::Arc, time::Duration};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        keys,
        lock::LockManager,
        types::{organization::Organization, tender::Tender},
    },
};
use serde::Serialize;
use tokio_retry::{
    strategy::{jitter, FixedInterval},
    RetryIf,
};
use tracing::{error, info, instrument, warn};

use crate::{
    answer::{AnswerComposer, Citation, GroundedAnswer},
    engine::RetrievalEngine,
};

const BRIEF_QUERY: &str =
    "scope of work, submission deadline, site visit, evaluation criteria, securities, payment terms";
const BRIEF_PASSAGES: usize = 16;
const USAGE_LOCK_TTL: Duration = Duration::from_secs(30);
const USAGE_LOCK_RETRIES: usize = 20;
const USAGE_LOCK_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize)]
pub struct TenderBrief {
    pub brief: String,
    pub citations: Vec<Citation>,
    pub credits_remaining: u32,
    pub used_briefs: u32,
}

/// Generates tender briefs while keeping the organisation's usage counters consistent.
pub struct BriefService {
    db: Arc<SurrealDbClient>,
    locks: LockManager,
    engine: Arc<RetrievalEngine>,
    composer: Arc<AnswerComposer>,
}

impl BriefService {
    pub fn new(
        db: Arc<SurrealDbClient>,
        locks: LockManager,
        engine: Arc<RetrievalEngine>,
        composer: Arc<AnswerComposer>,
    ) -> Self {
        Self {
            db,
            locks,
            engine,
            composer,
        }
    }

    /// Reserves a brief, generates it and refunds the reservation when generation fails.
    #[instrument(skip_all, fields(org_id = %org_id, tender_id = %tender_id))]
    pub async fn generate_brief(
        &self,
        org_id: &str,
        tender_id: &str,
    ) -> Result<TenderBrief, AppError> {
        let tender = self
            .db
            .get_item::<Tender>(tender_id)
            .await?
            .filter(|tender| tender.org_id == org_id)
            .ok_or_else(|| AppError::NotFound(format!("tender {tender_id}")))?;

        let reserved = self
            .with_usage_lock(org_id, || {
                Organization::reserve_brief(org_id, tender_id, &self.db)
            })
            .await?;

        match self.write_brief(org_id, &tender).await {
            Ok(answer) => {
                info!(
                    credits_remaining = reserved.brief_credits,
                    used_briefs = reserved.used_briefs,
                    "tender brief generated"
                );
                Ok(TenderBrief {
                    brief: answer.answer,
                    citations: answer.citations,
                    credits_remaining: reserved.brief_credits,
                    used_briefs: reserved.used_briefs,
                })
            }
            Err(err) => {
                warn!(error = %err, "brief generation failed; refunding usage");
                self.refund(org_id, tender_id).await;
                Err(err)
            }
        }
    }

    /// Refunds under the usage lock, or queues the refund for the next reservation when the
    /// lock cannot be used.
    async fn refund(&self, org_id: &str, tender_id: &str) {
        let Err(refund_err) = self
            .with_usage_lock(org_id, || {
                Organization::refund_brief(org_id, tender_id, &self.db)
            })
            .await
        else {
            return;
        };

        warn!(error = %refund_err, "brief refund failed; queueing it");
        if let Err(queue_err) = Organization::queue_refund(org_id, tender_id, &self.db).await {
            error!(
                error = %queue_err,
                refund_error = %refund_err,
                "brief refund lost; usage counters need manual correction"
            );
        }
    }

    async fn write_brief(
        &self,
        org_id: &str,
        tender: &Tender,
    ) -> Result<GroundedAnswer, AppError> {
        let passages = self
            .engine
            .search_tender(org_id, &tender.id, BRIEF_QUERY, Some(BRIEF_PASSAGES))
            .await?;
        self.composer.brief(&tender.name, &passages).await
    }

    /// Runs `body` under the organisation's usage lock, waiting briefly while another
    /// request holds it.
    async fn with_usage_lock<T, F, Fut>(&self, org_id: &str, body: F) -> Result<T, AppError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let key = keys::org_usage_lock_key(org_id);
        let (key, body, locks) = (key.as_str(), &body, &self.locks);
        let strategy = FixedInterval::new(USAGE_LOCK_BACKOFF)
            .map(jitter)
            .take(USAGE_LOCK_RETRIES);

        let outcome = RetryIf::spawn(
            strategy,
            || async move {
                match locks.with_lock(key, USAGE_LOCK_TTL, body).await {
                    Ok(Some(value)) => Ok(value),
                    Ok(None) => Err(UsageLockError::Busy),
                    Err(err) => Err(UsageLockError::Failed(err)),
                }
            },
            |err: &UsageLockError| matches!(err, UsageLockError::Busy),
        )
        .await;

        match outcome {
            Ok(value) => Ok(value),
            Err(UsageLockError::Busy) => Err(AppError::InternalError(format!(
                "usage counters for {org_id} are busy"
            ))),
            Err(UsageLockError::Failed(err)) => Err(err),
        }
    }
}

enum UsageLockError {
    Busy,
    Failed(AppError),
}
