use std::{sync::Arc, time::Duration};

use chrono::Duration as ChronoDuration;
use surrealdb::sql::Datetime as SurrealDatetime;

use crate::{
    error::AppError,
    storage::{db::SurrealDbClient, types::document::DocumentState},
    stored_object,
};

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum ProgressPhase {
    Queued,
    Extracting,
    Chunking,
    Embedding,
    Packaging,
    Summarizing,
    Complete,
    Failed,
}

impl ProgressPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressPhase::Queued => "Queued",
            ProgressPhase::Extracting => "Extracting",
            ProgressPhase::Chunking => "Chunking",
            ProgressPhase::Embedding => "Embedding",
            ProgressPhase::Packaging => "Packaging",
            ProgressPhase::Summarizing => "Summarizing",
            ProgressPhase::Complete => "Complete",
            ProgressPhase::Failed => "Failed",
        }
    }
}

stored_object!(ProgressSnapshot, "pipeline_progress", {
    phase: ProgressPhase,
    percent: f32,
    #[serde(default)]
    batches_done: u32,
    #[serde(default)]
    batches_total: u32,
    #[serde(default)]
    eta_secs: Option<u64>,
    #[serde(default)]
    message: Option<String>,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime")]
    expires_at: DateTime<Utc>,
    #[serde(default)]
    vectors_done: u32,
    #[serde(default)]
    dimension: Option<u32>,
    #[serde(default)]
    model: Option<String>
});

/// Embedding progress after one completed batch.
#[derive(Debug, Clone)]
pub struct BatchProgress {
    pub batches_done: u32,
    pub batches_total: u32,
    pub vectors_done: u32,
    pub dimension: u32,
    pub model: String,
    /// Batches already done when this run started; a resumed run only times its own batches.
    pub batches_at_start: u32,
    pub started_at: DateTime<Utc>,
}

impl BatchProgress {
    /// Seconds left at the rate observed since `started_at`.
    pub fn eta_secs(&self, now: DateTime<Utc>) -> Option<u64> {
        let done_this_run = self.batches_done.saturating_sub(self.batches_at_start);
        if done_this_run == 0 {
            return None;
        }
        let elapsed = (now - self.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        let remaining = f64::from(self.batches_total.saturating_sub(self.batches_done));
        Some((elapsed / f64::from(done_this_run) * remaining).ceil() as u64)
    }
}

/// Where an interrupted embedding run may pick up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedResume {
    pub batches_done: u32,
    pub vectors_done: u32,
    pub dimension: u32,
    pub model: String,
}

/// Advisory per-document progress keyed by document id. Entries expire after `ttl`.
#[derive(Clone)]
pub struct ProgressStore {
    db: Arc<SurrealDbClient>,
    ttl: Duration,
}

impl ProgressStore {
    pub fn new(db: Arc<SurrealDbClient>, ttl: Duration) -> Self {
        Self { db, ttl }
    }

    fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + ChronoDuration::from_std(self.ttl).unwrap_or_else(|_| ChronoDuration::hours(1))
    }

    pub async fn set_phase(
        &self,
        document_id: &str,
        phase: ProgressPhase,
        percent: f32,
        message: Option<String>,
    ) -> Result<(), AppError> {
        let now = Utc::now();
        self.db
            .client
            .query(
                "UPSERT type::thing($table, $id)
                 SET phase = $phase,
                     percent = $percent,
                     message = $message,
                     expires_at = $expires_at,
                     created_at = created_at ?? $now,
                     updated_at = $now;",
            )
            .bind(("table", ProgressSnapshot::table_name()))
            .bind(("id", document_id.to_string()))
            .bind(("phase", phase.as_str()))
            .bind(("percent", percent.clamp(0.0, 100.0)))
            .bind(("message", message))
            .bind(("expires_at", SurrealDatetime::from(self.expires_at(now))))
            .bind(("now", SurrealDatetime::from(now)))
            .await?
            .check()?;
        Ok(())
    }

    /// Records a finished embedding batch together with the state needed to resume after it.
    pub async fn record_batch(
        &self,
        document_id: &str,
        batch: &BatchProgress,
    ) -> Result<(), AppError> {
        let now = Utc::now();
        let total = batch.batches_total.max(1);
        let percent = (f64::from(batch.batches_done) / f64::from(total) * 100.0) as f32;

        let eta_secs = batch.eta_secs(now);

        self.db
            .client
            .query(
                "UPSERT type::thing($table, $id)
                 SET phase = $phase,
                     percent = $percent,
                     batches_done = $batches_done,
                     batches_total = $batches_total,
                     vectors_done = $vectors_done,
                     dimension = $dimension,
                     model = $model,
                     eta_secs = $eta_secs,
                     message = $message,
                     expires_at = $expires_at,
                     created_at = created_at ?? $now,
                     updated_at = $now;",
            )
            .bind(("table", ProgressSnapshot::table_name()))
            .bind(("id", document_id.to_string()))
            .bind(("phase", ProgressPhase::Embedding.as_str()))
            .bind(("percent", percent.clamp(0.0, 100.0)))
            .bind(("batches_done", batch.batches_done))
            .bind(("batches_total", batch.batches_total))
            .bind(("vectors_done", batch.vectors_done))
            .bind(("dimension", batch.dimension))
            .bind(("model", batch.model.clone()))
            .bind(("eta_secs", eta_secs))
            .bind((
                "message",
                format!("embedded batch {}/{}", batch.batches_done, batch.batches_total),
            ))
            .bind(("expires_at", SurrealDatetime::from(self.expires_at(now))))
            .bind(("now", SurrealDatetime::from(now)))
            .await?
            .check()?;
        Ok(())
    }

    /// Current snapshot, or `None` when absent or expired.
    pub async fn get(&self, document_id: &str) -> Result<Option<ProgressSnapshot>, AppError> {
        let snapshot = self.db.get_item::<ProgressSnapshot>(document_id).await?;
        Ok(snapshot.filter(|s| s.expires_at > Utc::now()))
    }

    pub async fn resume_point(&self, document_id: &str) -> Result<Option<EmbedResume>, AppError> {
        let Some(snapshot) = self.get(document_id).await? else {
            return Ok(None);
        };

        if snapshot.phase != ProgressPhase::Embedding || snapshot.batches_done == 0 {
            return Ok(None);
        }

        Ok(match (snapshot.dimension, snapshot.model) {
            (Some(dimension), Some(model)) => Some(EmbedResume {
                batches_done: snapshot.batches_done,
                vectors_done: snapshot.vectors_done,
                dimension,
                model,
            }),
            _ => None,
        })
    }

}

/// Client-facing progress of one document.
#[derive(Debug, Clone, serde::Serialize, PartialEq)]
pub struct ProgressView {
    pub stage: &'static str,
    pub percent: f32,
    pub message: Option<String>,
    #[serde(rename = "docHash")]
    pub doc_hash: String,
}

impl ProgressView {
    /// Combines the authoritative document state with the advisory snapshot.
    pub fn from_state(
        doc_hash: &str,
        state: DocumentState,
        last_error: Option<&str>,
        snapshot: Option<&ProgressSnapshot>,
    ) -> Self {
        let (stage, percent, message) = match state {
            DocumentState::Ready => ("complete", 100.0, None),
            DocumentState::Failed => ("failed", 0.0, last_error.map(str::to_string)),
            DocumentState::Pending if snapshot.is_none() => ("not_started", 0.0, None),
            other => {
                let floor = match other {
                    DocumentState::Extracting => 5.0,
                    DocumentState::Chunking => 25.0,
                    DocumentState::Embedding => 35.0,
                    DocumentState::Summarizing => 90.0,
                    _ => 0.0,
                };
                let from_snapshot = snapshot.map_or(0.0, |s| match s.phase {
                    // batch percent covers the embedding share of the whole run
                    ProgressPhase::Embedding => 35.0 + s.percent * 0.5,
                    _ => s.percent,
                });
                (
                    "building",
                    f32::max(floor, from_snapshot).min(99.0),
                    snapshot.and_then(|s| s.message.clone()),
                )
            }
        };

        Self {
            stage,
            percent,
            message,
            doc_hash: doc_hash.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn store(ttl: Duration) -> ProgressStore {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb");
        ProgressStore::new(Arc::new(db), ttl)
    }

    #[tokio::test]
    async fn batches_are_resumable() {
        let progress = store(Duration::from_secs(3600)).await;
        let started_at = Utc::now() - ChronoDuration::seconds(10);

        progress
            .record_batch(
                "h",
                &BatchProgress {
                    batches_done: 2,
                    batches_total: 4,
                    vectors_done: 128,
                    dimension: 256,
                    model: "hashed-fallback-v1".into(),
                    batches_at_start: 0,
                    started_at,
                },
            )
            .await
            .expect("record");

        let snapshot = progress.get("h").await.expect("get").expect("snapshot");
        assert_eq!(snapshot.phase, ProgressPhase::Embedding);
        assert!((snapshot.percent - 50.0).abs() < f32::EPSILON);
        assert!(snapshot.eta_secs.is_some());

        let resume = progress.resume_point("h").await.expect("resume").expect("point");
        assert_eq!(resume.batches_done, 2);
        assert_eq!(resume.vectors_done, 128);
        assert_eq!(resume.dimension, 256);

        progress
            .set_phase("h", ProgressPhase::Packaging, 90.0, None)
            .await
            .expect("phase");
        assert!(progress.resume_point("h").await.expect("resume").is_none());
    }

    #[test]
    fn eta_after_resume_uses_only_batches_from_this_run() {
        let now = Utc::now();
        let resumed = BatchProgress {
            batches_done: 9,
            batches_total: 10,
            vectors_done: 576,
            dimension: 256,
            model: "hashed-fallback-v1".into(),
            batches_at_start: 8,
            started_at: now - ChronoDuration::seconds(10),
        };
        // one batch in 10s leaves one batch, so about 10s more
        assert_eq!(resumed.eta_secs(now), Some(10));

        let fresh = BatchProgress {
            batches_at_start: 0,
            batches_done: 5,
            started_at: now - ChronoDuration::seconds(10),
            ..resumed.clone()
        };
        assert_eq!(fresh.eta_secs(now), Some(10));

        let nothing_yet = BatchProgress {
            batches_done: 8,
            ..resumed
        };
        assert_eq!(nothing_yet.eta_secs(now), None);
    }

    #[tokio::test]
    async fn snapshots_are_kept_per_document() {
        let progress = store(Duration::from_secs(3600)).await;
        progress
            .set_phase("document-a", ProgressPhase::Complete, 100.0, None)
            .await
            .expect("phase a");
        progress
            .set_phase("document-b", ProgressPhase::Extracting, 5.0, None)
            .await
            .expect("phase b");

        let a = progress.get("document-a").await.expect("get").expect("a");
        let b = progress.get("document-b").await.expect("get").expect("b");
        assert_eq!(a.phase, ProgressPhase::Complete);
        assert_eq!(b.phase, ProgressPhase::Extracting);
    }

    #[tokio::test]
    async fn expired_snapshots_read_as_missing() {
        let progress = store(Duration::from_millis(1)).await;
        progress
            .set_phase("h", ProgressPhase::Extracting, 5.0, None)
            .await
            .expect("phase");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(progress.get("h").await.expect("get").is_none());
    }

    #[test]
    fn view_maps_document_states() {
        let view = ProgressView::from_state("h", DocumentState::Pending, None, None);
        assert_eq!(view.stage, "not_started");

        let view = ProgressView::from_state("h", DocumentState::Ready, None, None);
        assert_eq!(view.stage, "complete");
        assert!((view.percent - 100.0).abs() < f32::EPSILON);

        let view = ProgressView::from_state("h", DocumentState::Failed, Some("corrupt pdf"), None);
        assert_eq!(view.stage, "failed");
        assert_eq!(view.message.as_deref(), Some("corrupt pdf"));

        let view = ProgressView::from_state("h", DocumentState::Chunking, None, None);
        assert_eq!(view.stage, "building");
        assert!(view.percent > 0.0 && view.percent < 100.0);

        let json = serde_json::to_value(&view).expect("json");
        assert_eq!(json["docHash"], "h");
    }
}
