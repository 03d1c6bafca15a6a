use std::time::Duration;

use chrono::Duration as ChronoDuration;
use state_machines::state_machine;
use surrealdb::sql::Datetime as SurrealDatetime;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::job_payload::{JobPayload, Stage};

pub const MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_LEASE_SECS: i64 = 300;

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum JobState {
    #[default]
    Pending,
    Reserved,
    Processing,
    Succeeded,
    Failed,
    DeadLetter,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "Pending",
            JobState::Reserved => "Reserved",
            JobState::Processing => "Processing",
            JobState::Succeeded => "Succeeded",
            JobState::Failed => "Failed",
            JobState::DeadLetter => "DeadLetter",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::DeadLetter)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, Default)]
pub struct JobErrorInfo {
    pub code: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy)]
enum JobTransition {
    Reserve,
    StartProcessing,
    Succeed,
    Fail,
    Defer,
    DeadLetter,
}

impl JobTransition {
    fn as_str(self) -> &'static str {
        match self {
            JobTransition::Reserve => "reserve",
            JobTransition::StartProcessing => "start_processing",
            JobTransition::Succeed => "succeed",
            JobTransition::Fail => "fail",
            JobTransition::Defer => "defer",
            JobTransition::DeadLetter => "deadletter",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: JobLifecycleMachine,
        initial: Pending,
        states: [Pending, Reserved, Processing, Succeeded, Failed, DeadLetter],
        events {
            reserve {
                transition: { from: Pending, to: Reserved }
                transition: { from: Failed, to: Reserved }
            }
            start_processing {
                transition: { from: Reserved, to: Processing }
            }
            succeed {
                transition: { from: Processing, to: Succeeded }
            }
            fail {
                transition: { from: Processing, to: Failed }
            }
            defer {
                transition: { from: Processing, to: Pending }
            }
            deadletter {
                transition: { from: Failed, to: DeadLetter }
            }
        }
    }

    pub(super) fn pending() -> JobLifecycleMachine<(), Pending> {
        JobLifecycleMachine::new(())
    }

    pub(super) fn reserved() -> Option<JobLifecycleMachine<(), Reserved>> {
        pending().reserve().ok()
    }

    pub(super) fn processing() -> Option<JobLifecycleMachine<(), Processing>> {
        reserved()?.start_processing().ok()
    }

    pub(super) fn failed() -> Option<JobLifecycleMachine<(), Failed>> {
        processing()?.fail().ok()
    }
}

fn invalid_transition(state: &JobState, event: JobTransition) -> AppError {
    AppError::Validation(format!(
        "Invalid job transition: {} -> {}",
        state.as_str(),
        event.as_str()
    ))
}

fn compute_next_state(state: &JobState, event: JobTransition) -> Result<JobState, AppError> {
    use lifecycle::{failed, pending, processing, reserved};

    let next = match (state, event) {
        (JobState::Pending, JobTransition::Reserve) => {
            pending().reserve().ok().map(|_| JobState::Reserved)
        }
        (JobState::Failed, JobTransition::Reserve) => failed()
            .and_then(|m| m.reserve().ok())
            .map(|_| JobState::Reserved),
        (JobState::Reserved, JobTransition::StartProcessing) => reserved()
            .and_then(|m| m.start_processing().ok())
            .map(|_| JobState::Processing),
        (JobState::Processing, JobTransition::Succeed) => processing()
            .and_then(|m| m.succeed().ok())
            .map(|_| JobState::Succeeded),
        (JobState::Processing, JobTransition::Fail) => processing()
            .and_then(|m| m.fail().ok())
            .map(|_| JobState::Failed),
        (JobState::Processing, JobTransition::Defer) => processing()
            .and_then(|m| m.defer().ok())
            .map(|_| JobState::Pending),
        (JobState::Failed, JobTransition::DeadLetter) => failed()
            .and_then(|m| m.deadletter().ok())
            .map(|_| JobState::DeadLetter),
        _ => None,
    };

    next.ok_or_else(|| invalid_transition(state, event))
}

fn after(now: chrono::DateTime<chrono::Utc>, delay: Duration) -> chrono::DateTime<chrono::Utc> {
    now + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(30))
}

/// Field values a job carries after it leaves its worker.
struct Settlement {
    event: JobTransition,
    attempts: u32,
    scheduled_at: chrono::DateTime<chrono::Utc>,
    error_code: Option<String>,
    error_message: Option<String>,
    last_error_at: Option<chrono::DateTime<chrono::Utc>>,
}

const SETTLE_QUERY: &str = r#"
    UPDATE type::thing($table, $id)
    SET state = $next_state,
        attempts = $attempts,
        scheduled_at = $scheduled_at,
        locked_at = NONE,
        worker_id = NONE,
        error_code = $error_code,
        error_message = $error_message,
        last_error_at = $last_error_at,
        updated_at = $now
    WHERE state = $current_state
      AND ($owner = NONE OR worker_id = $owner)
    RETURN *;
"#;

stored_object!(PipelineJob, "pipeline_job", {
    stage: Stage,
    payload: JobPayload,
    #[serde(default)]
    document_id: Option<String>,
    state: JobState,
    attempts: u32,
    max_attempts: u32,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime")]
    scheduled_at: chrono::DateTime<chrono::Utc>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    locked_at: Option<chrono::DateTime<chrono::Utc>>,
    lease_duration_secs: i64,
    worker_id: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    last_error_at: Option<chrono::DateTime<chrono::Utc>>,
    priority: i32
});

impl PipelineJob {
    pub fn new(payload: JobPayload) -> Self {
        let now = chrono::Utc::now();

        Self {
            id: Uuid::new_v4().to_string(),
            stage: payload.stage(),
            priority: payload.priority(),
            document_id: payload.document().map(|job| job.document_id.clone()),
            payload,
            state: JobState::Pending,
            attempts: 0,
            max_attempts: MAX_ATTEMPTS,
            scheduled_at: now,
            locked_at: None,
            lease_duration_secs: DEFAULT_LEASE_SECS,
            worker_id: None,
            error_code: None,
            error_message: None,
            last_error_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.lease_duration_secs.max(0)).unwrap_or(0))
    }

    pub async fn enqueue(
        payload: JobPayload,
        db: &SurrealDbClient,
    ) -> Result<PipelineJob, AppError> {
        let job = Self::new(payload);
        db.store_item(job.clone()).await?;
        Ok(job)
    }

    /// Reserves the most urgent ready job of `stage` whose lease is free. Claiming a pending or
    /// failed job spends one attempt; reclaiming an expired lease does not.
    pub async fn claim_next_ready(
        db: &SurrealDbClient,
        stage: Stage,
        worker_id: &str,
        now: chrono::DateTime<chrono::Utc>,
        lease_duration: Duration,
    ) -> Result<Option<PipelineJob>, AppError> {
        debug_assert!(compute_next_state(&JobState::Pending, JobTransition::Reserve).is_ok());
        debug_assert!(compute_next_state(&JobState::Failed, JobTransition::Reserve).is_ok());

        // SET assigns left to right, so attempts must read the state before it is overwritten
        const CLAIM_QUERY: &str = r#"
            UPDATE (
                SELECT * FROM type::table($table)
                WHERE stage = $stage
                  AND state IN $candidate_states
                  AND scheduled_at <= $now
                  AND (
                        attempts < max_attempts
                        OR state IN $sticky_states
                  )
                  AND (
                        locked_at = NONE
                        OR time::unix($now) - time::unix(locked_at) >= lease_duration_secs
                  )
                ORDER BY priority DESC, scheduled_at ASC, created_at ASC
                LIMIT 1
            )
            SET attempts = if state IN $increment_states THEN
                    if attempts + 1 > max_attempts THEN max_attempts ELSE attempts + 1 END
                ELSE
                    attempts
                END,
                state = $reserved_state,
                locked_at = $now,
                worker_id = $worker_id,
                lease_duration_secs = $lease_secs,
                updated_at = $now
            RETURN *;
        "#;

        let mut result = db
            .client
            .query(CLAIM_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("stage", stage.as_str()))
            .bind((
                "candidate_states",
                vec![
                    JobState::Pending.as_str(),
                    JobState::Failed.as_str(),
                    JobState::Reserved.as_str(),
                    JobState::Processing.as_str(),
                ],
            ))
            .bind((
                "sticky_states",
                vec![JobState::Reserved.as_str(), JobState::Processing.as_str()],
            ))
            .bind((
                "increment_states",
                vec![JobState::Pending.as_str(), JobState::Failed.as_str()],
            ))
            .bind(("reserved_state", JobState::Reserved.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .bind(("worker_id", worker_id.to_string()))
            .bind((
                "lease_secs",
                i64::try_from(lease_duration.as_secs()).unwrap_or(DEFAULT_LEASE_SECS),
            ))
            .await?;

        let job: Option<PipelineJob> = result.take(0)?;
        Ok(job)
    }

    pub async fn mark_processing(&self, db: &SurrealDbClient) -> Result<PipelineJob, AppError> {
        compute_next_state(&self.state, JobTransition::StartProcessing)?;

        let now = chrono::Utc::now();
        let updated: Option<PipelineJob> = db
            .client
            .query(
                "UPDATE type::thing($table, $id)
                 SET state = $processing, locked_at = $now, updated_at = $now
                 WHERE state = $reserved AND worker_id = $worker_id
                 RETURN *;",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("processing", JobState::Processing.as_str()))
            .bind(("reserved", JobState::Reserved.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .bind(("worker_id", self.worker_id.clone().unwrap_or_default()))
            .await?
            .take(0)?;

        updated.ok_or_else(|| invalid_transition(&self.state, JobTransition::StartProcessing))
    }

    /// Moves the job out of its current state and releases its lease. Only the worker holding
    /// the lease may settle a processing job.
    async fn settle(
        &self,
        settlement: Settlement,
        db: &SurrealDbClient,
    ) -> Result<PipelineJob, AppError> {
        let next = compute_next_state(&self.state, settlement.event)?;
        let owner = (self.state == JobState::Processing)
            .then(|| self.worker_id.clone().unwrap_or_default());

        let updated: Option<PipelineJob> = db
            .client
            .query(SETTLE_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("current_state", self.state.as_str()))
            .bind(("next_state", next.as_str()))
            .bind(("owner", owner))
            .bind(("attempts", settlement.attempts))
            .bind(("scheduled_at", SurrealDatetime::from(settlement.scheduled_at)))
            .bind(("error_code", settlement.error_code))
            .bind(("error_message", settlement.error_message))
            .bind((
                "last_error_at",
                settlement.last_error_at.map(SurrealDatetime::from),
            ))
            .bind(("now", SurrealDatetime::from(chrono::Utc::now())))
            .await?
            .take(0)?;

        updated.ok_or_else(|| invalid_transition(&self.state, settlement.event))
    }

    pub async fn mark_succeeded(&self, db: &SurrealDbClient) -> Result<PipelineJob, AppError> {
        let now = chrono::Utc::now();
        self.settle(
            Settlement {
                event: JobTransition::Succeed,
                attempts: self.attempts,
                scheduled_at: now,
                error_code: None,
                error_message: None,
                last_error_at: None,
            },
            db,
        )
        .await
    }

    pub async fn mark_failed(
        &self,
        error: JobErrorInfo,
        retry_delay: Duration,
        db: &SurrealDbClient,
    ) -> Result<PipelineJob, AppError> {
        let now = chrono::Utc::now();
        self.settle(
            Settlement {
                event: JobTransition::Fail,
                attempts: self.attempts,
                scheduled_at: after(now, retry_delay),
                error_code: error.code,
                error_message: Some(error.message),
                last_error_at: Some(now),
            },
            db,
        )
        .await
    }

    /// Puts a job that could not start back in the queue after `delay`. The attempt spent on
    /// the claim is given back and earlier error details are kept.
    pub async fn defer(
        &self,
        delay: Duration,
        db: &SurrealDbClient,
    ) -> Result<PipelineJob, AppError> {
        self.settle(
            Settlement {
                event: JobTransition::Defer,
                attempts: self.attempts.saturating_sub(1),
                scheduled_at: after(chrono::Utc::now(), delay),
                error_code: self.error_code.clone(),
                error_message: self.error_message.clone(),
                last_error_at: self.last_error_at,
            },
            db,
        )
        .await
    }

    pub async fn mark_dead_letter(
        &self,
        error: JobErrorInfo,
        db: &SurrealDbClient,
    ) -> Result<PipelineJob, AppError> {
        let now = chrono::Utc::now();
        self.settle(
            Settlement {
                event: JobTransition::DeadLetter,
                attempts: self.attempts,
                scheduled_at: now,
                error_code: error.code,
                error_message: Some(error.message),
                last_error_at: Some(now),
            },
            db,
        )
        .await
    }

    /// Jobs for one document that are still queued or running.
    pub async fn active_for_document(
        document_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<PipelineJob>, AppError> {
        let jobs: Vec<PipelineJob> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE document_id = $document_id AND state IN $active_states
                 ORDER BY scheduled_at ASC, created_at ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("document_id", document_id.to_string()))
            .bind((
                "active_states",
                vec![
                    JobState::Pending.as_str(),
                    JobState::Reserved.as_str(),
                    JobState::Processing.as_str(),
                    JobState::Failed.as_str(),
                ],
            ))
            .await?
            .take(0)?;

        Ok(jobs)
    }
}
