//! Lease-based mutual exclusion on top of SurrealDB records.
//!
//! A lock is a `pipeline_lock` record whose id is the lock key. Creating a record with an
//! existing id fails, which makes acquisition a single atomic step. Holders renew their lease
//! from a heartbeat task; a crashed holder simply stops renewing and the lease expires.

use std::{future::Future, sync::Arc, time::Duration};

use chrono::Duration as ChronoDuration;
use surrealdb::sql::Datetime as SurrealDatetime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

/// Consecutive heartbeat failures after which the guard stops renewing.
const MAX_HEARTBEAT_FAILURES: u32 = 3;

stored_object!(LockRecord, "pipeline_lock", {
    token: String,
    #[serde(serialize_with = "serialize_datetime", deserialize_with = "deserialize_datetime")]
    expires_at: DateTime<Utc>
});

#[derive(Clone)]
pub struct LockManager {
    db: Arc<SurrealDbClient>,
}

impl LockManager {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }

    /// Tries to take `key` for `ttl`. `None` means somebody else holds a live lease.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockGuard>, AppError> {
        let Some(token) = self.claim(key, ttl, Utc::now()).await? else {
            debug!(lock_key = key, "lock held elsewhere");
            return Ok(None);
        };

        debug!(lock_key = key, "lock acquired");
        Ok(Some(LockGuard::start(self.clone(), key.to_string(), token, ttl)))
    }

    /// Runs `body` while holding `key`. Returns `Ok(None)` without running it when the lock
    /// is taken.
    pub async fn with_lock<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        body: F,
    ) -> Result<Option<T>, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let Some(guard) = self.acquire(key, ttl).await? else {
            return Ok(None);
        };

        let outcome = body().await;

        if let Err(err) = guard.release().await {
            warn!(lock_key = key, error = %err, "failed to release lock; lease will expire");
        }

        outcome.map(Some)
    }

    /// Deletes the lock only when `token` still owns it.
    pub async fn release(&self, key: &str, token: &str) -> Result<bool, AppError> {
        let mut result = self
            .db
            .client
            .query("DELETE type::thing($table, $key) WHERE token = $lock_token RETURN BEFORE;")
            .bind(("table", LockRecord::table_name()))
            .bind(("key", key.to_string()))
            .bind(("lock_token", token.to_string()))
            .await?;

        let removed: Option<LockRecord> = result.take(0)?;
        Ok(removed.is_some())
    }

    /// Pushes the expiry of a lease forward. `false` means the token no longer owns the key.
    pub async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, AppError> {
        let now = Utc::now();
        let mut result = self
            .db
            .client
            .query(
                "UPDATE type::thing($table, $key)
                 SET expires_at = $expires_at, updated_at = $now
                 WHERE token = $lock_token
                 RETURN AFTER;",
            )
            .bind(("table", LockRecord::table_name()))
            .bind(("key", key.to_string()))
            .bind(("lock_token", token.to_string()))
            .bind(("expires_at", SurrealDatetime::from(expiry(now, ttl))))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let updated: Option<LockRecord> = result.take(0)?;
        Ok(updated.is_some())
    }

    /// Verifies on a throwaway key that a second acquisition is refused while the first is live.
    pub fn spawn_self_check(&self) -> JoinHandle<Result<(), AppError>> {
        let manager = self.clone();
        tokio::spawn(async move {
            let key = format!("lock-self-check:{}", Uuid::new_v4());
            let ttl = Duration::from_secs(5);

            let token = manager.claim(&key, ttl, Utc::now()).await?.ok_or_else(|| {
                AppError::InternalError("lock self-check could not take a fresh key".into())
            })?;

            let second = manager.claim(&key, ttl, Utc::now()).await?;
            let released = manager.release(&key, &token).await?;

            if second.is_some() {
                return Err(AppError::InternalError(
                    "lock store granted the same key twice".into(),
                ));
            }
            if !released {
                return Err(AppError::InternalError(
                    "lock store refused to release a held key".into(),
                ));
            }

            info!("lock manager self-check passed");
            Ok(())
        })
    }

    async fn claim(
        &self,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, AppError> {
        self.db
            .client
            .query("DELETE type::thing($table, $key) WHERE expires_at <= $now;")
            .bind(("table", LockRecord::table_name()))
            .bind(("key", key.to_string()))
            .bind(("now", SurrealDatetime::from(now)))
            .await?
            .check()?;

        let token = Uuid::new_v4().to_string();
        let record = LockRecord {
            id: key.to_string(),
            created_at: now,
            updated_at: now,
            token: token.clone(),
            expires_at: expiry(now, ttl),
        };

        match self.db.store_item(record).await {
            Ok(_) => Ok(Some(token)),
            Err(err) if err.to_string().contains("already exists") => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(60))
}

/// A held lock. Dropping it stops the heartbeat and releases the key in the background.
pub struct LockGuard {
    manager: LockManager,
    key: String,
    token: String,
    cancel: CancellationToken,
    released: bool,
}

impl LockGuard {
    fn start(manager: LockManager, key: String, token: String, ttl: Duration) -> Self {
        let cancel = CancellationToken::new();
        tokio::spawn(heartbeat(
            manager.clone(),
            key.clone(),
            token.clone(),
            ttl,
            cancel.clone(),
        ));

        Self {
            manager,
            key,
            token,
            cancel,
            released: false,
        }
    }

    pub async fn release(mut self) -> Result<bool, AppError> {
        self.cancel.cancel();
        self.released = true;
        self.manager.release(&self.key, &self.token).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        if self.released {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let manager = self.manager.clone();
            let key = std::mem::take(&mut self.key);
            let token = std::mem::take(&mut self.token);
            handle.spawn(async move {
                if let Err(err) = manager.release(&key, &token).await {
                    warn!(lock_key = %key, error = %err, "background lock release failed");
                }
            });
        }
    }
}

async fn heartbeat(
    manager: LockManager,
    key: String,
    token: String,
    ttl: Duration,
    cancel: CancellationToken,
) {
    let interval = (ttl / 2).max(Duration::from_millis(50));
    let mut failures = 0_u32;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }

        match manager.extend(&key, &token, ttl).await {
            Ok(true) => failures = 0,
            Ok(false) => {
                warn!(lock_key = %key, "lease lost to another holder; heartbeat stopped");
                break;
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                warn!(lock_key = %key, error = %err, failures, "lock heartbeat failed");
                if failures >= MAX_HEARTBEAT_FAILURES {
                    warn!(lock_key = %key, "giving up on heartbeat; lease will expire");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    async fn manager() -> LockManager {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb");
        LockManager::new(Arc::new(db))
    }

    #[tokio::test]
    async fn released_key_can_be_claimed_again() {
        let locks = manager().await;
        let token = locks
            .claim("doc-1:embed", Duration::from_secs(30), Utc::now())
            .await
            .expect("claim")
            .expect("first holder");

        assert!(locks.release("doc-1:embed", &token).await.expect("release"));
        assert!(!locks.release("doc-1:embed", &token).await.expect("second release"));

        let next = locks
            .claim("doc-1:embed", Duration::from_secs(30), Utc::now())
            .await
            .expect("claim")
            .expect("key is free after release");
        assert!(locks
            .extend("doc-1:embed", &next, Duration::from_secs(60))
            .await
            .expect("extend"));
    }

    #[tokio::test]
    async fn second_acquire_is_refused_until_release() {
        let locks = manager().await;
        let guard = locks
            .acquire("h:extract", Duration::from_secs(30))
            .await
            .expect("acquire")
            .expect("first holder");

        assert!(locks
            .acquire("h:extract", Duration::from_secs(30))
            .await
            .expect("acquire")
            .is_none());

        assert!(locks
            .acquire("h:chunk", Duration::from_secs(30))
            .await
            .expect("acquire")
            .is_some());

        assert!(guard.release().await.expect("release"));
        assert!(locks
            .acquire("h:extract", Duration::from_secs(30))
            .await
            .expect("acquire")
            .is_some());
    }

    #[tokio::test]
    async fn stale_token_cannot_release_a_new_holder() {
        let locks = manager().await;
        let past = Utc::now() - ChronoDuration::seconds(60);

        let stale = locks
            .claim("k", Duration::from_secs(1), past)
            .await
            .expect("claim")
            .expect("stale holder");

        let fresh = locks
            .claim("k", Duration::from_secs(30), Utc::now())
            .await
            .expect("claim")
            .expect("expired lease is taken over");
        assert_ne!(stale, fresh);

        assert!(!locks.release("k", &stale).await.expect("release"));
        assert!(!locks
            .extend("k", &stale, Duration::from_secs(30))
            .await
            .expect("extend"));
        assert!(locks
            .claim("k", Duration::from_secs(30), Utc::now())
            .await
            .expect("claim")
            .is_none());
        assert!(locks.release("k", &fresh).await.expect("release"));
    }

    #[tokio::test]
    async fn with_lock_runs_one_body_at_a_time() {
        let locks = manager().await;
        let inside = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let ran = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = Arc::clone(&inside);
            let overlaps = Arc::clone(&overlaps);
            let ran = Arc::clone(&ran);
            handles.push(tokio::spawn(async move {
                locks
                    .with_lock("shared", Duration::from_secs(30), || async {
                        if inside.swap(true, Ordering::SeqCst) {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        inside.store(false, Ordering::SeqCst);
                        ran.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, AppError>(())
                    })
                    .await
            }));
        }

        for handle in handles {
            handle.await.expect("join").expect("with_lock");
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert!(ran.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn held_lock_returns_none_instead_of_error() {
        let locks = manager().await;
        let _guard = locks
            .acquire("busy", Duration::from_secs(30))
            .await
            .expect("acquire")
            .expect("holder");

        let outcome = locks
            .with_lock("busy", Duration::from_secs(30), || async { Ok::<_, AppError>(1) })
            .await
            .expect("with_lock");
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn heartbeat_keeps_short_leases_alive() {
        let locks = manager().await;
        let guard = locks
            .acquire("beat", Duration::from_millis(400))
            .await
            .expect("acquire")
            .expect("holder");

        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert!(locks
            .acquire("beat", Duration::from_millis(400))
            .await
            .expect("acquire")
            .is_none());
        assert!(guard.release().await.expect("release"));
    }

    #[tokio::test]
    async fn self_check_passes_on_a_healthy_store() {
        let locks = manager().await;
        locks
            .spawn_self_check()
            .await
            .expect("join")
            .expect("self-check");
    }
}
