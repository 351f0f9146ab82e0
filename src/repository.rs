//! System-of-record access.
//!
//! The `SessionRepository` trait decouples the session cache from the
//! database that owns sessions. Implementations return only sessions that
//! are non-expired, non-deleted and belong to non-banned users; the cache
//! never re-applies those filters.
//!
//! # Error Handling
//!
//! Return `Err(Error::Repository(..))` for connectivity issues, query
//! timeouts and any other storage failure. It is the only error class
//! [`SessionCache::validate`](crate::SessionCache::validate) propagates.

use crate::error::{Error, Result};
use crate::session::SessionRecord;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

/// Trait for the session system-of-record.
///
/// Futures are `Send` so lookups can run on background tasks.
pub trait SessionRepository: Send + Sync + 'static {
    /// Session by token hash, joined with the user attributes cached
    /// alongside it.
    ///
    /// # Returns
    /// - `Ok(Some(record))` - Live session found
    /// - `Ok(None)` - Unknown, expired, deleted or banned (not an error)
    /// - `Err(e)` - Query failed
    fn find_by_token_hash(
        &self,
        token_hash: &str,
    ) -> impl Future<Output = Result<Option<SessionRecord>>> + Send;

    /// Up to `limit` live sessions, most recently active first.
    fn recently_active(&self, limit: usize)
        -> impl Future<Output = Result<Vec<SessionRecord>>> + Send;
}

// ============================================================================
// In-Memory Repository
// ============================================================================

#[derive(Clone, Debug)]
struct Row {
    record: SessionRecord,
    deleted: bool,
}

/// In-memory system-of-record for tests, demos and local development.
///
/// Applies the same filters a real query would, counts lookups so tests
/// can tell cache hits from fallbacks, and can be switched into a failing
/// mode or given a fixed query latency.
#[derive(Default)]
pub struct InMemorySessionRepository {
    rows: Mutex<HashMap<String, Row>>,
    banned_users: Mutex<Vec<String>>,
    failing: AtomicBool,
    latency_ms: AtomicU64,
    lookups: AtomicU64,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> MutexGuard<'_, HashMap<String, Row>> {
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn banned(&self) -> MutexGuard<'_, Vec<String>> {
        self.banned_users
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or replace a session, keyed by its token hash.
    pub fn insert(&self, record: SessionRecord) {
        self.rows().insert(
            record.token_hash.clone(),
            Row {
                record,
                deleted: false,
            },
        );
    }

    /// Mark a session deleted (logout / revocation).
    pub fn revoke(&self, session_id: &str) -> bool {
        let mut rows = self.rows();
        let mut found = false;
        for row in rows.values_mut().filter(|r| r.record.session_id == session_id) {
            row.deleted = true;
            found = true;
        }
        found
    }

    pub fn ban_user(&self, user_id: &str) {
        self.banned().push(user_id.to_string());
    }

    /// Make every query fail with `Error::Repository` until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every query by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of `find_by_token_hash` calls served so far.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn check_available(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Repository("database unavailable".to_string()));
        }
        Ok(())
    }

    fn is_eligible(&self, row: &Row, now: SystemTime, banned: &[String]) -> bool {
        !row.deleted && row.record.is_live_at(now) && !banned.contains(&row.record.user_id)
    }
}

impl SessionRepository for InMemorySessionRepository {
    async fn find_by_token_hash(&self, token_hash: &str) -> Result<Option<SessionRecord>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.check_available().await?;

        let banned = self.banned().clone();
        let now = SystemTime::now();
        Ok(self
            .rows()
            .get(token_hash)
            .filter(|row| self.is_eligible(row, now, &banned))
            .map(|row| row.record.clone()))
    }

    async fn recently_active(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        self.check_available().await?;

        let banned = self.banned().clone();
        let now = SystemTime::now();
        let mut live: Vec<SessionRecord> = self
            .rows()
            .values()
            .filter(|row| self.is_eligible(row, now, &banned))
            .map(|row| row.record.clone())
            .collect();
        live.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        live.truncate(limit);
        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::hash_token;

    fn record(token: &str, user: &str, age_secs: u64, ttl_secs: i64) -> SessionRecord {
        let now = SystemTime::now();
        let expires_at = if ttl_secs >= 0 {
            now + Duration::from_secs(ttl_secs as u64)
        } else {
            now - Duration::from_secs(ttl_secs.unsigned_abs())
        };
        SessionRecord {
            session_id: format!("sid-{}", token),
            user_id: user.to_string(),
            token_hash: hash_token(token),
            expires_at,
            last_activity: now - Duration::from_secs(age_secs),
            ip_address: None,
            user_agent: None,
            email: format!("{}@example.com", user),
            display_name: None,
        }
    }

    #[tokio::test]
    async fn test_find_applies_filters() {
        let repo = InMemorySessionRepository::new();
        repo.insert(record("live", "u1", 0, 600));
        repo.insert(record("expired", "u1", 0, -5));
        repo.insert(record("banned", "u2", 0, 600));
        repo.insert(record("revoked", "u1", 0, 600));
        repo.ban_user("u2");
        assert!(repo.revoke("sid-revoked"));

        assert!(repo.find_by_token_hash(&hash_token("live")).await.unwrap().is_some());
        for token in ["expired", "banned", "revoked", "unknown"] {
            assert!(repo.find_by_token_hash(&hash_token(token)).await.unwrap().is_none());
        }
        assert_eq!(repo.lookups(), 5);
    }

    #[tokio::test]
    async fn test_recently_active_ordering_and_limit() {
        let repo = InMemorySessionRepository::new();
        repo.insert(record("old", "u1", 300, 600));
        repo.insert(record("new", "u1", 1, 600));
        repo.insert(record("mid", "u1", 60, 600));
        repo.insert(record("gone", "u1", 0, -1));

        let recent = repo.recently_active(2).await.unwrap();
        let ids: Vec<&str> = recent.iter().map(|r| r.session_id.as_str()).collect();
        assert_eq!(ids, vec!["sid-new", "sid-mid"]);
    }

    #[tokio::test]
    async fn test_failing_mode() {
        let repo = InMemorySessionRepository::new();
        repo.set_failing(true);
        assert!(matches!(
            repo.find_by_token_hash("x").await,
            Err(Error::Repository(_))
        ));
        assert!(repo.recently_active(10).await.is_err());
    }
}
