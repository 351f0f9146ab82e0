//! Cache-aside session validation.
//!
//! `SessionCache` sits in front of the system-of-record:
//!
//! 1. `validate(token)` hashes the token and reads `{ns}:tok:{hash}`.
//! 2. A usable entry (decodes, current schema, matching hash, not expired)
//!    is returned as a hit.
//! 3. Anything else falls through to the repository. A corrupt entry is
//!    deleted on the way. A live record found there is written back by a
//!    detached task while the caller already has its answer.
//!
//! Cache-layer failures never reach the caller; they are counted, logged,
//! and answered from the repository. Repository failures propagate.

use crate::backend::CacheConnection;
use crate::breaker::CircuitBreaker;
use crate::client::CacheClient;
use crate::config::SessionCacheConfig;
use crate::error::{Error, Result};
use crate::hotkey::HotkeyDetector;
use crate::key::SessionKeys;
use crate::observability::CacheMetrics;
use crate::pool::{ManageConnection, Pool};
use crate::repository::SessionRepository;
use crate::session::{hash_token, SessionRecord};
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;

/// Index lookups issued concurrently while resolving a user's sessions.
const INDEX_LOOKUP_CONCURRENCY: usize = 8;

/// Keys removed per DEL round-trip.
const DELETE_CHUNK: usize = 100;

struct Inner<M: ManageConnection, R> {
    client: CacheClient<M>,
    repo: Arc<R>,
    keys: SessionKeys,
    session_ttl: Duration,
    scan_count: usize,
    max_scan_keys: usize,
    // bumped by every invalidation; background writes started before a bump
    // are dropped or rolled back
    invalidation_epoch: AtomicU64,
    pending_writes: AtomicUsize,
    writes_idle: Notify,
}

/// What became of a write-back of a record read from the repository.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StoreOutcome {
    Stored,
    /// The session expired before it could be cached.
    Expired,
    /// An invalidation landed after the record was read; nothing was kept.
    Superseded,
}

/// Decrements the pending background write count, even if the task panics.
struct WriteGuard<M: ManageConnection, R> {
    inner: Arc<Inner<M, R>>,
}

impl<M: ManageConnection, R> WriteGuard<M, R> {
    fn new(inner: &Arc<Inner<M, R>>) -> Self {
        inner.pending_writes.fetch_add(1, Ordering::SeqCst);
        WriteGuard {
            inner: Arc::clone(inner),
        }
    }
}

impl<M: ManageConnection, R> Drop for WriteGuard<M, R> {
    fn drop(&mut self) {
        if self.inner.pending_writes.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.writes_idle.notify_waiters();
        }
    }
}

/// Cache-aside orchestrator for session validation.
///
/// Cheap to clone; clones share the client, repository and counters.
///
/// # Example
///
/// ```no_run
/// use session_cache::prelude::*;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> session_cache::Result<()> {
///     let config = SessionCacheConfig::from_env();
///     let manager = InMemoryManager::new(InMemoryStore::new());
///     let repo = Arc::new(InMemorySessionRepository::new());
///     let sessions = SessionCache::connect(manager, repo, &config).await?;
///
///     match sessions.validate("opaque-token").await? {
///         Some(session) => println!("user {}", session.user_id),
///         None => println!("invalid session"),
///     }
///     Ok(())
/// }
/// ```
pub struct SessionCache<M: ManageConnection, R> {
    inner: Arc<Inner<M, R>>,
}

impl<M: ManageConnection, R> Clone for SessionCache<M, R> {
    fn clone(&self) -> Self {
        SessionCache {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M, R> SessionCache<M, R>
where
    M: ManageConnection,
    M::Connection: CacheConnection,
    R: SessionRepository,
{
    pub fn new(client: CacheClient<M>, repo: Arc<R>, config: &SessionCacheConfig) -> Self {
        SessionCache {
            inner: Arc::new(Inner {
                client,
                repo,
                keys: SessionKeys::new(config.namespace.clone()),
                session_ttl: config.session_ttl,
                scan_count: config.scan_count,
                max_scan_keys: config.max_scan_keys,
                invalidation_epoch: AtomicU64::new(0),
                pending_writes: AtomicUsize::new(0),
                writes_idle: Notify::new(),
            }),
        }
    }

    /// Wire a complete cache from configuration: pre-filled pool, breaker,
    /// hotkey detector and metrics, with the pool reaper and hotkey sweeper
    /// running in the background until the cache is dropped.
    ///
    /// # Errors
    /// Returns `Error::Config` if `config` fails validation.
    pub async fn connect(manager: M, repo: Arc<R>, config: &SessionCacheConfig) -> Result<Self> {
        config.validate()?;
        let pool = Pool::build(manager, config.pool.clone()).await;
        pool.spawn_reaper();
        let hotkeys = Arc::new(HotkeyDetector::new(config.hotkey.clone()));
        hotkeys.spawn_sweeper();
        let client = CacheClient::new(
            pool,
            Arc::new(CircuitBreaker::new(config.breaker.clone())),
            hotkeys,
            Arc::new(CacheMetrics::new(config.latency_samples)),
        );
        info!(
            "✓ Session cache ready (namespace: {}, ttl: {:?})",
            config.namespace, config.session_ttl
        );
        Ok(SessionCache::new(client, repo, config))
    }

    pub fn client(&self) -> &CacheClient<M> {
        &self.inner.client
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.inner.repo
    }

    pub fn keys(&self) -> &SessionKeys {
        &self.inner.keys
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        self.inner.client.metrics()
    }

    /// Resolve a session token.
    ///
    /// # Returns
    /// - `Ok(Some(record))` - Live session, from cache or the repository
    /// - `Ok(None)` - No live session for this token
    ///
    /// # Errors
    /// Only `Error::Repository`, when the cache could not answer and the
    /// repository query failed.
    pub async fn validate(&self, token: &str) -> Result<Option<SessionRecord>> {
        let token_hash = hash_token(token);
        let metrics = self.metrics();

        match self.read_cached(&token_hash).await {
            Ok(Some(record)) => {
                metrics.record_hit();
                debug!("✓ Session cache HIT for session {}", record.session_id);
                return Ok(Some(record));
            }
            Ok(None) => metrics.record_miss(),
            Err(e) => metrics.record_error("read", &e),
        }

        let epoch = self.invalidation_epoch();
        let found = self
            .inner
            .repo
            .find_by_token_hash(&token_hash)
            .await
            .map_err(|e| {
                error!("✗ Session lookup failed: {}", e);
                match e {
                    Error::Repository(_) => e,
                    other => Error::Repository(other.to_string()),
                }
            })?;

        match found {
            Some(record) if record.token_hash == token_hash && record.is_live_at(SystemTime::now()) => {
                self.spawn_store(record.clone(), epoch);
                Ok(Some(record))
            }
            _ => Ok(None),
        }
    }

    async fn read_cached(&self, token_hash: &str) -> Result<Option<SessionRecord>> {
        let key = self.inner.keys.entry(token_hash);
        let fields = self.inner.client.hget_all(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let checked = SessionRecord::from_fields(fields).and_then(|record| {
            if record.token_hash != token_hash {
                return Err(Error::Integrity("token hash mismatch".to_string()));
            }
            if !record.is_live_at(SystemTime::now()) {
                return Err(Error::Integrity("cached session already expired".to_string()));
            }
            Ok(record)
        });

        match checked {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("⚠ Discarding cache entry {}: {}", key, e);
                if let Err(del) = self.inner.client.delete(&[key]).await {
                    debug!("Could not delete discarded entry: {}", del);
                }
                Ok(None)
            }
        }
    }

    /// Write `record` into the cache: the session index entry, then the
    /// session hash together with its TTL.
    ///
    /// The TTL is the configured session TTL clamped to the session's
    /// remaining lifetime. Returns `Ok(false)` without touching the cache
    /// when the record is already expired.
    pub async fn store(&self, record: &SessionRecord) -> Result<bool> {
        let Some(ttl) = record.cache_ttl_at(self.inner.session_ttl, SystemTime::now()) else {
            debug!("Not caching expired session {}", record.session_id);
            return Ok(false);
        };

        let client = &self.inner.client;
        let entry = self.inner.keys.entry(&record.token_hash);
        let index = self.inner.keys.index(&record.user_id, &record.session_id);
        let fields = record.to_fields()?;

        // index first: an entry must always be reachable by session and user
        client.set(&index, &record.token_hash, Some(ttl)).await?;
        client.hset_all_ex(&entry, &fields, ttl).await?;

        self.metrics().record_set();
        debug!("✓ Cached session {} (TTL: {:?})", record.session_id, ttl);
        Ok(true)
    }

    fn spawn_store(&self, record: SessionRecord, epoch: u64) {
        let this = self.clone();
        let guard = WriteGuard::new(&self.inner);
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = this.store_unless_invalidated(&record, epoch).await {
                this.metrics().record_background_failure(&e);
            }
        });
    }

    /// Current invalidation epoch. Capture it before reading records that
    /// will be written back with [`store_unless_invalidated`](Self::store_unless_invalidated).
    pub(crate) fn invalidation_epoch(&self) -> u64 {
        self.inner.invalidation_epoch.load(Ordering::SeqCst)
    }

    /// Store `record` read at `epoch`, unless an invalidation happened since.
    /// A write that overlapped an invalidation is rolled back.
    pub(crate) async fn store_unless_invalidated(
        &self,
        record: &SessionRecord,
        epoch: u64,
    ) -> Result<StoreOutcome> {
        if self.invalidation_epoch() != epoch {
            debug!("Skipping repopulation of {}: invalidated meanwhile", record.session_id);
            return Ok(StoreOutcome::Superseded);
        }
        if !self.store(record).await? {
            return Ok(StoreOutcome::Expired);
        }
        if self.invalidation_epoch() != epoch {
            let keys = vec![
                self.inner.keys.entry(&record.token_hash),
                self.inner.keys.index(&record.user_id, &record.session_id),
            ];
            self.inner.client.delete(&keys).await?;
            debug!("Rolled back repopulation of {}", record.session_id);
            return Ok(StoreOutcome::Superseded);
        }
        Ok(StoreOutcome::Stored)
    }

    /// Number of detached repopulation writes still running.
    pub fn pending_writes(&self) -> usize {
        self.inner.pending_writes.load(Ordering::SeqCst)
    }

    /// Wait until every detached repopulation write has finished.
    pub async fn flush(&self) {
        loop {
            let idle = self.inner.writes_idle.notified();
            if self.pending_writes() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Remove a session from the cache.
    ///
    /// With the token, the entry is addressed directly. Without it, index
    /// keys are found with a bounded SCAN on the session id. Removing an
    /// absent session is not an error.
    ///
    /// # Returns
    /// Number of cache keys removed.
    ///
    /// # Errors
    /// Cache-layer errors are returned so callers can retry a revocation.
    pub async fn invalidate(&self, session_id: &str, token: Option<&str>) -> Result<u64> {
        self.inner.invalidation_epoch.fetch_add(1, Ordering::SeqCst);
        self.metrics().record_invalidation();

        let result = match token {
            Some(token) => self.invalidate_by_token(session_id, &hash_token(token)).await,
            None => self.invalidate_by_scan(session_id).await,
        };
        match &result {
            Ok(removed) => info!("Invalidated session {} ({} key(s))", session_id, removed),
            Err(e) => self.metrics().record_error("invalidate", e),
        }
        result
    }

    async fn invalidate_by_token(&self, session_id: &str, token_hash: &str) -> Result<u64> {
        let client = &self.inner.client;
        let entry = self.inner.keys.entry(token_hash);
        let mut keys = vec![entry.clone()];
        if let Some(user_id) = client.hget_all(&entry).await?.remove("user_id") {
            keys.push(self.inner.keys.index(&user_id, session_id));
        }
        client.delete(&keys).await
    }

    async fn invalidate_by_scan(&self, session_id: &str) -> Result<u64> {
        let pattern = self.inner.keys.session_pattern(session_id);
        let index_keys: Vec<String> = self
            .scan_index(&pattern)
            .await?
            .into_iter()
            .filter(|key| {
                self.inner
                    .keys
                    .parse_index(key)
                    .is_some_and(|(_, sid)| sid == session_id)
            })
            .collect();
        self.delete_with_entries(index_keys).await
    }

    /// Remove every cached session of `user_id`.
    ///
    /// Cost is proportional to that user's cached sessions: only index keys
    /// under `{ns}:idx:{user_id}:` are scanned.
    ///
    /// # Returns
    /// Number of cache keys removed.
    pub async fn invalidate_all_for_user(&self, user_id: &str) -> Result<u64> {
        self.inner.invalidation_epoch.fetch_add(1, Ordering::SeqCst);
        self.metrics().record_invalidation();

        let result = async {
            let pattern = self.inner.keys.user_pattern(user_id);
            let index_keys: Vec<String> = self
                .scan_index(&pattern)
                .await?
                .into_iter()
                .filter(|key| {
                    self.inner
                        .keys
                        .parse_index(key)
                        .is_some_and(|(owner, _)| owner == user_id)
                })
                .collect();
            self.delete_with_entries(index_keys).await
        }
        .await;

        match &result {
            Ok(removed) => info!("Invalidated all sessions of user {} ({} key(s))", user_id, removed),
            Err(e) => self.metrics().record_error("invalidate_all_for_user", e),
        }
        result
    }

    async fn scan_index(&self, pattern: &str) -> Result<Vec<String>> {
        let (keys, truncated) = self
            .inner
            .client
            .scan_all(pattern, self.inner.scan_count, self.inner.max_scan_keys)
            .await?;
        if truncated {
            warn!(
                "⚠ SCAN {} stopped at {} keys; remaining entries expire by TTL",
                pattern, self.inner.max_scan_keys
            );
        }
        Ok(keys)
    }

    /// Delete index keys together with the entries they point at.
    async fn delete_with_entries(&self, index_keys: Vec<String>) -> Result<u64> {
        if index_keys.is_empty() {
            return Ok(0);
        }
        let client = &self.inner.client;

        let lookups: Vec<Result<Option<String>>> = stream::iter(index_keys.iter())
            .map(|key| client.get(key))
            .buffer_unordered(INDEX_LOOKUP_CONCURRENCY)
            .collect()
            .await;

        let mut doomed = index_keys.clone();
        for lookup in lookups {
            if let Some(token_hash) = lookup? {
                doomed.push(self.inner.keys.entry(&token_hash));
            }
        }

        let mut removed = 0;
        for chunk in doomed.chunks(DELETE_CHUNK) {
            removed += client.delete(chunk).await?;
        }
        Ok(removed)
    }
}

#[cfg(all(test, feature = "inmemory"))]
mod tests {
    use super::*;
    use crate::backend::{InMemoryManager, InMemoryStore};
    use crate::repository::InMemorySessionRepository;
    use std::collections::HashMap;

    type Cache = SessionCache<InMemoryManager, InMemorySessionRepository>;

    fn setup() -> (InMemoryStore, Arc<InMemorySessionRepository>, Cache) {
        let config = SessionCacheConfig::default();
        let store = InMemoryStore::new();
        let pool = Pool::new(InMemoryManager::new(store.clone()), config.pool.clone());
        let client = CacheClient::new(
            pool,
            Arc::new(CircuitBreaker::new(config.breaker.clone())),
            Arc::new(HotkeyDetector::new(config.hotkey.clone())),
            Arc::new(CacheMetrics::new(config.latency_samples)),
        );
        let repo = Arc::new(InMemorySessionRepository::new());
        let cache = SessionCache::new(client, Arc::clone(&repo), &config);
        (store, repo, cache)
    }

    fn session(token: &str, user: &str, sid: &str, lifetime: Duration) -> SessionRecord {
        let now = SystemTime::now();
        SessionRecord {
            session_id: sid.to_string(),
            user_id: user.to_string(),
            token_hash: hash_token(token),
            expires_at: now + lifetime,
            last_activity: now,
            ip_address: Some("127.0.0.1".to_string()),
            user_agent: Some("test".to_string()),
            email: format!("{}@example.com", user),
            display_name: None,
        }
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let (_store, repo, cache) = setup();
        let rec = session("tok", "u1", "s1", Duration::from_secs(600));
        repo.insert(rec.clone());

        assert_eq!(cache.validate("tok").await.unwrap(), Some(rec.clone()));
        cache.flush().await;
        assert_eq!(cache.validate("tok").await.unwrap(), Some(rec));

        assert_eq!(repo.lookups(), 1);
        let counters = cache.metrics().snapshot();
        assert_eq!((counters.hits, counters.misses, counters.sets), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_unknown_token_is_invalid() {
        let (store, _repo, cache) = setup();
        assert_eq!(cache.validate("nope").await.unwrap(), None);
        cache.flush().await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_store_writes_entry_and_index() {
        let (store, _repo, cache) = setup();
        let rec = session("tok", "u1", "s1", Duration::from_secs(30));
        assert!(cache.store(&rec).await.unwrap());

        let entry = cache.keys().entry(&rec.token_hash);
        let index = cache.keys().index("u1", "s1");
        assert!(store.contains(&entry));
        assert!(store.contains(&index));
        assert!(store.ttl(&entry).unwrap() <= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_store_skips_expired_record() {
        let (store, _repo, cache) = setup();
        let mut rec = session("tok", "u1", "s1", Duration::ZERO);
        rec.expires_at = SystemTime::now() - Duration::from_secs(1);
        assert!(!cache.store(&rec).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_tampered_entry_is_deleted_and_reloaded() {
        let (store, repo, cache) = setup();
        let rec = session("tok", "u1", "s1", Duration::from_secs(600));
        repo.insert(rec.clone());

        let mut fields: HashMap<String, String> = rec.to_fields().unwrap().into_iter().collect();
        fields.insert("token_hash".to_string(), hash_token("other"));
        let entry = cache.keys().entry(&rec.token_hash);
        store.insert_hash(&entry, fields, Some(Duration::from_secs(60)));

        assert_eq!(cache.validate("tok").await.unwrap(), Some(rec.clone()));
        assert_eq!(repo.lookups(), 1);

        cache.flush().await;
        let cached = cache.validate("tok").await.unwrap();
        assert_eq!(cached, Some(rec));
        assert_eq!(repo.lookups(), 1);
    }

    #[tokio::test]
    async fn test_foreign_schema_version_is_a_miss() {
        let (store, repo, cache) = setup();
        let rec = session("tok", "u1", "s1", Duration::from_secs(600));
        repo.insert(rec.clone());

        let mut fields: HashMap<String, String> = rec.to_fields().unwrap().into_iter().collect();
        fields.insert("v".to_string(), "0".to_string());
        store.insert_hash(&cache.keys().entry(&rec.token_hash), fields, None);

        assert_eq!(cache.validate("tok").await.unwrap(), Some(rec));
        assert_eq!(cache.metrics().snapshot().misses, 1);
        assert_eq!(cache.metrics().snapshot().errors, 0);
    }

    #[tokio::test]
    async fn test_repository_failure_propagates() {
        let (_store, repo, cache) = setup();
        repo.set_failing(true);
        assert!(matches!(
            cache.validate("tok").await,
            Err(Error::Repository(_))
        ));
    }

    #[tokio::test]
    async fn test_invalidate_with_and_without_token() {
        let (store, _repo, cache) = setup();
        let a = session("tok-a", "u1", "sa", Duration::from_secs(600));
        let b = session("tok-b", "u1", "sb", Duration::from_secs(600));
        cache.store(&a).await.unwrap();
        cache.store(&b).await.unwrap();
        assert_eq!(store.len(), 4);

        assert_eq!(cache.invalidate("sa", Some("tok-a")).await.unwrap(), 2);
        assert_eq!(cache.invalidate("sb", None).await.unwrap(), 2);
        assert!(store.is_empty());

        assert_eq!(cache.invalidate("sb", None).await.unwrap(), 0);
        assert_eq!(cache.metrics().snapshot().invalidations, 3);
    }

    #[tokio::test]
    async fn test_invalidate_by_session_id_matches_whole_id() {
        let (store, _repo, cache) = setup();
        let plain = session("t1", "u1", "s1", Duration::from_secs(600));
        let suffixed = session("t2", "u2", "x:s1", Duration::from_secs(600));
        cache.store(&plain).await.unwrap();
        cache.store(&suffixed).await.unwrap();

        assert_eq!(cache.invalidate("s1", None).await.unwrap(), 2);
        assert!(store.contains(&cache.keys().entry(&suffixed.token_hash)));
        assert!(store.contains(&cache.keys().index("u2", "x:s1")));

        assert_eq!(cache.invalidate("x:s1", None).await.unwrap(), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_all_for_user_spares_others() {
        let (store, _repo, cache) = setup();
        for (tok, user, sid) in [("t1", "u1", "s1"), ("t2", "u1", "s2"), ("t3", "u1:x", "s3"), ("t4", "u2", "s4")] {
            cache
                .store(&session(tok, user, sid, Duration::from_secs(600)))
                .await
                .unwrap();
        }

        assert_eq!(cache.invalidate_all_for_user("u1").await.unwrap(), 4);
        assert_eq!(store.len(), 4);
        assert!(store.contains(&cache.keys().index("u1:x", "s3")));
        assert!(store.contains(&cache.keys().index("u2", "s4")));
    }

    #[tokio::test]
    async fn test_invalidation_beats_inflight_repopulation() {
        let (store, repo, cache) = setup();
        let rec = session("tok", "u1", "s1", Duration::from_secs(600));
        repo.insert(rec);

        // current-thread runtime: the detached write cannot run before the
        // invalidation below
        assert!(cache.validate("tok").await.unwrap().is_some());
        assert_eq!(cache.pending_writes(), 1);
        cache.invalidate("s1", Some("tok")).await.unwrap();
        cache.flush().await;

        assert!(store.is_empty());
    }
}
