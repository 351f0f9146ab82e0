//! Shared fixtures for integration tests.
//!
//! `FlakyManager` wraps the in-memory backend with an outage switch and an
//! injectable per-command delay, so tests can take the cache service down
//! (connect refused, probes failing, commands erroring) and bring it back.

#![allow(dead_code)]

use session_cache::backend::{CacheConnection, InMemoryConnection, InMemoryManager, InMemoryStore};
use session_cache::prelude::*;
use session_cache::hash_token;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Outage and latency controls shared by a manager and its connections.
#[derive(Default)]
pub struct Faults {
    down: AtomicBool,
    delay_ms: AtomicU64,
    commands: AtomicU64,
}

impl Faults {
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Commands that reached a connection (including failed ones).
    pub fn commands(&self) -> u64 {
        self.commands.load(Ordering::SeqCst)
    }

    async fn check(&self) -> Result<()> {
        self.commands.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(Error::Connection("connection reset by peer".to_string()));
        }
        Ok(())
    }
}

pub struct FlakyManager {
    inner: InMemoryManager,
    faults: Arc<Faults>,
}

impl FlakyManager {
    pub fn new(store: InMemoryStore, faults: Arc<Faults>) -> Self {
        FlakyManager {
            inner: InMemoryManager::new(store),
            faults,
        }
    }
}

impl ManageConnection for FlakyManager {
    type Connection = FlakyConnection;

    async fn connect(&self) -> Result<FlakyConnection> {
        if self.faults.down.load(Ordering::SeqCst) {
            return Err(Error::Connection("connection refused".to_string()));
        }
        Ok(FlakyConnection {
            inner: self.inner.connect().await?,
            faults: Arc::clone(&self.faults),
        })
    }

    async fn is_valid(&self, _conn: &mut FlakyConnection) -> bool {
        !self.faults.down.load(Ordering::SeqCst)
    }
}

pub struct FlakyConnection {
    inner: InMemoryConnection,
    faults: Arc<Faults>,
}

impl CacheConnection for FlakyConnection {
    async fn get(&mut self, key: &str) -> Result<Option<String>> {
        self.faults.check().await?;
        self.inner.get(key).await
    }

    async fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.faults.check().await?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&mut self, keys: &[String]) -> Result<u64> {
        self.faults.check().await?;
        self.inner.delete(keys).await
    }

    async fn hset_all_ex(
        &mut self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<()> {
        self.faults.check().await?;
        self.inner.hset_all_ex(key, fields, ttl).await
    }

    async fn hget_all(&mut self, key: &str) -> Result<HashMap<String, String>> {
        self.faults.check().await?;
        self.inner.hget_all(key).await
    }

    async fn expire(&mut self, key: &str, ttl: Duration) -> Result<bool> {
        self.faults.check().await?;
        self.inner.expire(key, ttl).await
    }

    async fn scan(&mut self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        self.faults.check().await?;
        self.inner.scan(cursor, pattern, count).await
    }

    async fn ping(&mut self) -> Result<()> {
        self.faults.check().await?;
        self.inner.ping().await
    }

    async fn dbsize(&mut self) -> Result<u64> {
        self.faults.check().await?;
        self.inner.dbsize().await
    }

    async fn info(&mut self, section: Option<&str>) -> Result<String> {
        self.faults.check().await?;
        self.inner.info(section).await
    }
}

/// A fully wired cache over a flaky in-memory service.
pub struct Harness {
    pub store: InMemoryStore,
    pub faults: Arc<Faults>,
    pub repo: Arc<InMemorySessionRepository>,
    pub cache: SessionCache<FlakyManager, InMemorySessionRepository>,
}

impl Harness {
    pub async fn new(config: SessionCacheConfig) -> Self {
        let store = InMemoryStore::new();
        let faults = Arc::new(Faults::default());
        let repo = Arc::new(InMemorySessionRepository::new());
        let manager = FlakyManager::new(store.clone(), Arc::clone(&faults));
        let cache = SessionCache::connect(manager, Arc::clone(&repo), &config)
            .await
            .expect("valid config");
        Harness {
            store,
            faults,
            repo,
            cache,
        }
    }

    pub async fn with_defaults() -> Self {
        Self::new(test_config()).await
    }
}

/// Defaults with small pools and short timeouts.
pub fn test_config() -> SessionCacheConfig {
    let mut config = SessionCacheConfig::default();
    config.pool.min_size = 1;
    config.pool.max_size = 4;
    config.pool.acquire_timeout = Duration::from_millis(200);
    config.breaker.request_timeout = Duration::from_millis(200);
    config
}

pub fn session(token: &str, user: &str, session_id: &str, lifetime: Duration) -> SessionRecord {
    let now = SystemTime::now();
    SessionRecord {
        session_id: session_id.to_string(),
        user_id: user.to_string(),
        token_hash: hash_token(token),
        expires_at: now + lifetime,
        last_activity: now,
        ip_address: Some("203.0.113.7".to_string()),
        user_agent: Some("integration-test".to_string()),
        email: format!("{}@example.com", user),
        display_name: Some(user.to_uppercase()),
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
