//! Cache command surface.
//!
//! Every command follows the same path:
//!
//! ```text
//! hotkey.track(key) -> breaker.call { pool.acquire -> command -> release } -> latency sample
//! ```
//!
//! A connection whose command failed with a transport error is invalidated
//! instead of going back to the pool. Health probes (`ping`, `dbsize`,
//! `info`) bypass the breaker and the hotkey detector so monitoring never
//! skews either.

use crate::backend::CacheConnection;
use crate::breaker::CircuitBreaker;
use crate::error::{Error, Result};
use crate::hotkey::HotkeyDetector;
use crate::observability::CacheMetrics;
use crate::pool::{ManageConnection, Pool, PooledConnection};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Return the lease to the pool, or discard it after a transport failure.
fn settle<M, T>(conn: PooledConnection<M>, result: Result<T>) -> Result<T>
where
    M: ManageConnection,
{
    match &result {
        Err(e) if e.is_connection_error() => conn.invalidate(),
        _ => conn.release(),
    }
    result
}

macro_rules! through_breaker {
    ($client:ident, $op:literal, |$conn:ident| $call:expr) => {{
        let started = Instant::now();
        let result = $client
            .breaker
            .call(|| async {
                let mut $conn = $client.pool.acquire().await?;
                let result = $call.await;
                settle($conn, result)
            })
            .await;
        $client.metrics.record_latency($op, started.elapsed());
        result
    }};
}

/// Redis-style command client over a pooled, breaker-protected connection.
pub struct CacheClient<M: ManageConnection> {
    pool: Pool<M>,
    breaker: Arc<CircuitBreaker>,
    hotkeys: Arc<HotkeyDetector>,
    metrics: Arc<CacheMetrics>,
}

impl<M: ManageConnection> Clone for CacheClient<M> {
    fn clone(&self) -> Self {
        CacheClient {
            pool: self.pool.clone(),
            breaker: Arc::clone(&self.breaker),
            hotkeys: Arc::clone(&self.hotkeys),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<M> CacheClient<M>
where
    M: ManageConnection,
    M::Connection: CacheConnection,
{
    pub fn new(
        pool: Pool<M>,
        breaker: Arc<CircuitBreaker>,
        hotkeys: Arc<HotkeyDetector>,
        metrics: Arc<CacheMetrics>,
    ) -> Self {
        CacheClient {
            pool,
            breaker,
            hotkeys,
            metrics,
        }
    }

    pub fn pool(&self) -> &Pool<M> {
        &self.pool
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn hotkeys(&self) -> &Arc<HotkeyDetector> {
        &self.hotkeys
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.hotkeys.track(key);
        through_breaker!(self, "get", |conn| conn.get(key))
    }

    /// `SET key value`, with `PX ttl` when given.
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.hotkeys.track(key);
        through_breaker!(self, "set", |conn| conn.set(key, value, ttl))
    }

    /// Delete `keys`, returning how many existed.
    pub async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        for key in keys {
            self.hotkeys.track(key);
        }
        through_breaker!(self, "delete", |conn| conn.delete(keys))
    }

    pub async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.hotkeys.track(key);
        through_breaker!(self, "hget_all", |conn| conn.hget_all(key))
    }

    /// Replace the hash at `key` and set its TTL in one atomic step.
    pub async fn hset_all_ex(&self, key: &str, fields: &[(String, String)], ttl: Duration) -> Result<()> {
        self.hotkeys.track(key);
        through_breaker!(self, "hset_all_ex", |conn| conn.hset_all_ex(key, fields, ttl))
    }

    /// Set a TTL on an existing key. `Ok(false)` when the key is absent.
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.hotkeys.track(key);
        through_breaker!(self, "expire", |conn| conn.expire(key, ttl))
    }

    /// One SCAN page.
    pub async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        self.hotkeys.track(pattern);
        through_breaker!(self, "scan", |conn| conn.scan(cursor, pattern, count))
    }

    /// Iterate SCAN to completion, stopping early once `max_keys` matches
    /// were collected. The second value is `true` when the scan was cut short.
    pub async fn scan_all(
        &self,
        pattern: &str,
        count: usize,
        max_keys: usize,
    ) -> Result<(Vec<String>, bool)> {
        let mut cursor = 0;
        let mut keys = Vec::new();
        loop {
            let (next, page) = self.scan(cursor, pattern, count).await?;
            keys.extend(page);
            if keys.len() >= max_keys {
                keys.truncate(max_keys);
                return Ok((keys, next != 0));
            }
            if next == 0 {
                return Ok((keys, false));
            }
            cursor = next;
        }
    }

    async fn probe<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(PooledConnection<M>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.breaker.config().request_timeout;
        let work = async {
            let conn = self.pool.acquire().await?;
            op(conn).await
        };
        tokio::time::timeout(timeout, work)
            .await
            .map_err(|_| Error::Timeout(format!("probe exceeded {:?}", timeout)))?
    }

    /// `PING` outside the breaker.
    pub async fn ping(&self) -> Result<()> {
        self.probe(|mut conn| async move {
            let result = conn.ping().await;
            settle(conn, result)
        })
        .await
    }

    /// `DBSIZE` outside the breaker.
    pub async fn dbsize(&self) -> Result<u64> {
        self.probe(|mut conn| async move {
            let result = conn.dbsize().await;
            settle(conn, result)
        })
        .await
    }

    /// `INFO [section]` outside the breaker.
    pub async fn info(&self, section: Option<&str>) -> Result<String> {
        self.probe(|mut conn| async move {
            let result = conn.info(section).await;
            settle(conn, result)
        })
        .await
    }
}

#[cfg(all(test, feature = "inmemory"))]
mod tests {
    use super::*;
    use crate::backend::{InMemoryManager, InMemoryStore};
    use crate::breaker::CircuitState;
    use crate::config::{BreakerConfig, HotkeyConfig, PoolConfig};

    fn client(breaker: BreakerConfig) -> (InMemoryStore, CacheClient<InMemoryManager>) {
        let store = InMemoryStore::new();
        let pool = Pool::new(InMemoryManager::new(store.clone()), PoolConfig::default());
        let client = CacheClient::new(
            pool,
            Arc::new(CircuitBreaker::new(breaker)),
            Arc::new(HotkeyDetector::new(HotkeyConfig::default())),
            Arc::new(CacheMetrics::default()),
        );
        (store, client)
    }

    #[tokio::test]
    async fn test_commands_round_trip_through_pool() {
        let (store, client) = client(BreakerConfig::default());

        client.set("a", "1", None).await.expect("set");
        assert_eq!(client.get("a").await.expect("get"), Some("1".into()));

        let fields = vec![("f".to_string(), "v".to_string())];
        client
            .hset_all_ex("h", &fields, Duration::from_secs(10))
            .await
            .expect("hset");
        assert_eq!(client.hget_all("h").await.expect("hgetall").len(), 1);
        assert!(store.ttl("h").expect("ttl") <= Duration::from_secs(10));
        assert!(client.expire("a", Duration::from_secs(30)).await.expect("expire"));
        assert!(store.ttl("a").is_some());

        assert_eq!(client.delete(&["a".into(), "h".into()]).await.expect("del"), 2);
        assert!(store.is_empty());
        assert_eq!(client.pool().stats().leased, 0);
    }

    #[tokio::test]
    async fn test_every_command_is_tracked() {
        let (_store, client) = client(BreakerConfig::default());
        for _ in 0..3 {
            client.get("k").await.expect("get");
        }
        assert_eq!(client.hotkeys().count("k"), 3);

        client.ping().await.expect("ping");
        assert_eq!(client.hotkeys().tracked(), 1);
    }

    #[tokio::test]
    async fn test_latency_sampled_per_operation() {
        let (_store, client) = client(BreakerConfig::default());
        client.get("k").await.expect("get");
        client.set("k", "v", None).await.expect("set");

        let latency = client.metrics().latency();
        assert_eq!(latency["get"].count, 1);
        assert_eq!(latency["set"].count, 1);
    }

    #[tokio::test]
    async fn test_scan_all_respects_cap() {
        let (_store, client) = client(BreakerConfig::default());
        for i in 0..30 {
            client.set(&format!("p:{}", i), "x", None).await.expect("set");
        }
        let (keys, truncated) = client.scan_all("p:*", 7, 1000).await.expect("scan");
        assert_eq!(keys.len(), 30);
        assert!(!truncated);

        let (keys, truncated) = client.scan_all("p:*", 7, 10).await.expect("scan");
        assert_eq!(keys.len(), 10);
        assert!(truncated);
    }

    #[tokio::test]
    async fn test_open_breaker_skips_pool() {
        let (_store, client) = client(BreakerConfig::default());
        let stats_before = client.pool().stats();

        let breaker = client.breaker();
        for _ in 0..breaker.config().volume_threshold {
            let _ = breaker
                .call(|| async { Err::<(), _>(Error::Connection("down".into())) })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        assert!(matches!(client.get("k").await, Err(Error::CircuitOpen)));
        assert_eq!(client.pool().stats().created, stats_before.created);
    }

    #[tokio::test]
    async fn test_health_probes() {
        let (_store, client) = client(BreakerConfig::default());
        client.set("x", "1", None).await.expect("set");
        assert!(client.ping().await.is_ok());
        assert_eq!(client.dbsize().await.expect("dbsize"), 1);
        assert!(client.info(Some("server")).await.expect("info").contains("redis_version"));
    }
}
