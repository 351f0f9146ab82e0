//! In-memory cache service (default, thread-safe, async).
//!
//! Uses DashMap for concurrent access with per-key sharding and mimics the
//! Redis command subset the session cache uses: string and hash values,
//! millisecond TTLs, glob SCAN, PING, DBSIZE and INFO. Expired entries are
//! dropped lazily on access.
//!
//! Used by default for development and tests; every pooled connection is a
//! handle onto the same shared [`InMemoryStore`].

use super::{glob_match, CacheConnection};
use crate::error::{Error, Result};
use crate::pool::ManageConnection;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone, Debug)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
}

/// In-memory entry with optional expiration.
#[derive(Clone, Debug)]
struct StoreEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl StoreEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() >= exp)
    }
}

fn wrong_type(key: &str) -> Error {
    Error::Backend(format!(
        "WRONGTYPE Operation against a key holding the wrong kind of value: {}",
        key
    ))
}

/// Shared key space behind all in-memory connections.
///
/// # Example
///
/// ```no_run
/// use session_cache::backend::{InMemoryStore, CacheConnection, InMemoryManager};
/// use session_cache::pool::ManageConnection;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = InMemoryStore::new();
///     let manager = InMemoryManager::new(store.clone());
///     let mut conn = manager.connect().await?;
///
///     conn.set("greeting", "hello", None).await?;
///     assert_eq!(store.len(), 1);
///     Ok(())
/// }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryStore {
    map: Arc<DashMap<String, StoreEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore {
            map: Arc::new(DashMap::new()),
        }
    }

    /// Number of live (non-expired) keys.
    pub fn len(&self) -> usize {
        self.map.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a live key exists.
    pub fn contains(&self, key: &str) -> bool {
        self.map.get(key).is_some_and(|e| !e.is_expired())
    }

    /// Remaining TTL of a live key, `None` if absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let entry = self.map.get(key)?;
        if entry.is_expired() {
            return None;
        }
        entry
            .expires_at
            .map(|exp| exp.saturating_duration_since(Instant::now()))
    }

    /// All live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .map
            .iter()
            .filter(|e| !e.is_expired())
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn clear(&self) {
        self.map.clear();
        warn!("⚠ InMemory CLEAR executed - all cache cleared!");
    }

    /// Write a raw hash, bypassing any session encoding. Test helper for
    /// planting corrupt entries.
    pub fn insert_hash(&self, key: &str, fields: HashMap<String, String>, ttl: Option<Duration>) {
        self.map.insert(
            key.to_string(),
            StoreEntry {
                value: Value::Hash(fields),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
    }

    fn live<T>(&self, key: &str, read: impl FnOnce(&StoreEntry) -> T) -> Option<T> {
        match self.map.get(key) {
            Some(entry) if !entry.is_expired() => Some(read(&entry)),
            Some(entry) => {
                drop(entry);
                self.map.remove_if(key, |_, e| e.is_expired());
                None
            }
            None => None,
        }
    }

    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.live(key, |e| e.value.clone()) {
            Some(Value::Str(s)) => Ok(Some(s)),
            Some(Value::Hash(_)) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        self.map.insert(
            key.to_string(),
            StoreEntry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
    }

    fn delete(&self, keys: &[String]) -> u64 {
        keys.iter()
            .filter_map(|k| self.map.remove(k))
            .filter(|(_, e)| !e.is_expired())
            .count() as u64
    }

    fn hset_all_ex(&self, key: &str, fields: &[(String, String)], ttl: Duration) {
        self.map.insert(
            key.to_string(),
            StoreEntry {
                value: Value::Hash(fields.iter().cloned().collect()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
    }

    fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        match self.live(key, |e| e.value.clone()) {
            Some(Value::Hash(map)) => Ok(map),
            Some(Value::Str(_)) => Err(wrong_type(key)),
            None => Ok(HashMap::new()),
        }
    }

    fn expire(&self, key: &str, ttl: Duration) -> bool {
        match self.map.get_mut(key) {
            Some(mut entry) if !entry.is_expired() => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            _ => false,
        }
    }

    // Cursor is an offset into the sorted key list, so keys deleted between
    // pages can shift later keys past the cursor. Callers collect a full scan
    // before deleting.
    fn scan(&self, cursor: u64, pattern: &str, count: usize) -> (u64, Vec<String>) {
        let keys = self.keys();
        let start = (cursor as usize).min(keys.len());
        let end = (start + count.max(1)).min(keys.len());
        let page = keys[start..end]
            .iter()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        let next = if end >= keys.len() { 0 } else { end as u64 };
        (next, page)
    }
}

/// Opens connections onto a shared [`InMemoryStore`].
pub struct InMemoryManager {
    store: InMemoryStore,
    next_id: AtomicU64,
}

impl InMemoryManager {
    pub fn new(store: InMemoryStore) -> Self {
        InMemoryManager {
            store,
            next_id: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }
}

impl ManageConnection for InMemoryManager {
    type Connection = InMemoryConnection;

    async fn connect(&self) -> Result<InMemoryConnection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("✓ InMemory connection {} opened", id);
        Ok(InMemoryConnection {
            store: self.store.clone(),
            id,
        })
    }

    async fn is_valid(&self, conn: &mut InMemoryConnection) -> bool {
        conn.ping().await.is_ok()
    }
}

/// A handle onto the shared in-memory store.
pub struct InMemoryConnection {
    store: InMemoryStore,
    id: u64,
}

impl InMemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl CacheConnection for InMemoryConnection {
    async fn get(&mut self, key: &str) -> Result<Option<String>> {
        let value = self.store.get(key)?;
        debug!(
            "✓ InMemory GET {} -> {}",
            key,
            if value.is_some() { "HIT" } else { "MISS" }
        );
        Ok(value)
    }

    async fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.store.set(key, value, ttl);
        debug!("✓ InMemory SET {} (TTL: {:?})", key, ttl);
        Ok(())
    }

    async fn delete(&mut self, keys: &[String]) -> Result<u64> {
        let removed = self.store.delete(keys);
        debug!("✓ InMemory DEL {} key(s), {} existed", keys.len(), removed);
        Ok(removed)
    }

    async fn hset_all_ex(
        &mut self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<()> {
        self.store.hset_all_ex(key, fields, ttl);
        debug!("✓ InMemory HSET {} ({} fields, TTL: {:?})", key, fields.len(), ttl);
        Ok(())
    }

    async fn hget_all(&mut self, key: &str) -> Result<HashMap<String, String>> {
        self.store.hget_all(key)
    }

    async fn expire(&mut self, key: &str, ttl: Duration) -> Result<bool> {
        Ok(self.store.expire(key, ttl))
    }

    async fn scan(&mut self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        Ok(self.store.scan(cursor, pattern, count))
    }

    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    async fn dbsize(&mut self) -> Result<u64> {
        Ok(self.store.len() as u64)
    }

    async fn info(&mut self, _section: Option<&str>) -> Result<String> {
        Ok(format!(
            "# Server\r\nredis_version:inmemory-{}\r\n# Keyspace\r\ndb0:keys={}\r\n",
            crate::VERSION,
            self.store.len()
        ))
    }
}
