//! Cache service connections.
//!
//! A backend provides two things: a [`ManageConnection`](crate::pool::ManageConnection)
//! that opens and probes connections for the [`Pool`](crate::pool::Pool), and a
//! [`CacheConnection`] implementing the Redis-style command subset the session
//! cache needs.

use crate::error::Result;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

#[cfg(feature = "inmemory")]
pub mod inmemory;
#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "inmemory")]
pub use inmemory::{InMemoryConnection, InMemoryManager, InMemoryStore};
#[cfg(feature = "redis")]
pub use redis::{RedisConfig, RedisConnection, RedisManager, TlsMode};

/// Command surface of one connection to the cache service.
///
/// **IMPORTANT:** Methods take `&mut self`: a connection is used by exactly one
/// caller at a time while it is leased from the pool.
///
/// All futures are `Send` so commands can run on detached tasks.
pub trait CacheConnection: Send + 'static {
    /// `GET key`.
    ///
    /// # Returns
    /// - `Ok(Some(value))` - Value found
    /// - `Ok(None)` - Key absent or expired
    fn get(&mut self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    /// `SET key value [PX ttl]`.
    fn set(
        &mut self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// `DEL key [key ...]`. Returns how many keys existed.
    fn delete(&mut self, keys: &[String]) -> impl Future<Output = Result<u64>> + Send;

    /// `MULTI; DEL key; HSET key field value [...]; PEXPIRE key ttl; EXEC`.
    ///
    /// Replaces the whole hash and its TTL in one atomic step: other clients
    /// never observe the hash without its TTL or with stale fields.
    fn hset_all_ex(
        &mut self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    /// `HGETALL key`. An absent key yields an empty map.
    fn hget_all(&mut self, key: &str)
        -> impl Future<Output = Result<HashMap<String, String>>> + Send;

    /// `PEXPIRE key ttl`. Returns `false` when the key does not exist.
    fn expire(&mut self, key: &str, ttl: Duration) -> impl Future<Output = Result<bool>> + Send;

    /// One `SCAN cursor MATCH pattern COUNT count` round-trip.
    ///
    /// Returns the next cursor (0 when the iteration is complete) and the
    /// matching keys of this page.
    fn scan(
        &mut self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> impl Future<Output = Result<(u64, Vec<String>)>> + Send;

    /// `PING`.
    fn ping(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// `DBSIZE`.
    fn dbsize(&mut self) -> impl Future<Output = Result<u64>> + Send;

    /// `INFO [section]`.
    fn info(&mut self, section: Option<&str>) -> impl Future<Output = Result<String>> + Send;
}

/// Match `key` against a SCAN-style glob (`*`, `?`, `[...]`, `\` escapes).
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let k: Vec<char> = key.chars().collect();
    glob_at(&p, &k)
}

fn glob_at(p: &[char], k: &[char]) -> bool {
    match p.first() {
        None => k.is_empty(),
        Some('*') => (0..=k.len()).any(|skip| glob_at(&p[1..], &k[skip..])),
        Some('?') => !k.is_empty() && glob_at(&p[1..], &k[1..]),
        Some('[') => {
            let Some(close) = p.iter().skip(1).position(|&c| c == ']').map(|i| i + 1) else {
                return !k.is_empty() && k[0] == '[' && glob_at(&p[1..], &k[1..]);
            };
            let Some(&c) = k.first() else {
                return false;
            };
            class_matches(&p[1..close], c) && glob_at(&p[close + 1..], &k[1..])
        }
        Some('\\') if p.len() > 1 => !k.is_empty() && k[0] == p[1] && glob_at(&p[2..], &k[1..]),
        Some(&c) => !k.is_empty() && k[0] == c && glob_at(&p[1..], &k[1..]),
    }
}

fn class_matches(class: &[char], c: char) -> bool {
    let (negate, class) = match class.first() {
        Some('^') => (true, &class[1..]),
        _ => (false, class),
    };
    let mut i = 0;
    let mut hit = false;
    while i < class.len() {
        if i + 2 < class.len() && class[i + 1] == '-' {
            if class[i] <= c && c <= class[i + 2] {
                hit = true;
            }
            i += 3;
        } else {
            if class[i] == c {
                hit = true;
            }
            i += 1;
        }
    }
    hit != negate
}
