//! Redis cache service connections.

use super::CacheConnection;
use crate::error::{Error, Result};
use crate::pool::ManageConnection;
use redis::aio::MultiplexedConnection;
use std::collections::HashMap;
use std::time::Duration;

/// Transport security for the Redis connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TlsMode {
    /// Plain TCP.
    #[default]
    Disabled,
    /// TLS with certificate verification.
    Verified,
    /// TLS without certificate verification. Refused in production.
    InsecureSkipVerify,
}

impl TlsMode {
    /// Parse `off`/`on`/`insecure` (plus `false`/`true`/`verified` aliases).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "off" | "false" | "disabled" | "0" => Some(TlsMode::Disabled),
            "on" | "true" | "verified" | "1" => Some(TlsMode::Verified),
            "insecure" | "skip-verify" => Some(TlsMode::InsecureSkipVerify),
            _ => None,
        }
    }
}

/// Configuration for Redis connections.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: u32,
    pub connection_timeout: Duration,
    pub tls: TlsMode,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            host: "localhost".to_string(),
            port: 6379,
            username: None,
            password: None,
            database: 0,
            connection_timeout: Duration::from_secs(5),
            tls: TlsMode::Disabled,
        }
    }
}

impl RedisConfig {
    /// Read `REDIS_HOST`, `REDIS_PORT`, `REDIS_USERNAME`, `REDIS_PASSWORD`,
    /// `REDIS_DB`, `REDIS_CONNECT_TIMEOUT_MS` and `REDIS_TLS`, falling back
    /// to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = RedisConfig::default();
        if let Some(host) = lookup("REDIS_HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("REDIS_PORT").and_then(|p| p.parse().ok()) {
            config.port = port;
        }
        config.username = lookup("REDIS_USERNAME");
        config.password = lookup("REDIS_PASSWORD");
        if let Some(db) = lookup("REDIS_DB").and_then(|d| d.parse().ok()) {
            config.database = db;
        }
        if let Some(ms) = lookup("REDIS_CONNECT_TIMEOUT_MS").and_then(|m| m.parse().ok()) {
            config.connection_timeout = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup("REDIS_TLS") {
            match TlsMode::parse(&raw) {
                Some(mode) => config.tls = mode,
                None => warn!("⚠ Ignoring REDIS_TLS={:?}: expected on, off or insecure", raw),
            }
        }
        config
    }

    /// Reject settings that are unsafe for the given environment.
    pub fn validate(&self, production: bool) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("redis host must not be empty".to_string()));
        }
        if production && self.tls == TlsMode::InsecureSkipVerify {
            return Err(Error::Config(
                "TLS certificate verification cannot be disabled in production".to_string(),
            ));
        }
        Ok(())
    }

    /// Build Redis connection string.
    pub fn connection_string(&self) -> String {
        let scheme = match self.tls {
            TlsMode::Disabled => "redis",
            TlsMode::Verified | TlsMode::InsecureSkipVerify => "rediss",
        };
        let auth = match (&self.username, &self.password) {
            (Some(user), Some(password)) => format!("{}:{}@", user, password),
            (None, Some(password)) => format!("default:{}@", password),
            _ => String::new(),
        };
        let fragment = if self.tls == TlsMode::InsecureSkipVerify {
            "#insecure"
        } else {
            ""
        };
        format!(
            "{}://{}{}:{}/{}{}",
            scheme, auth, self.host, self.port, self.database, fragment
        )
    }
}

/// Opens multiplexed Redis connections for the [`Pool`](crate::pool::Pool).
///
/// # Example
///
/// ```no_run
/// # use session_cache::backend::{RedisConfig, RedisManager};
/// # use session_cache::pool::Pool;
/// # use session_cache::config::PoolConfig;
/// # async fn example() -> session_cache::error::Result<()> {
/// let manager = RedisManager::new(RedisConfig::default())?;
/// let pool = Pool::build(manager, PoolConfig::default()).await;
/// let conn = pool.acquire().await?;
/// # Ok(())
/// # }
/// ```
pub struct RedisManager {
    client: redis::Client,
    connect_timeout: Duration,
}

impl RedisManager {
    /// # Errors
    /// Returns `Error::Config` if the connection URL is rejected.
    pub fn new(config: RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.connection_string())
            .map_err(|e| Error::Config(format!("Invalid Redis configuration: {}", e)))?;
        info!(
            "✓ Redis manager initialized: {}:{} (tls: {:?})",
            config.host, config.port, config.tls
        );
        Ok(RedisManager {
            client,
            connect_timeout: config.connection_timeout,
        })
    }

    /// Create from connection string directly.
    pub fn from_connection_string(conn_str: &str) -> Result<Self> {
        let client = redis::Client::open(conn_str)
            .map_err(|e| Error::Config(format!("Invalid Redis URL: {}", e)))?;
        Ok(RedisManager {
            client,
            connect_timeout: RedisConfig::default().connection_timeout,
        })
    }
}

impl ManageConnection for RedisManager {
    type Connection = RedisConnection;

    async fn connect(&self) -> Result<RedisConnection> {
        let conn = tokio::time::timeout(
            self.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| {
            Error::Connection(format!(
                "Redis connect timed out after {:?}",
                self.connect_timeout
            ))
        })??;
        debug!("✓ Redis connection opened");
        Ok(RedisConnection { conn })
    }

    async fn is_valid(&self, conn: &mut RedisConnection) -> bool {
        conn.ping().await.is_ok()
    }
}

/// A single Redis connection leased from the pool.
pub struct RedisConnection {
    conn: MultiplexedConnection,
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

impl CacheConnection for RedisConnection {
    async fn get(&mut self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn)
            .await?;
        debug!(
            "✓ Redis GET {} -> {}",
            key,
            if value.is_some() { "HIT" } else { "MISS" }
        );
        Ok(value)
    }

    async fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        cmd.query_async::<()>(&mut self.conn).await?;
        debug!("✓ Redis SET {} (TTL: {:?})", key, ttl);
        Ok(())
    }

    async fn delete(&mut self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let removed: u64 = redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut self.conn)
            .await?;
        debug!("✓ Redis DEL {} key(s), {} existed", keys.len(), removed);
        Ok(removed)
    }

    async fn hset_all_ex(
        &mut self,
        key: &str,
        fields: &[(String, String)],
        ttl: Duration,
    ) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("DEL").arg(key).ignore();
        if !fields.is_empty() {
            let hset = pipe.cmd("HSET").arg(key);
            for (field, value) in fields {
                hset.arg(field).arg(value);
            }
            hset.ignore();
            pipe.cmd("PEXPIRE").arg(key).arg(ttl_millis(ttl)).ignore();
        }
        pipe.query_async::<()>(&mut self.conn).await?;
        debug!("✓ Redis HSET {} ({} fields, TTL: {:?})", key, fields.len(), ttl);
        Ok(())
    }

    async fn hget_all(&mut self, key: &str) -> Result<HashMap<String, String>> {
        Ok(redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut self.conn)
            .await?)
    }

    async fn expire(&mut self, key: &str, ttl: Duration) -> Result<bool> {
        Ok(redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut self.conn)
            .await?)
    }

    async fn scan(&mut self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        Ok(redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut self.conn)
            .await?)
    }

    async fn ping(&mut self) -> Result<()> {
        let pong: String = redis::cmd("PING").query_async(&mut self.conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(Error::Backend(format!("unexpected PING reply: {}", pong)))
        }
    }

    async fn dbsize(&mut self) -> Result<u64> {
        Ok(redis::cmd("DBSIZE").query_async(&mut self.conn).await?)
    }

    async fn info(&mut self, section: Option<&str>) -> Result<String> {
        let mut cmd = redis::cmd("INFO");
        if let Some(section) = section {
            cmd.arg(section);
        }
        Ok(cmd.query_async(&mut self.conn).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_string_plain() {
        let config = RedisConfig::default();
        assert_eq!(config.connection_string(), "redis://localhost:6379/0");
    }

    #[test]
    fn test_connection_string_with_auth_and_tls() {
        let config = RedisConfig {
            password: Some("pw".to_string()),
            tls: TlsMode::Verified,
            ..Default::default()
        };
        assert_eq!(
            config.connection_string(),
            "rediss://default:pw@localhost:6379/0"
        );

        let config = RedisConfig {
            username: Some("app".to_string()),
            password: Some("pw".to_string()),
            tls: TlsMode::InsecureSkipVerify,
            database: 2,
            ..Default::default()
        };
        assert_eq!(
            config.connection_string(),
            "rediss://app:pw@localhost:6379/2#insecure"
        );
    }

    #[test]
    fn test_insecure_tls_refused_in_production() {
        let config = RedisConfig {
            tls: TlsMode::InsecureSkipVerify,
            ..Default::default()
        };
        assert!(config.validate(false).is_ok());
        assert!(matches!(config.validate(true), Err(Error::Config(_))));
    }

    #[test]
    fn test_from_lookup() {
        let config = RedisConfig::from_lookup(|name| match name {
            "REDIS_HOST" => Some("cache.internal".to_string()),
            "REDIS_PORT" => Some("6380".to_string()),
            "REDIS_TLS" => Some("on".to_string()),
            _ => None,
        });
        assert_eq!(config.host, "cache.internal");
        assert_eq!(config.port, 6380);
        assert_eq!(config.tls, TlsMode::Verified);
    }
}
