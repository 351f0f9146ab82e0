//! Service startup with the session cache.
//!
//! Wires a session cache in front of a simulated database, warms it in the
//! background, validates a few tokens and prints the health snapshot.
//!
//! ```bash
//! RUST_LOG=session_cache=debug cargo run --example startup
//! # against a real Redis
//! REDIS_HOST=localhost RUST_LOG=info cargo run --example startup --features redis
//! ```

use session_cache::prelude::*;
use session_cache::hash_token;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Simulated sessions table with a fixed query latency.
struct SessionsTable {
    rows: HashMap<String, SessionRecord>,
}

impl SessionsTable {
    fn seeded(n: u64) -> Self {
        let now = SystemTime::now();
        let rows = (0..n)
            .map(|i| {
                let record = SessionRecord {
                    session_id: format!("sess_{:04}", i),
                    user_id: format!("user_{:03}", i % 250),
                    token_hash: hash_token(&format!("token_{:04}", i)),
                    expires_at: now + Duration::from_secs(1800 + i * 7),
                    last_activity: now - Duration::from_secs(i * 3),
                    ip_address: Some(format!("10.0.{}.{}", i / 256, i % 256)),
                    user_agent: Some("Mozilla/5.0".to_string()),
                    email: format!("user_{:03}@example.com", i % 250),
                    display_name: None,
                };
                (record.token_hash.clone(), record)
            })
            .collect();
        SessionsTable { rows }
    }
}

impl SessionRepository for SessionsTable {
    async fn find_by_token_hash(&self, token_hash: &str) -> Result<Option<SessionRecord>> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        println!("  [DB] session lookup {}…", &token_hash[..12]);
        Ok(self
            .rows
            .get(token_hash)
            .filter(|r| r.is_live_at(SystemTime::now()))
            .cloned())
    }

    async fn recently_active(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut rows: Vec<SessionRecord> = self.rows.values().cloned().collect();
        rows.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        rows.truncate(limit);
        Ok(rows)
    }
}

async fn serve<M>(manager: M, config: SessionCacheConfig) -> Result<()>
where
    M: ManageConnection,
    M::Connection: CacheConnection,
{
    let table = Arc::new(SessionsTable::seeded(2000));
    let sessions = SessionCache::connect(manager, table, &config).await?;

    let warmer = CacheWarmer::new(sessions.clone(), config.warmer.clone());
    let job = warmer.warm(Some(500), false).await;
    println!("=== Warming 500 sessions in the background ===");

    let health = HealthReporter::new(sessions.client().clone())
        .with_warming(Arc::clone(warmer.progress()));

    println!("\n=== Validating tokens while warming ===");
    for token in ["token_0001", "token_0001", "token_1999", "token_9999"] {
        match sessions.validate(token).await? {
            Some(session) => println!("✓ {} -> {} ({})", token, session.user_id, session.session_id),
            None => println!("✗ {} -> no live session", token),
        }
    }

    match job.await {
        Ok(result) => println!(
            "\n=== Warming {:?}: {}/{} in {:?} ===",
            result.status, result.warmed, result.total, result.elapsed
        ),
        Err(e) => println!("\n=== Warming task failed: {} ===", e),
    }

    println!("\n=== Logging out user_001 everywhere ===");
    let removed = sessions.invalidate_all_for_user("user_001").await?;
    println!("removed {} cache keys", removed);
    sessions.flush().await;

    println!("\n=== Health ===");
    let snapshot = health.snapshot().await;
    println!(
        "{}",
        serde_json::to_string_pretty(&snapshot.to_json()).unwrap_or_default()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let config = SessionCacheConfig::from_env();

    #[cfg(feature = "redis")]
    {
        if std::env::var("REDIS_HOST").is_ok() {
            let redis = RedisConfig::from_env();
            redis.validate(false)?;
            println!("Using Redis at {}:{}", redis.host, redis.port);
            return serve(RedisManager::new(redis)?, config).await;
        }
    }

    println!("Using the in-memory cache service");
    serve(InMemoryManager::new(InMemoryStore::new()), config).await
}
