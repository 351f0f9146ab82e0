//! Read-only health and metrics snapshot.
//!
//! Aggregates pool, breaker, counter, latency, hotkey and warming state for
//! an external health endpoint. Nothing here mutates cache state.

use crate::backend::CacheConnection;
use crate::breaker::{BreakerStats, CircuitState};
use crate::client::CacheClient;
use crate::hotkey::HotkeyStats;
use crate::observability::{CounterSnapshot, LatencyStats};
use crate::pool::{ManageConnection, PoolStats};
use crate::warmer::{WarmingProgress, WarmingResult};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Hot keys listed in a snapshot by default.
pub const DEFAULT_TOP_HOTKEYS: usize = 10;

/// Overall verdict of a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Cache reachable and breaker closed.
    Healthy,
    /// Cache reachable but the breaker is not closed; validation is being
    /// served partly or wholly by the system-of-record.
    Degraded,
    /// Cache unreachable; every validation falls back.
    Down,
}

/// Point-in-time health of the session cache.
#[derive(Clone, Debug, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub connected: bool,
    pub pool: PoolStats,
    pub breaker: BreakerStats,
    pub counters: CounterSnapshot,
    pub latency: BTreeMap<String, LatencyStats>,
    pub hotkeys: HotkeyStats,
    pub dbsize: Option<u64>,
    pub server_version: Option<String>,
    pub warming: Option<WarmingResult>,
}

impl HealthSnapshot {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Builds [`HealthSnapshot`]s from the shared cache components.
pub struct HealthReporter<M: ManageConnection> {
    client: CacheClient<M>,
    warming: Option<Arc<WarmingProgress>>,
    top_hotkeys: usize,
}

impl<M> HealthReporter<M>
where
    M: ManageConnection,
    M::Connection: CacheConnection,
{
    pub fn new(client: CacheClient<M>) -> Self {
        HealthReporter {
            client,
            warming: None,
            top_hotkeys: DEFAULT_TOP_HOTKEYS,
        }
    }

    /// Include the progress of a warming job in every snapshot.
    pub fn with_warming(mut self, progress: Arc<WarmingProgress>) -> Self {
        self.warming = Some(progress);
        self
    }

    pub fn with_top_hotkeys(mut self, n: usize) -> Self {
        self.top_hotkeys = n;
        self
    }

    /// Probe the cache service and collect every component's statistics.
    pub async fn snapshot(&self) -> HealthSnapshot {
        let client = &self.client;
        let connected = match client.ping().await {
            Ok(()) => true,
            Err(e) => {
                debug!("Health probe failed: {}", e);
                false
            }
        };

        let (dbsize, server_version) = if connected {
            let dbsize = client.dbsize().await.ok();
            let version = client
                .info(Some("server"))
                .await
                .ok()
                .and_then(|info| parse_server_version(&info));
            (dbsize, version)
        } else {
            (None, None)
        };

        let breaker = client.breaker().stats();
        let status = match (connected, breaker.state) {
            (false, _) => HealthStatus::Down,
            (true, CircuitState::Closed) => HealthStatus::Healthy,
            (true, _) => HealthStatus::Degraded,
        };

        HealthSnapshot {
            status,
            connected,
            pool: client.pool().stats(),
            breaker,
            counters: client.metrics().snapshot(),
            latency: client.metrics().latency(),
            hotkeys: client.hotkeys().stats(self.top_hotkeys),
            dbsize,
            server_version,
            warming: self.warming.as_ref().map(|p| p.snapshot()),
        }
    }

    /// Prometheus text: the cache counters plus pool and breaker gauges.
    pub fn render_prometheus(&self) -> String {
        let client = &self.client;
        let pool = client.pool().stats();
        let breaker = client.breaker().stats();
        let hotkeys = client.hotkeys().stats(0);
        let state = match breaker.state {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        };

        let mut out = client.metrics().render_prometheus();
        out.push_str(&format!(
            r#"
# HELP session_cache_pool_connections Pool connections by state
# TYPE session_cache_pool_connections gauge
session_cache_pool_connections{{state="idle"}} {}
session_cache_pool_connections{{state="leased"}} {}
session_cache_pool_connections{{state="pending"}} {}

# HELP session_cache_breaker_state Circuit breaker state (0=closed, 1=half_open, 2=open)
# TYPE session_cache_breaker_state gauge
session_cache_breaker_state {}

# HELP session_cache_hotkeys Keys above the hotkey threshold
# TYPE session_cache_hotkeys gauge
session_cache_hotkeys {}
"#,
            pool.available, pool.leased, pool.pending, state, hotkeys.hot
        ));
        out
    }
}

/// Extract `redis_version` from an `INFO` reply.
fn parse_server_version(info: &str) -> Option<String> {
    info.lines()
        .find_map(|line| line.strip_prefix("redis_version:"))
        .map(|v| v.trim().to_string())
}
