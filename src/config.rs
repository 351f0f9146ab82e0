//! Configuration for the session cache and its collaborators.
//!
//! Every tunable is a named field with a documented default. Call
//! [`SessionCacheConfig::from_env`] to overlay `SESSION_CACHE_*` environment
//! variables on top of the defaults, then [`SessionCacheConfig::validate`]
//! before wiring the components together.

use crate::error::{Error, Result};
use std::str::FromStr;
use std::time::Duration;

/// Default cache namespace prefix.
pub const DEFAULT_NAMESPACE: &str = "session";

/// Default TTL of a cached session entry (5 minutes).
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(300);

/// Connection pool settings.
#[derive(Clone, Debug, PartialEq)]
pub struct PoolConfig {
    /// Connections opened eagerly and kept alive by the reaper.
    pub min_size: usize,
    /// Hard cap on concurrently existing connections.
    pub max_size: usize,
    /// How long `acquire` may wait for a free slot before failing.
    pub acquire_timeout: Duration,
    /// Idle connections older than this are closed by the reaper.
    pub idle_timeout: Duration,
    /// How often the reaper runs.
    pub reap_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_size: 2,
            max_size: 16,
            acquire_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(30),
            reap_interval: Duration::from_secs(10),
        }
    }
}

/// Circuit breaker settings.
#[derive(Clone, Debug, PartialEq)]
pub struct BreakerConfig {
    /// Per-call timeout; a call exceeding it counts as a failure.
    pub request_timeout: Duration,
    /// Failure percentage (1..=100) at which the breaker trips.
    pub error_threshold_pct: u8,
    /// Length of the rolling statistics window.
    pub rolling_window: Duration,
    /// Number of buckets the rolling window is split into.
    pub rolling_buckets: usize,
    /// Minimum calls in the window before the breaker may trip.
    pub volume_threshold: u64,
    /// Cool-down spent OPEN before a half-open probe is allowed.
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            request_timeout: Duration::from_secs(1),
            error_threshold_pct: 50,
            rolling_window: Duration::from_secs(10),
            rolling_buckets: 10,
            volume_threshold: 10,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Hotkey detector settings.
#[derive(Clone, Debug, PartialEq)]
pub struct HotkeyConfig {
    /// A key is hot when its accesses in the window exceed this value.
    pub threshold: u64,
    /// Length of the sliding window (also the eviction horizon).
    pub window: Duration,
    /// Number of buckets in the window.
    pub buckets: usize,
    /// Hard cap on distinct tracked keys.
    pub max_tracked_keys: usize,
    /// How often idle windows are swept.
    pub sweep_interval: Duration,
}

impl Default for HotkeyConfig {
    fn default() -> Self {
        HotkeyConfig {
            threshold: 100,
            window: Duration::from_secs(60),
            buckets: 60,
            max_tracked_keys: 10_000,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Startup warmer settings.
#[derive(Clone, Debug, PartialEq)]
pub struct WarmerConfig {
    /// Most recently active sessions to load.
    pub limit: usize,
    /// Sessions written per batch.
    pub batch_size: usize,
    /// Pause between batches.
    pub batch_delay: Duration,
    /// Wall-clock budget for the whole job.
    pub timeout: Duration,
    /// Log progress every this many batches.
    pub progress_every: usize,
}

impl Default for WarmerConfig {
    fn default() -> Self {
        WarmerConfig {
            limit: 1000,
            batch_size: 50,
            batch_delay: Duration::from_millis(100),
            timeout: Duration::from_secs(30),
            progress_every: 5,
        }
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionCacheConfig {
    /// Key namespace, e.g. `"session"` gives `session:tok:<hash>`.
    pub namespace: String,
    /// Upper bound on cache entry TTL. Never exceeds the session's own expiry.
    pub session_ttl: Duration,
    /// `COUNT` hint passed to each SCAN round-trip.
    pub scan_count: usize,
    /// Maximum keys examined by one invalidation scan.
    pub max_scan_keys: usize,
    /// Latency samples retained per operation.
    pub latency_samples: usize,
    pub pool: PoolConfig,
    pub breaker: BreakerConfig,
    pub hotkey: HotkeyConfig,
    pub warmer: WarmerConfig,
}

impl Default for SessionCacheConfig {
    fn default() -> Self {
        SessionCacheConfig {
            namespace: DEFAULT_NAMESPACE.to_string(),
            session_ttl: DEFAULT_SESSION_TTL,
            scan_count: 100,
            max_scan_keys: 10_000,
            latency_samples: 100,
            pool: PoolConfig::default(),
            breaker: BreakerConfig::default(),
            hotkey: HotkeyConfig::default(),
            warmer: WarmerConfig::default(),
        }
    }
}

impl SessionCacheConfig {
    /// Build a configuration from defaults overridden by environment variables.
    ///
    /// # Environment Variables
    /// - `SESSION_CACHE_NAMESPACE`, `SESSION_CACHE_TTL_SECS`
    /// - `SESSION_CACHE_POOL_MIN`, `SESSION_CACHE_POOL_MAX`,
    ///   `SESSION_CACHE_ACQUIRE_TIMEOUT_MS`, `SESSION_CACHE_IDLE_TIMEOUT_MS`
    /// - `SESSION_CACHE_BREAKER_ERROR_PCT`, `SESSION_CACHE_BREAKER_WINDOW_MS`,
    ///   `SESSION_CACHE_BREAKER_RESET_MS`, `SESSION_CACHE_BREAKER_VOLUME`,
    ///   `SESSION_CACHE_REQUEST_TIMEOUT_MS`
    /// - `SESSION_CACHE_HOTKEY_THRESHOLD`, `SESSION_CACHE_HOTKEY_WINDOW_MS`,
    ///   `SESSION_CACHE_HOTKEY_MAX_KEYS`
    /// - `SESSION_CACHE_WARM_LIMIT`, `SESSION_CACHE_WARM_BATCH`,
    ///   `SESSION_CACHE_WARM_TIMEOUT_MS`
    ///
    /// Values that fail to parse are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = SessionCacheConfig::default();
        let env = EnvReader { lookup: &lookup };

        if let Some(ns) = lookup("SESSION_CACHE_NAMESPACE") {
            if !ns.is_empty() {
                cfg.namespace = ns;
            }
        }
        env.secs("SESSION_CACHE_TTL_SECS", &mut cfg.session_ttl);

        env.parse("SESSION_CACHE_POOL_MIN", &mut cfg.pool.min_size);
        env.parse("SESSION_CACHE_POOL_MAX", &mut cfg.pool.max_size);
        env.millis("SESSION_CACHE_ACQUIRE_TIMEOUT_MS", &mut cfg.pool.acquire_timeout);
        env.millis("SESSION_CACHE_IDLE_TIMEOUT_MS", &mut cfg.pool.idle_timeout);

        env.parse("SESSION_CACHE_BREAKER_ERROR_PCT", &mut cfg.breaker.error_threshold_pct);
        env.millis("SESSION_CACHE_BREAKER_WINDOW_MS", &mut cfg.breaker.rolling_window);
        env.millis("SESSION_CACHE_BREAKER_RESET_MS", &mut cfg.breaker.reset_timeout);
        env.parse("SESSION_CACHE_BREAKER_VOLUME", &mut cfg.breaker.volume_threshold);
        env.millis("SESSION_CACHE_REQUEST_TIMEOUT_MS", &mut cfg.breaker.request_timeout);

        env.parse("SESSION_CACHE_HOTKEY_THRESHOLD", &mut cfg.hotkey.threshold);
        env.millis("SESSION_CACHE_HOTKEY_WINDOW_MS", &mut cfg.hotkey.window);
        env.parse("SESSION_CACHE_HOTKEY_MAX_KEYS", &mut cfg.hotkey.max_tracked_keys);

        env.parse("SESSION_CACHE_WARM_LIMIT", &mut cfg.warmer.limit);
        env.parse("SESSION_CACHE_WARM_BATCH", &mut cfg.warmer.batch_size);
        env.millis("SESSION_CACHE_WARM_TIMEOUT_MS", &mut cfg.warmer.timeout);

        cfg
    }

    /// Check the configuration for inconsistent settings.
    ///
    /// # Errors
    /// Returns `Error::Config` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() || self.namespace.contains(['*', '?', '[', ']', '\\']) {
            return Err(Error::Config(format!(
                "namespace must be non-empty and glob-free, got {:?}",
                self.namespace
            )));
        }
        if self.session_ttl.is_zero() {
            return Err(Error::Config("session_ttl must be greater than 0".to_string()));
        }
        if self.pool.max_size == 0 {
            return Err(Error::Config("pool.max_size must be greater than 0".to_string()));
        }
        if self.pool.min_size > self.pool.max_size {
            return Err(Error::Config(format!(
                "pool.min_size ({}) exceeds pool.max_size ({})",
                self.pool.min_size, self.pool.max_size
            )));
        }
        if !(1..=100).contains(&self.breaker.error_threshold_pct) {
            return Err(Error::Config(format!(
                "breaker.error_threshold_pct must be within 1..=100, got {}",
                self.breaker.error_threshold_pct
            )));
        }
        if self.breaker.rolling_buckets == 0 || self.breaker.rolling_window.is_zero() {
            return Err(Error::Config(
                "breaker rolling window and bucket count must be greater than 0".to_string(),
            ));
        }
        if self.hotkey.buckets == 0 || self.hotkey.window.is_zero() {
            return Err(Error::Config(
                "hotkey window and bucket count must be greater than 0".to_string(),
            ));
        }
        if self.warmer.batch_size == 0 {
            return Err(Error::Config("warmer.batch_size must be greater than 0".to_string()));
        }
        Ok(())
    }
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn parse<T: FromStr>(&self, name: &str, slot: &mut T) {
        if let Some(raw) = (self.lookup)(name) {
            match raw.trim().parse() {
                Ok(value) => *slot = value,
                Err(_) => warn!("Ignoring unparseable {}={:?}", name, raw),
            }
        }
    }

    fn millis(&self, name: &str, slot: &mut Duration) {
        let mut ms = slot.as_millis() as u64;
        self.parse(name, &mut ms);
        *slot = Duration::from_millis(ms);
    }

    fn secs(&self, name: &str, slot: &mut Duration) {
        let mut secs = slot.as_secs();
        self.parse(name, &mut secs);
        *slot = Duration::from_secs(secs);
    }
}
