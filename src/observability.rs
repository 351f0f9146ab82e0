//! Metrics collection for cache operations.
//!
//! [`CacheMetrics`] is shared by the [`CacheClient`](crate::client::CacheClient)
//! (per-command latency samples) and the [`SessionCache`](crate::SessionCache)
//! (hit/miss/error/invalidation counters and background write failures).
//! Counters are plain atomics and are updated synchronously on the caller's
//! path; only a bounded window of latency samples is kept per operation.
//!
//! # Metrics
//!
//! | Counter | Incremented when |
//! |---------|------------------|
//! | `hits` | `validate` served a record from cache |
//! | `misses` | cache had no usable entry |
//! | `errors` | a cache-layer error forced the fallback path |
//! | `invalidations` | an `invalidate*` call was made, whatever its outcome |
//! | `sets` | a record was written into the cache |
//! | `background_failures` | a detached repopulation write failed |

use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Summary of the most recent latency samples for one operation.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub count: usize,
    pub avg_us: f64,
    pub p50_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

impl LatencyStats {
    fn from_samples(samples: &VecDeque<u64>) -> Self {
        if samples.is_empty() {
            return LatencyStats::default();
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let pct = |p: usize| sorted[((sorted.len() - 1) * p) / 100];
        LatencyStats {
            count: sorted.len(),
            avg_us: sorted.iter().sum::<u64>() as f64 / sorted.len() as f64,
            p50_us: pct(50),
            p99_us: pct(99),
            max_us: sorted[sorted.len() - 1],
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CounterSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub invalidations: u64,
    pub sets: u64,
    pub background_failures: u64,
    pub last_background_error: Option<String>,
    pub hit_rate: f64,
}

/// Counters and latency samples for the session cache.
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    invalidations: AtomicU64,
    sets: AtomicU64,
    background_failures: AtomicU64,
    last_background_error: Mutex<Option<String>>,
    latency: DashMap<&'static str, VecDeque<u64>>,
    max_samples: usize,
}

impl Default for CacheMetrics {
    fn default() -> Self {
        CacheMetrics::new(100)
    }
}

impl CacheMetrics {
    /// Create a collector keeping the last `max_samples` latencies per operation.
    pub fn new(max_samples: usize) -> Self {
        CacheMetrics {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            background_failures: AtomicU64::new(0),
            last_background_error: Mutex::new(None),
            latency: DashMap::new(),
            max_samples: max_samples.max(1),
        }
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, context: &str, error: &crate::Error) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        warn!("⚠ Cache {} failed, falling back: {}", context, error);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    /// Account for a failed detached write.
    pub fn record_background_failure(&self, error: &crate::Error) {
        self.background_failures.fetch_add(1, Ordering::Relaxed);
        let mut last = self
            .last_background_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Some(error.to_string());
        warn!("⚠ Background cache write failed: {}", error);
    }

    /// Add one latency sample for `operation`.
    pub fn record_latency(&self, operation: &'static str, elapsed: Duration) {
        let micros = elapsed.as_micros().min(u128::from(u64::MAX)) as u64;
        let mut samples = self.latency.entry(operation).or_default();
        if samples.len() == self.max_samples {
            samples.pop_front();
        }
        samples.push_back(micros);
    }

    /// Latency summary per operation, sorted by operation name.
    pub fn latency(&self) -> BTreeMap<String, LatencyStats> {
        self.latency
            .iter()
            .map(|entry| (entry.key().to_string(), LatencyStats::from_samples(entry.value())))
            .collect()
    }

    /// Get cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        if (hits + misses) == 0.0 {
            return 0.0;
        }
        hits / (hits + misses)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let last_background_error = self
            .last_background_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        CounterSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            background_failures: self.background_failures.load(Ordering::Relaxed),
            last_background_error,
            hit_rate: self.hit_rate(),
        }
    }

    /// Render metrics in Prometheus format
    pub fn render_prometheus(&self) -> String {
        let c = self.snapshot();
        let mut out = format!(
            r#"# HELP session_cache_hits_total Total cache hits
# TYPE session_cache_hits_total counter
session_cache_hits_total {}

# HELP session_cache_misses_total Total cache misses
# TYPE session_cache_misses_total counter
session_cache_misses_total {}

# HELP session_cache_errors_total Cache-layer errors recovered by fallback
# TYPE session_cache_errors_total counter
session_cache_errors_total {}

# HELP session_cache_invalidations_total Invalidation requests
# TYPE session_cache_invalidations_total counter
session_cache_invalidations_total {}

# HELP session_cache_sets_total Session records written to cache
# TYPE session_cache_sets_total counter
session_cache_sets_total {}

# HELP session_cache_background_failures_total Failed background cache writes
# TYPE session_cache_background_failures_total counter
session_cache_background_failures_total {}

# HELP session_cache_hit_rate Cache hit rate (0.0-1.0)
# TYPE session_cache_hit_rate gauge
session_cache_hit_rate {:.4}
"#,
            c.hits,
            c.misses,
            c.errors,
            c.invalidations,
            c.sets,
            c.background_failures,
            c.hit_rate
        );

        let latency = self.latency();
        if !latency.is_empty() {
            out.push_str(
                "\n# HELP session_cache_latency_us Recent command latency in microseconds\n\
                 # TYPE session_cache_latency_us gauge\n",
            );
            for (op, stats) in &latency {
                for (quantile, value) in [("0.5", stats.p50_us), ("0.99", stats.p99_us)] {
                    out.push_str(&format!(
                        "session_cache_latency_us{{op=\"{}\",quantile=\"{}\"}} {}\n",
                        op, quantile, value
                    ));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_hit_rate() {
        let metrics = CacheMetrics::default();
        assert_eq!(metrics.hit_rate(), 0.0);
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();
        assert!((metrics.hit_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let metrics = CacheMetrics::new(3);
        for us in [1000, 10, 20, 30] {
            metrics.record_latency("get", Duration::from_micros(us));
        }
        let stats = metrics.latency().remove("get").unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.max_us, 30);
        assert_eq!(stats.p50_us, 20);
        assert!((stats.avg_us - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_background_failure_keeps_last_error() {
        let metrics = CacheMetrics::default();
        metrics.record_background_failure(&Error::Connection("reset".into()));
        metrics.record_background_failure(&Error::CircuitOpen);

        let snap = metrics.snapshot();
        assert_eq!(snap.background_failures, 2);
        assert_eq!(snap.last_background_error.as_deref(), Some("Circuit open"));
    }

    #[test]
    fn test_render_prometheus() {
        let metrics = CacheMetrics::default();
        metrics.record_hit();
        metrics.record_latency("hget_all", Duration::from_micros(50));

        let text = metrics.render_prometheus();
        assert!(text.contains("session_cache_hits_total 1"));
        assert!(text.contains("session_cache_latency_us{op=\"hget_all\",quantile=\"0.5\"} 50"));
    }
}
