//! Circuit breaker guarding every call to the cache service.
//!
//! ```text
//!            error% >= threshold
//!            and volume >= minimum
//!   CLOSED ─────────────────────────► OPEN ◄──────────┐
//!     ▲                                │ reset_timeout │ probe fails
//!     │ probe succeeds                 ▼               │
//!     └────────────────────────── HALF_OPEN ───────────┘
//! ```
//!
//! While OPEN, and while a HALF_OPEN probe is in flight, calls are rejected
//! with [`Error::CircuitOpen`] before the wrapped operation is even created.
//! Successes, failures and timeouts are counted in a rolling window of
//! buckets; rejections are counted too but never feed the error rate.

use crate::config::BreakerConfig;
use crate::error::{Error, Result};
use crate::window::{BucketRing, TickClock};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Requests flow normally
    Closed,
    /// Requests are rejected until the cool-down elapses
    Open,
    /// One probe request tests whether the service recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct Bucket {
    successes: u64,
    failures: u64,
    timeouts: u64,
    rejections: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct Totals {
    successes: u64,
    failures: u64,
    timeouts: u64,
    rejections: u64,
}

impl Totals {
    fn volume(&self) -> u64 {
        self.successes + self.failures + self.timeouts
    }

    fn error_pct(&self) -> f64 {
        let volume = self.volume();
        if volume == 0 {
            return 0.0;
        }
        (self.failures + self.timeouts) as f64 * 100.0 / volume as f64
    }
}

struct Inner {
    state: CircuitState,
    window: BucketRing<Bucket>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Inner {
    fn totals(&self) -> Totals {
        self.window.iter().fold(Totals::default(), |acc, b| Totals {
            successes: acc.successes + b.successes,
            failures: acc.failures + b.failures,
            timeouts: acc.timeouts + b.timeouts,
            rejections: acc.rejections + b.rejections,
        })
    }
}

/// Point-in-time breaker statistics over the rolling window.
#[derive(Clone, Debug, Serialize)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub rejections: u64,
    pub error_pct: f64,
    pub times_opened: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Timeout,
}

/// Records a probe as failed if the caller drops the call before it finishes,
/// so the breaker never stays stuck with a probe marked in flight.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("Circuit breaker probe abandoned before completion");
            self.breaker.record(Admission::Probe, Outcome::Failure);
        }
    }
}

/// Rolling-window circuit breaker.
pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: TickClock,
    inner: Mutex<Inner>,
    times_opened: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        let clock = TickClock::new(config.rolling_window, config.rolling_buckets);
        let window = BucketRing::new(config.rolling_buckets, clock.now());
        CircuitBreaker {
            config,
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                window,
                opened_at: None,
                probe_in_flight: false,
            }),
            times_opened: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state. An OPEN breaker whose cool-down has elapsed reports
    /// HALF_OPEN; the transition itself happens on the next call.
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at)) if at.elapsed() >= self.config.reset_timeout => {
                CircuitState::HalfOpen
            }
            (state, _) => state,
        }
    }

    /// Run `op` through the breaker.
    ///
    /// `op` is only invoked when the breaker admits the call. Its future is
    /// bounded by `request_timeout`; exceeding it counts as a failure.
    ///
    /// # Errors
    /// - `Error::CircuitOpen` when rejected
    /// - `Error::Timeout` when the call exceeded `request_timeout`
    /// - whatever error `op` returned
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.admit()?;
        let mut guard = ProbeGuard {
            breaker: self,
            armed: admission == Admission::Probe,
        };

        let result = tokio::time::timeout(self.config.request_timeout, op()).await;
        guard.armed = false;

        match result {
            Ok(Ok(value)) => {
                self.record(admission, Outcome::Success);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.record(admission, Outcome::Failure);
                Err(e)
            }
            Err(_) => {
                self.record(admission, Outcome::Timeout);
                Err(Error::Timeout(format!(
                    "call exceeded {:?}",
                    self.config.request_timeout
                )))
            }
        }
    }

    fn admit(&self) -> Result<Admission> {
        let tick = self.clock.now();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.config.reset_timeout);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!("Circuit breaker HALF_OPEN: allowing one probe");
                    Ok(Admission::Probe)
                } else {
                    inner.window.current(tick).rejections += 1;
                    Err(Error::CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    inner.window.current(tick).rejections += 1;
                    Err(Error::CircuitOpen)
                } else {
                    inner.probe_in_flight = true;
                    Ok(Admission::Probe)
                }
            }
        }
    }

    fn record(&self, admission: Admission, outcome: Outcome) {
        let tick = self.clock.now();
        let mut inner = self.lock();

        if admission == Admission::Probe {
            inner.probe_in_flight = false;
            if inner.state != CircuitState::HalfOpen {
                return;
            }
            if outcome == Outcome::Success {
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
                inner.window.clear();
                info!("✓ Circuit breaker CLOSED: probe succeeded");
            } else {
                self.trip(&mut inner, "probe failed");
            }
            return;
        }

        {
            let bucket = inner.window.current(tick);
            match outcome {
                Outcome::Success => bucket.successes += 1,
                Outcome::Failure => bucket.failures += 1,
                Outcome::Timeout => bucket.timeouts += 1,
            }
        }

        if inner.state == CircuitState::Closed && outcome != Outcome::Success {
            let totals = inner.totals();
            if totals.volume() >= self.config.volume_threshold
                && totals.error_pct() >= f64::from(self.config.error_threshold_pct)
            {
                let reason = format!(
                    "{:.1}% errors over {} calls",
                    totals.error_pct(),
                    totals.volume()
                );
                self.trip(&mut inner, &reason);
            }
        }
    }

    fn trip(&self, inner: &mut Inner, reason: &str) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        self.times_opened.fetch_add(1, Ordering::Relaxed);
        warn!(
            "⚠ Circuit breaker OPEN ({}); failing fast for {:?}",
            reason, self.config.reset_timeout
        );
    }

    /// Force the breaker back to CLOSED with an empty window.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.probe_in_flight = false;
        inner.window.clear();
        info!("Circuit breaker reset to CLOSED");
    }

    /// Get current breaker statistics.
    pub fn stats(&self) -> BreakerStats {
        let state = self.state();
        let tick = self.clock.now();
        let mut inner = self.lock();
        inner.window.advance(tick);
        let totals = inner.totals();
        BreakerStats {
            state,
            successes: totals.successes,
            failures: totals.failures,
            timeouts: totals.timeouts,
            rejections: totals.rejections,
            error_pct: totals.error_pct(),
            times_opened: self.times_opened.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("times_opened", &self.times_opened.load(Ordering::Relaxed))
            .finish()
    }
}
