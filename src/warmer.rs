//! Startup cache warming.
//!
//! Loads the most recently active sessions from the system-of-record and
//! writes them into the cache in fixed-size batches, pausing between batches
//! to bound the burst on the cache service. A wall-clock timeout stops the
//! job early with a partial result instead of holding up startup; it is
//! checked between batches, so writes already started always finish.
//! Individual write failures are counted and never abort a batch.
//!
//! Records loaded before an invalidation are never written back: the job
//! uses the same invalidation epoch as validation repopulation.

use crate::backend::CacheConnection;
use crate::config::WarmerConfig;
use crate::error::Result;
use crate::pool::ManageConnection;
use crate::repository::SessionRepository;
use crate::service::{SessionCache, StoreOutcome};
use crate::session::SessionRecord;
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// State of a warming job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmingStatus {
    Idle,
    Running,
    Completed,
    /// Stopped by the wall-clock timeout; the counts are partial.
    TimedOut,
    /// The system-of-record query failed; nothing was warmed.
    Failed,
}

impl WarmingStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => WarmingStatus::Running,
            2 => WarmingStatus::Completed,
            3 => WarmingStatus::TimedOut,
            4 => WarmingStatus::Failed,
            _ => WarmingStatus::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WarmingStatus::Idle => 0,
            WarmingStatus::Running => 1,
            WarmingStatus::Completed => 2,
            WarmingStatus::TimedOut => 3,
            WarmingStatus::Failed => 4,
        }
    }
}

/// Outcome (or live progress) of a warming job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WarmingResult {
    /// Sessions selected for warming.
    pub total: usize,
    pub warmed: usize,
    /// Writes that failed, plus records that were expired by the time they
    /// were stored.
    pub failed: usize,
    /// Records dropped because an invalidation landed after they were loaded.
    pub skipped: usize,
    #[serde(with = "millis")]
    pub elapsed: Duration,
    pub status: WarmingStatus,
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Progress shared between the running job and observers.
#[derive(Default)]
pub struct WarmingProgress {
    total: AtomicUsize,
    warmed: AtomicUsize,
    failed: AtomicUsize,
    skipped: AtomicUsize,
    elapsed_ms: AtomicU64,
    status: AtomicU8,
}

impl WarmingProgress {
    pub fn snapshot(&self) -> WarmingResult {
        WarmingResult {
            total: self.total.load(Ordering::SeqCst),
            warmed: self.warmed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            elapsed: Duration::from_millis(self.elapsed_ms.load(Ordering::SeqCst)),
            status: WarmingStatus::from_u8(self.status.load(Ordering::SeqCst)),
        }
    }

    pub fn status(&self) -> WarmingStatus {
        WarmingStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn reset(&self) {
        self.total.store(0, Ordering::SeqCst);
        self.warmed.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
        self.skipped.store(0, Ordering::SeqCst);
        self.elapsed_ms.store(0, Ordering::SeqCst);
        self.set_status(WarmingStatus::Running);
    }

    fn set_status(&self, status: WarmingStatus) {
        self.status.store(status.as_u8(), Ordering::SeqCst);
    }

    fn set_elapsed(&self, started: Instant) {
        self.elapsed_ms
            .store(started.elapsed().as_millis() as u64, Ordering::SeqCst);
    }
}

/// Preloads recently active sessions into the cache.
pub struct CacheWarmer<M: ManageConnection, R> {
    cache: SessionCache<M, R>,
    config: WarmerConfig,
    progress: Arc<WarmingProgress>,
}

impl<M: ManageConnection, R> Clone for CacheWarmer<M, R> {
    fn clone(&self) -> Self {
        CacheWarmer {
            cache: self.cache.clone(),
            config: self.config.clone(),
            progress: Arc::clone(&self.progress),
        }
    }
}

impl<M, R> CacheWarmer<M, R>
where
    M: ManageConnection,
    M::Connection: CacheConnection,
    R: SessionRepository,
{
    pub fn new(cache: SessionCache<M, R>, config: WarmerConfig) -> Self {
        CacheWarmer {
            cache,
            config,
            progress: Arc::new(WarmingProgress::default()),
        }
    }

    /// Live progress of the current or last job.
    pub fn progress(&self) -> &Arc<WarmingProgress> {
        &self.progress
    }

    /// Warm up to `limit` sessions (the configured limit when `None`).
    ///
    /// With `blocking`, the job runs to completion before this returns.
    /// Otherwise it is spawned and the handle returned immediately; progress
    /// stays observable through [`progress`](Self::progress).
    pub async fn warm(&self, limit: Option<usize>, blocking: bool) -> JoinHandle<WarmingResult> {
        let limit = limit.unwrap_or(self.config.limit);
        if blocking {
            let result = self.run(limit).await;
            tokio::spawn(async move { result })
        } else {
            self.spawn(limit)
        }
    }

    /// Run the warming job on a background task. Progress reports
    /// `Running` as soon as this returns.
    pub fn spawn(&self, limit: usize) -> JoinHandle<WarmingResult> {
        self.progress.reset();
        let warmer = self.clone();
        tokio::spawn(async move { warmer.execute(limit).await })
    }

    /// Run the warming job to completion, bounded by the configured timeout.
    pub async fn run(&self, limit: usize) -> WarmingResult {
        self.progress.reset();
        self.execute(limit).await
    }

    async fn execute(&self, limit: usize) -> WarmingResult {
        let started = Instant::now();
        let deadline = started + self.config.timeout;
        info!("Cache warming started (limit: {})", limit);

        let epoch = self.cache.invalidation_epoch();
        let status = match tokio::time::timeout_at(deadline, self.load(limit)).await {
            Ok(Ok(sessions)) => self.write_batches(sessions, epoch, deadline).await,
            Ok(Err(e)) => {
                error!("✗ Cache warming aborted, session query failed: {}", e);
                WarmingStatus::Failed
            }
            Err(_) => WarmingStatus::TimedOut,
        };

        self.progress.set_elapsed(started);
        self.progress.set_status(status);
        let result = self.progress.snapshot();
        match status {
            WarmingStatus::Completed => info!(
                "✓ Cache warming completed: {}/{} warmed, {} failed, {} skipped in {:?}",
                result.warmed, result.total, result.failed, result.skipped, result.elapsed
            ),
            WarmingStatus::TimedOut => warn!(
                "⚠ Cache warming timed out after {:?}: {}/{} warmed, {} failed",
                self.config.timeout, result.warmed, result.total, result.failed
            ),
            _ => {}
        }
        result
    }

    async fn load(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        self.cache.repository().recently_active(limit).await
    }

    async fn write_batches(
        &self,
        sessions: Vec<SessionRecord>,
        epoch: u64,
        deadline: Instant,
    ) -> WarmingStatus {
        let total = sessions.len();
        self.progress.total.store(total, Ordering::SeqCst);
        let batch_size = self.config.batch_size.max(1);
        let batches = total.div_ceil(batch_size);

        for (n, batch) in sessions.chunks(batch_size).enumerate() {
            if Instant::now() >= deadline {
                return WarmingStatus::TimedOut;
            }

            let writes = batch
                .iter()
                .map(|record| self.cache.store_unless_invalidated(record, epoch));
            for outcome in join_all(writes).await {
                match outcome {
                    Ok(StoreOutcome::Stored) => {
                        self.progress.warmed.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(StoreOutcome::Expired) => {
                        self.progress.failed.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(StoreOutcome::Superseded) => {
                        self.progress.skipped.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => {
                        self.progress.failed.fetch_add(1, Ordering::SeqCst);
                        debug!("Warming write failed: {}", e);
                    }
                }
            }

            let done = n + 1;
            if self.config.progress_every > 0 && done % self.config.progress_every == 0 {
                info!(
                    "Cache warming progress: batch {}/{}, {} warmed, {} failed",
                    done,
                    batches,
                    self.progress.warmed.load(Ordering::SeqCst),
                    self.progress.failed.load(Ordering::SeqCst)
                );
            }

            if done < batches && !self.config.batch_delay.is_zero() {
                let resume = Instant::now() + self.config.batch_delay;
                if resume >= deadline {
                    tokio::time::sleep_until(deadline).await;
                    return WarmingStatus::TimedOut;
                }
                tokio::time::sleep_until(resume).await;
            }
        }
        WarmingStatus::Completed
    }
}
