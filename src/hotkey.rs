//! Hotkey detection.
//!
//! Every cache command reports its key through [`HotkeyDetector::track`].
//! Each tracked key owns a ring of per-bucket access counters covering the
//! configured window; a key is hot once its windowed count exceeds
//! `threshold`. The number of tracked keys is hard-capped: once the cap is
//! reached, accesses to unseen keys are dropped silently. Idle windows are
//! evicted by [`sweep`](HotkeyDetector::sweep).

use crate::config::HotkeyConfig;
use crate::window::{BucketRing, TickClock};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A tracked key and its access count over the current window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Hotkey {
    pub key: String,
    pub count: u64,
    pub is_hot: bool,
}

/// Detector summary for health reporting.
#[derive(Clone, Debug, Default, Serialize)]
pub struct HotkeyStats {
    pub tracked: usize,
    pub hot: usize,
    /// Accesses to new keys dropped because the cap was reached.
    pub dropped: u64,
    pub evicted: u64,
    pub top: Vec<Hotkey>,
}

struct KeyWindow {
    ring: BucketRing<u64>,
    last_access: Instant,
}

impl KeyWindow {
    fn hit(&mut self, tick: u64, now: Instant) -> u64 {
        *self.ring.current(tick) += 1;
        self.last_access = now;
        self.ring.iter().sum()
    }

    fn count_at(&self, tick: u64) -> u64 {
        self.ring.live_at(tick).sum()
    }
}

/// Sliding-window access counter over a bounded set of keys.
///
/// Sharded through DashMap, so concurrent `track` calls on different keys
/// rarely contend.
pub struct HotkeyDetector {
    config: HotkeyConfig,
    clock: TickClock,
    windows: DashMap<String, KeyWindow>,
    tracked: AtomicUsize,
    dropped: AtomicU64,
    evicted: AtomicU64,
}

impl HotkeyDetector {
    pub fn new(config: HotkeyConfig) -> Self {
        let clock = TickClock::new(config.window, config.buckets);
        HotkeyDetector {
            config,
            clock,
            windows: DashMap::new(),
            tracked: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &HotkeyConfig {
        &self.config
    }

    /// Record one access to `key`.
    pub fn track(&self, key: &str) {
        let now = Instant::now();
        let tick = self.clock.tick_at(now);

        let count = if let Some(mut window) = self.windows.get_mut(key) {
            window.hit(tick, now)
        } else {
            match self.windows.entry(key.to_string()) {
                Entry::Occupied(mut occupied) => occupied.get_mut().hit(tick, now),
                Entry::Vacant(vacant) => {
                    if !self.reserve_slot() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    let mut window = KeyWindow {
                        ring: BucketRing::new(self.config.buckets, tick),
                        last_access: now,
                    };
                    let count = window.hit(tick, now);
                    vacant.insert(window);
                    count
                }
            }
        };

        if count == self.config.threshold.saturating_add(1) {
            warn!(
                "⚠ Hotkey detected: {} ({} accesses in {:?})",
                key, count, self.config.window
            );
        }
    }

    fn reserve_slot(&self) -> bool {
        let cap = self.config.max_tracked_keys;
        self.tracked
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < cap).then_some(n + 1)
            })
            .is_ok()
    }

    /// Accesses to `key` within the current window.
    pub fn count(&self, key: &str) -> u64 {
        let tick = self.clock.now();
        self.windows.get(key).map_or(0, |w| w.count_at(tick))
    }

    pub fn is_hotkey(&self, key: &str) -> bool {
        self.count(key) > self.config.threshold
    }

    /// Top `n` keys by windowed access count, highest first.
    pub fn hotkeys(&self, n: usize) -> Vec<Hotkey> {
        let tick = self.clock.now();
        let mut keys: Vec<Hotkey> = self
            .windows
            .iter()
            .filter_map(|entry| {
                let count = entry.count_at(tick);
                (count > 0).then(|| Hotkey {
                    key: entry.key().clone(),
                    count,
                    is_hot: count > self.config.threshold,
                })
            })
            .collect();
        keys.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
        keys.truncate(n);
        keys
    }

    /// Number of keys currently holding a window.
    pub fn tracked(&self) -> usize {
        self.tracked.load(Ordering::Acquire)
    }

    /// Evict windows not accessed within the tracking horizon.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let horizon = self.config.window;
        let mut removed = 0usize;
        self.windows.retain(|_, window| {
            let keep = now.saturating_duration_since(window.last_access) < horizon;
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            self.tracked.fetch_sub(removed, Ordering::AcqRel);
            self.evicted.fetch_add(removed as u64, Ordering::Relaxed);
            debug!("Hotkey sweep evicted {} idle key(s)", removed);
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until the detector
    /// is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self
            .config
            .sweep_interval
            .max(std::time::Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(detector) = weak.upgrade() else {
                    break;
                };
                detector.sweep();
            }
        })
    }

    /// Summary with the `top_n` hottest keys.
    pub fn stats(&self, top_n: usize) -> HotkeyStats {
        let tick = self.clock.now();
        let hot = self
            .windows
            .iter()
            .filter(|w| w.count_at(tick) > self.config.threshold)
            .count();
        HotkeyStats {
            tracked: self.tracked(),
            hot,
            dropped: self.dropped.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            top: self.hotkeys(top_n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn detector(threshold: u64, max_keys: usize) -> HotkeyDetector {
        HotkeyDetector::new(HotkeyConfig {
            threshold,
            window: Duration::from_secs(60),
            buckets: 60,
            max_tracked_keys: max_keys,
            sweep_interval: Duration::from_secs(30),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_boundary() {
        let d = detector(5, 100);
        for _ in 0..5 {
            d.track("warm");
        }
        for _ in 0..6 {
            d.track("hot");
        }
        assert!(!d.is_hotkey("warm"));
        assert!(d.is_hotkey("hot"));
        assert!(!d.is_hotkey("never-seen"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hotkeys_ordered_and_flagged() {
        let d = detector(2, 100);
        for _ in 0..4 {
            d.track("a");
        }
        d.track("b");
        for _ in 0..3 {
            d.track("c");
        }

        let top = d.hotkeys(2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0], Hotkey { key: "a".into(), count: 4, is_hot: true });
        assert_eq!(top[1], Hotkey { key: "c".into(), count: 3, is_hot: true });
        assert_eq!(d.hotkeys(10).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cap_drops_new_keys_only() {
        let d = detector(100, 3);
        for key in ["a", "b", "c", "d", "e"] {
            d.track(key);
        }
        assert_eq!(d.tracked(), 3);
        assert_eq!(d.count("d"), 0);

        d.track("a");
        assert_eq!(d.count("a"), 2);
        assert_eq!(d.stats(0).dropped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counts_slide_out_of_window() {
        let d = detector(100, 10);
        d.track("k");
        tokio::time::advance(Duration::from_secs(30)).await;
        d.track("k");
        assert_eq!(d.count("k"), 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(d.count("k"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_frees_capacity() {
        let d = detector(100, 2);
        d.track("a");
        d.track("b");
        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(d.sweep(), 2);
        assert_eq!(d.tracked(), 0);
        d.track("c");
        assert_eq!(d.count("c"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_runs_periodically() {
        let d = Arc::new(detector(100, 10));
        let handle = d.spawn_sweeper();
        d.track("idle");

        tokio::time::sleep(Duration::from_secs(91)).await;
        assert_eq!(d.tracked(), 0);

        drop(d);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(handle.is_finished());
    }
}
