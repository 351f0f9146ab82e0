//! Fixed-size ring of time buckets.
//!
//! Both the breaker's rolling error window and the hotkey detector's
//! per-key access window are a ring of `N` buckets indexed by
//! `tick % N`, where a tick is `elapsed / bucket_width`. Advancing to a
//! newer tick zeroes every bucket skipped since the last access.

use std::time::Duration;
use tokio::time::Instant;

/// Converts instants into bucket ticks relative to a fixed origin.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TickClock {
    origin: Instant,
    width: Duration,
}

impl TickClock {
    /// Clock whose `buckets` ticks together span `window`.
    pub(crate) fn new(window: Duration, buckets: usize) -> Self {
        let buckets = buckets.max(1) as u32;
        let width = (window / buckets).max(Duration::from_millis(1));
        TickClock {
            origin: Instant::now(),
            width,
        }
    }

    pub(crate) fn tick_at(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin);
        (elapsed.as_nanos() / self.width.as_nanos()) as u64
    }

    pub(crate) fn now(&self) -> u64 {
        self.tick_at(Instant::now())
    }
}

/// Ring of counters covering the last `len` ticks.
#[derive(Clone, Debug)]
pub(crate) struct BucketRing<C> {
    buckets: Box<[C]>,
    head_tick: u64,
}

impl<C: Default + Clone> BucketRing<C> {
    pub(crate) fn new(len: usize, tick: u64) -> Self {
        BucketRing {
            buckets: vec![C::default(); len.max(1)].into_boxed_slice(),
            head_tick: tick,
        }
    }

    /// Move the head forward to `tick`, clearing buckets that aged out.
    pub(crate) fn advance(&mut self, tick: u64) {
        if tick <= self.head_tick {
            return;
        }
        let len = self.buckets.len() as u64;
        let gap = tick - self.head_tick;
        if gap >= len {
            self.buckets.iter_mut().for_each(|b| *b = C::default());
        } else {
            for t in (self.head_tick + 1)..=tick {
                self.buckets[(t % len) as usize] = C::default();
            }
        }
        self.head_tick = tick;
    }

    /// Bucket for `tick` after advancing to it.
    pub(crate) fn current(&mut self, tick: u64) -> &mut C {
        self.advance(tick);
        let len = self.buckets.len() as u64;
        &mut self.buckets[(self.head_tick % len) as usize]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &C> {
        self.buckets.iter()
    }

    /// Buckets still inside the window ending at `tick`, read without
    /// advancing the head.
    pub(crate) fn live_at(&self, tick: u64) -> impl Iterator<Item = &C> {
        let len = self.buckets.len() as u64;
        let oldest = (tick + 1).saturating_sub(len);
        let start = oldest.max((self.head_tick + 1).saturating_sub(len));
        (start..=self.head_tick).map(move |t| &self.buckets[(t % len) as usize])
    }

    pub(crate) fn clear(&mut self) {
        self.buckets.iter_mut().for_each(|b| *b = C::default());
    }
}
