//! Leaky bucket.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::trace;

use super::limiter::{derive_rate, retry_until, Clock, Limiter, RETRY_SLACK};
use crate::error::Result;

/// A limiter whose consumed count drains continuously over time.
///
/// Each attempt first leaks `elapsed / rate * count` units from the bucket,
/// where `rate = period / capacity` and `count` is the size of the attempt,
/// then admits the request if it still fits under capacity. The leak runs on
/// failed attempts too.
///
/// The count and the refresh timestamp are separate atomics. A caller can
/// observe the new timestamp before the matching leak has been applied, which
/// may briefly refuse a request that would fit.
#[derive(Debug)]
pub struct LeakyBucket {
    enabled: AtomicBool,
    capacity: u64,
    rate: Duration,
    /// `rate` in nanoseconds, never zero
    rate_nanos: u64,
    clock: Clock,
    /// Permits currently held in the bucket
    count: AtomicU64,
    /// Last leak, in `clock` nanoseconds
    refreshed_at: AtomicU64,
}

impl LeakyBucket {
    /// Create a bucket draining `capacity` permits per `period`.
    pub fn new(capacity: u64, period: Duration) -> Result<Self> {
        let rate = derive_rate(capacity, period)?;
        let clock = Clock::new();

        Ok(Self {
            enabled: AtomicBool::new(true),
            capacity,
            rate,
            rate_nanos: rate.as_nanos() as u64,
            count: AtomicU64::new(0),
            refreshed_at: AtomicU64::new(clock.now()),
            clock,
        })
    }

    /// Interval at which one permit drains.
    pub fn rate(&self) -> Duration {
        self.rate
    }

    /// Whole drip intervals elapsed since the last leak.
    fn intervals_since(&self, refreshed_at: u64, now: u64) -> u64 {
        now.saturating_sub(refreshed_at) / self.rate_nanos
    }

    /// Drain the bucket for the time elapsed since the last leak.
    ///
    /// The timestamp only advances by whole intervals, so callers polling
    /// faster than `rate` still accumulate leak time.
    fn leak(&self, now: u64, count: u64) {
        let refreshed_at = self.refreshed_at.load(Ordering::Acquire);
        let intervals = self.intervals_since(refreshed_at, now);
        if intervals == 0 {
            return;
        }

        let advanced = refreshed_at + intervals * self.rate_nanos;
        if self
            .refreshed_at
            .compare_exchange(refreshed_at, advanced, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another caller claimed these intervals
            return;
        }

        let drained = intervals.saturating_mul(count.max(1));
        let _ = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_sub(drained))
            });
    }

    /// Sleep off the rest of the drip interval after a blocked take succeeds.
    fn pace(&self, request_at: Instant) {
        let rest = self
            .rate
            .checked_sub(request_at.elapsed())
            .and_then(|d| d.checked_sub(Duration::from_millis(1)));
        if let Some(rest) = rest {
            thread::sleep(rest);
        }
    }

    /// Count as it would be after leaking for one permit, without mutating.
    fn projected_count(&self) -> u64 {
        let refreshed_at = self.refreshed_at.load(Ordering::Acquire);
        let intervals = self.intervals_since(refreshed_at, self.clock.now());
        self.count
            .load(Ordering::Acquire)
            .saturating_sub(intervals)
    }
}

impl Limiter for LeakyBucket {
    fn take(&self, count: u64) -> bool {
        self.leak(self.clock.now(), count);

        let capacity = self.capacity;
        let admitted = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                c.checked_add(count).filter(|next| *next <= capacity)
            })
            .is_ok();

        trace!(
            requested = count,
            capacity = capacity,
            admitted = admitted,
            "Leaky bucket take"
        );
        admitted
    }

    fn take_blocked(&self, count: u64) -> Instant {
        let request_at = Instant::now();
        retry_until(self, count, None);
        self.pace(request_at);
        request_at
    }

    fn take_blocked_timeout(&self, count: u64, timeout: Duration) -> Option<Instant> {
        let request_at = Instant::now();
        if !retry_until(self, count, Some(request_at + timeout)) {
            return None;
        }
        self.pace(request_at);
        Some(request_at)
    }

    fn retry_interval(&self) -> Duration {
        self.rate.saturating_sub(RETRY_SLACK)
    }

    fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.projected_count())
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn close(&self) {}

    fn count(&self) -> i64 {
        self.projected_count() as i64
    }
}
