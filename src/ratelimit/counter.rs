//! Fixed-window counter.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::trace;

use super::limiter::{derive_rate, Clock, Limiter, RETRY_SLACK};
use crate::error::Result;

/// A limiter that counts permits in fixed windows of `period`.
///
/// The count resets at the first request after the window ends. Every request
/// adds to the window's count, rejected ones included, so a burst of refused
/// requests keeps the window saturated until it rolls over.
///
/// The window rollover is a load followed by two stores rather than a single
/// atomic step. Callers racing across a window boundary can reset the count
/// more than once, which skews the count slightly in exchange for staying
/// lock-free.
#[derive(Debug)]
pub struct FixedWindowCounter {
    enabled: AtomicBool,
    capacity: u64,
    period: Duration,
    rate: Duration,
    clock: Clock,
    /// Permits requested in the current window
    count: AtomicU64,
    /// End of the current window, in `clock` nanoseconds
    tick: AtomicU64,
}

impl FixedWindowCounter {
    /// Create a counter granting `capacity` permits per `period`.
    pub fn new(capacity: u64, period: Duration) -> Result<Self> {
        let rate = derive_rate(capacity, period)?;

        Ok(Self {
            enabled: AtomicBool::new(true),
            capacity,
            period,
            rate,
            clock: Clock::new(),
            count: AtomicU64::new(0),
            tick: AtomicU64::new(0),
        })
    }

    /// Window length.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// When the current window ends.
    pub fn window_ends_at(&self) -> Instant {
        self.clock.instant(self.tick.load(Ordering::Acquire))
    }

    /// Get the duration until the current window resets.
    pub fn duration_until_reset(&self) -> Duration {
        self.window_ends_at()
            .saturating_duration_since(Instant::now())
    }

    /// Start a new window if the current one has ended.
    fn maybe_reset_window(&self, now: u64) {
        if now >= self.tick.load(Ordering::Acquire) {
            self.count.store(0, Ordering::Release);
            let period = self.period.as_nanos() as u64;
            self.tick.store(now.saturating_add(period), Ordering::Release);
        }
    }

    /// Count in the current window, clamped to capacity.
    fn current_count(&self) -> u64 {
        self.maybe_reset_window(self.clock.now());
        self.count.load(Ordering::Acquire).min(self.capacity)
    }
}

impl Limiter for FixedWindowCounter {
    fn take(&self, count: u64) -> bool {
        self.maybe_reset_window(self.clock.now());

        // Saturating: a refused request never lowers the window
        let previous = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                Some(c.saturating_add(count))
            })
            .unwrap_or_else(|c| c);
        let total = previous.saturating_add(count);
        let admitted = total <= self.capacity;

        trace!(
            requested = count,
            total = total,
            capacity = self.capacity,
            admitted = admitted,
            "Fixed window take"
        );
        admitted
    }

    fn retry_interval(&self) -> Duration {
        self.rate.saturating_sub(RETRY_SLACK)
    }

    fn available(&self) -> u64 {
        self.capacity - self.current_count()
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
        self.current_count() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RateError;
    use std::thread;

    #[test]
    fn test_counter_admits_capacity_per_window() {
        let counter = FixedWindowCounter::new(100, Duration::from_secs(1)).unwrap();

        let admitted = (0..120).filter(|_| counter.take(1)).count();

        assert_eq!(admitted, 100);
        assert_eq!(counter.available(), 0);
        assert_eq!(counter.count(), 100);
    }

    #[test]
    fn test_counter_window_reset() {
        let counter = FixedWindowCounter::new(10, Duration::from_millis(100)).unwrap();

        for _ in 0..10 {
            assert!(counter.take(1));
        }
        assert!(!counter.take(1));

        thread::sleep(Duration::from_millis(120));

        assert_eq!(counter.available(), 10);
        assert!(counter.take(1));
        assert_eq!(counter.count(), 1);
    }

    #[test]
    fn test_counter_rejected_requests_still_count() {
        let counter = FixedWindowCounter::new(5, Duration::from_secs(1)).unwrap();

        assert!(counter.take(3));
        assert!(!counter.take(3)); // 6 > 5
        // The refused 3 stay in the window, so even a single permit is refused
        assert!(!counter.take(1));
        assert_eq!(counter.count(), 5);
    }

    #[test]
    fn test_counter_oversized_take_saturates_window() {
        let counter = FixedWindowCounter::new(5, Duration::from_secs(10)).unwrap();

        assert!(counter.take(5));
        assert!(!counter.take(u64::MAX));
        assert!(!counter.take(1));
        assert_eq!(counter.available(), 0);
        assert_eq!(counter.count(), 5);

        let fresh = FixedWindowCounter::new(5, Duration::from_secs(10)).unwrap();
        assert!(!fresh.take(u64::MAX));
        assert!(!fresh.take(1));
    }

    #[test]
    fn test_counter_multi_permit_take() {
        let counter = FixedWindowCounter::new(10, Duration::from_secs(1)).unwrap();

        assert!(counter.take(4));
        assert_eq!(counter.available(), 6);
        assert!(counter.take(6));
        assert_eq!(counter.available(), 0);
    }

    #[test]
    fn test_counter_take_blocked_waits_for_next_window() {
        let counter = FixedWindowCounter::new(5, Duration::from_millis(100)).unwrap();
        for _ in 0..5 {
            assert!(counter.take(1));
        }

        let started = Instant::now();
        let request_at = counter.take_blocked(1);

        assert!(request_at >= started);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(counter.count(), 1);
    }

    #[test]
    fn test_counter_duration_until_reset() {
        let counter = FixedWindowCounter::new(10, Duration::from_secs(1)).unwrap();
        counter.take(1);

        let remaining = counter.duration_until_reset();
        assert!(remaining > Duration::from_millis(900));
        assert!(remaining <= Duration::from_secs(1));
    }

    #[test]
    fn test_counter_enabled_flag_is_advisory() {
        let counter = FixedWindowCounter::new(1, Duration::from_secs(1)).unwrap();
        assert!(counter.enabled());

        counter.set_enabled(false);
        assert!(!counter.enabled());
        assert!(counter.take(1));
        assert_eq!(counter.capacity(), 1);
    }

    #[test]
    fn test_counter_construction_guard() {
        assert!(FixedWindowCounter::new(1000, Duration::from_millis(1)).is_ok());
        assert!(matches!(
            FixedWindowCounter::new(1001, Duration::from_millis(1)),
            Err(RateError::RateTooFine { .. })
        ));
        assert!(matches!(
            FixedWindowCounter::new(0, Duration::from_secs(1)),
            Err(RateError::InvalidCapacity(0))
        ));
    }
}
