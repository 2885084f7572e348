//! The limiter contract implemented by every algorithm.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::{RateError, Result};

/// Smallest inter-permit interval (`period / capacity`) a limiter accepts.
pub const MIN_RATE: Duration = Duration::from_micros(1);

/// Trimmed from retry sleeps so a waiter wakes just ahead of the next permit.
pub(crate) const RETRY_SLACK: Duration = Duration::from_nanos(999);

/// A rate limiter handing out permits.
///
/// Implementations are shared between threads behind an `Arc`, so every
/// operation takes `&self`. Running out of permits is a normal outcome and is
/// reported as `false`, never as an error.
pub trait Limiter: Send + Sync + fmt::Debug {
    /// Try to take `count` permits without blocking.
    fn take(&self, count: u64) -> bool;

    /// Take `count` permits, sleeping between attempts until they are granted.
    ///
    /// Returns the instant the request was first considered. There is no
    /// queue: concurrent waiters are admitted in whatever order their retries
    /// land. A request larger than [`capacity`](Limiter::capacity) never
    /// succeeds, use [`take_blocked_timeout`](Limiter::take_blocked_timeout)
    /// when that can happen.
    fn take_blocked(&self, count: u64) -> Instant {
        let request_at = Instant::now();
        retry_until(self, count, None);
        request_at
    }

    /// Like [`take_blocked`](Limiter::take_blocked), but gives up once
    /// `timeout` has elapsed and returns `None`.
    fn take_blocked_timeout(&self, count: u64, timeout: Duration) -> Option<Instant> {
        let request_at = Instant::now();
        retry_until(self, count, Some(request_at + timeout)).then_some(request_at)
    }

    /// Pause between two attempts of a blocked take.
    fn retry_interval(&self) -> Duration {
        Duration::from_millis(1)
    }

    /// Permits that could be taken right now, for `X-RateLimit-Remaining`.
    fn available(&self) -> u64;

    /// Configured maximum, for `X-RateLimit-Limit`.
    fn capacity(&self) -> u64;

    /// Whether the owner should route requests through this limiter.
    ///
    /// The flag is advisory: `take` ignores it.
    fn enabled(&self) -> bool;

    fn set_enabled(&self, enabled: bool);

    /// Release background resources. Safe to call more than once.
    fn close(&self);

    /// The algorithm's own counter: consumed permits for window and leaky
    /// limiters, available tokens for the token bucket. Zero when the
    /// implementation does not track one.
    fn count(&self) -> i64 {
        0
    }
}

/// Derive the inter-permit interval for `capacity` permits per `period`.
pub(crate) fn derive_rate(capacity: u64, period: Duration) -> Result<Duration> {
    if capacity == 0 {
        return Err(RateError::InvalidCapacity(capacity));
    }

    let nanos = period.as_nanos() / u128::from(capacity);
    let rate = Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX));
    if rate < MIN_RATE {
        return Err(RateError::RateTooFine {
            rate,
            minimum: MIN_RATE,
        });
    }
    Ok(rate)
}

/// Retry `take` until it succeeds or `deadline` passes.
pub(crate) fn retry_until<L>(limiter: &L, count: u64, deadline: Option<Instant>) -> bool
where
    L: Limiter + ?Sized,
{
    if count > limiter.capacity() {
        warn!(
            count = count,
            capacity = limiter.capacity(),
            "Requested permits exceed capacity and cannot be granted"
        );
    }

    let interval = limiter.retry_interval();
    while !limiter.take(count) {
        let pause = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                interval.min(deadline - now)
            }
            None => interval,
        };
        thread::sleep(pause);
    }
    true
}

/// Monotonic nanosecond clock anchored at limiter construction.
///
/// Lets timestamps live in plain atomics.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Clock {
    origin: Instant,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Nanoseconds between the origin and `instant`.
    pub(crate) fn nanos_at(&self, instant: Instant) -> u64 {
        instant.saturating_duration_since(self.origin).as_nanos() as u64
    }

    pub(crate) fn now(&self) -> u64 {
        self.nanos_at(Instant::now())
    }

    pub(crate) fn instant(&self, nanos: u64) -> Instant {
        self.origin + Duration::from_nanos(nanos)
    }
}
