//! Token bucket with a background refill thread.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::limiter::{derive_rate, Limiter, RETRY_SLACK};
use crate::error::{RateError, Result};

/// A limiter holding up to `capacity` tokens, refilled one at a time.
///
/// The bucket starts full. A dedicated thread adds one token every
/// `period / capacity` until the bucket is closed or dropped. A take that
/// overdraws the bucket is refused and empties it: the debt is not kept.
#[derive(Debug)]
pub struct TokenBucket {
    enabled: AtomicBool,
    capacity: u64,
    rate: Duration,
    available: Arc<AtomicI64>,
    refiller: Mutex<Option<Refiller>>,
}

/// Handle to the refill thread.
#[derive(Debug)]
struct Refiller {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

impl TokenBucket {
    /// Create a full bucket refilling `capacity` tokens per `period`.
    pub fn new(capacity: u64, period: Duration) -> Result<Self> {
        let rate = derive_rate(capacity, period)?;
        let limit = i64::try_from(capacity).map_err(|_| RateError::InvalidCapacity(capacity))?;

        let available = Arc::new(AtomicI64::new(limit));
        let (shutdown, signal) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("token-bucket-refill".to_string())
            .spawn({
                let available = available.clone();
                move || refill_loop(&available, limit, rate, signal)
            })?;

        debug!(
            capacity = capacity,
            rate = ?rate,
            "Started token bucket refill thread"
        );

        Ok(Self {
            enabled: AtomicBool::new(true),
            capacity,
            rate,
            available,
            refiller: Mutex::new(Some(Refiller { shutdown, handle })),
        })
    }

    /// Interval between two refills.
    pub fn rate(&self) -> Duration {
        self.rate
    }

    /// Whether the refill thread has been stopped.
    pub fn is_closed(&self) -> bool {
        self.refiller.lock().is_none()
    }
}

/// Add a token every `rate` until `signal` fires or its sender is dropped.
///
/// Missed ticks are skipped rather than replayed.
fn refill_loop(available: &AtomicI64, capacity: i64, rate: Duration, signal: Receiver<()>) {
    let mut next = Instant::now() + rate;
    loop {
        match signal.recv_timeout(next.saturating_duration_since(Instant::now())) {
            Err(RecvTimeoutError::Timeout) => {
                refill(available, capacity);
                next += rate;
                let now = Instant::now();
                if next < now {
                    next = now + rate;
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Add one token, never exceeding `capacity`.
fn refill(available: &AtomicI64, capacity: i64) {
    let _ = available.fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
        (tokens < capacity).then(|| tokens + 1)
    });
}

impl Limiter for TokenBucket {
    fn take(&self, count: u64) -> bool {
        let Ok(count) = i64::try_from(count) else {
            return false;
        };

        // An overdraw empties the bucket
        let before = self
            .available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |tokens| {
                Some(if tokens >= count { tokens - count } else { 0 })
            })
            .unwrap_or_else(|tokens| tokens);
        let admitted = before >= count;

        trace!(
            requested = count,
            before = before,
            admitted = admitted,
            "Token bucket take"
        );
        admitted
    }

    fn retry_interval(&self) -> Duration {
        self.rate.saturating_sub(RETRY_SLACK)
    }

    fn available(&self) -> u64 {
        self.available.load(Ordering::Acquire).max(0) as u64
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

    /// Stop the refill thread and wait for it to exit.
    ///
    /// Tokens left in the bucket can still be taken afterwards, but none are
    /// added.
    fn close(&self) {
        let Some(refiller) = self.refiller.lock().take() else {
            return;
        };

        let _ = refiller.shutdown.send(());
        if refiller.handle.join().is_err() {
            warn!("Token bucket refill thread panicked");
        }
        debug!(capacity = self.capacity, "Stopped token bucket refill thread");
    }

    fn count(&self) -> i64 {
        self.available.load(Ordering::Acquire).max(0)
    }
}

impl Drop for TokenBucket {
    fn drop(&mut self) {
        self.close();
    }
}
