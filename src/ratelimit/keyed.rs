//! Per-key limiting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, trace, warn};

use super::keygen::{HeaderKeygen, KeyOutcome, Keygen};
use super::limiter::{Clock, Limiter};
use super::registry::Registry;
use crate::config::LimiterConfig;

/// Response header carrying the permits left for the caller's key.
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
/// Response header carrying the key's capacity.
pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";

/// Default idle time after which a key's limiter is evicted.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);
/// Default bound on the number of keys tracked at once.
pub const DEFAULT_MAX_KEYS: usize = 10_000;

/// Outcome of checking a request against a [`KeyedLimiter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A permit was taken
    Allowed { remaining: u64, limit: u64 },
    /// The key is out of permits
    Denied { remaining: u64, limit: u64 },
    /// The request is not subject to limiting: an exempt key, a disabled
    /// limiter, or an algorithm that could not be built
    Bypassed,
    /// The keygen refused the request
    Rejected(String),
}

impl Admission {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. } | Admission::Bypassed)
    }

    /// HTTP status an adapter should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Admission::Allowed { .. } | Admission::Bypassed => 200,
            Admission::Denied { .. } => 429,
            Admission::Rejected(_) => 403,
        }
    }

    /// Quota headers for limited requests, accepted or denied alike.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        match self {
            Admission::Allowed { remaining, limit } | Admission::Denied { remaining, limit } => {
                vec![
                    (HEADER_REMAINING, remaining.to_string()),
                    (HEADER_LIMIT, limit.to_string()),
                ]
            }
            Admission::Bypassed | Admission::Rejected(_) => Vec::new(),
        }
    }
}

/// A per-key limiter and when it was last used.
struct Slot {
    limiter: Arc<dyn Limiter>,
    /// In `KeyedLimiter::clock` nanoseconds
    last_seen: AtomicU64,
}

/// A map of limiters, one per key, created on first use.
///
/// Every key gets its own limiter of the same algorithm, capacity and period,
/// built through the shared [`Registry`]. Limiters idle for longer than the
/// idle timeout are closed and evicted, and at most `max_keys` keys are
/// tracked: a new key arriving at a full map is denied.
pub struct KeyedLimiter<K> {
    registry: Arc<Registry>,
    algorithm: String,
    capacity: u64,
    period: Duration,
    enabled: bool,
    keygen: K,
    idle_timeout: Duration,
    max_keys: usize,
    clock: Clock,
    /// Time of the last idle sweep, in `clock` nanoseconds
    last_sweep: AtomicU64,
    limiters: DashMap<String, Slot>,
}

impl<K> KeyedLimiter<K> {
    /// Create a keyed limiter; no per-key limiter exists until first use.
    pub fn new(
        registry: Arc<Registry>,
        algorithm: impl Into<String>,
        capacity: u64,
        period: Duration,
        keygen: K,
    ) -> Self {
        Self {
            registry,
            algorithm: algorithm.into(),
            capacity,
            period,
            enabled: true,
            keygen,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_keys: DEFAULT_MAX_KEYS,
            clock: Clock::new(),
            last_sweep: AtomicU64::new(0),
            limiters: DashMap::new(),
        }
    }

    /// Set the enabled flag given to limiters created from now on.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Evict per-key limiters unused for longer than `idle_timeout`.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Bound the number of keys tracked at once.
    pub fn with_max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = max_keys;
        self
    }

    /// Check a request and take one permit from its key's limiter.
    pub fn check<R>(&self, request: &R) -> Admission
    where
        R: ?Sized,
        K: Keygen<R>,
    {
        let key = match self.keygen.key(request) {
            KeyOutcome::Key(key) => key,
            KeyOutcome::Exempt => return Admission::Bypassed,
            KeyOutcome::Reject(reason) => {
                debug!(reason = %reason, "Request rejected by keygen");
                return Admission::Rejected(reason);
            }
        };

        self.maybe_sweep();

        if !self.limiters.contains_key(&key) && !self.make_room() {
            warn!(
                key = %key,
                max_keys = self.max_keys,
                "Too many rate limit keys, denying new key"
            );
            return Admission::Denied {
                remaining: 0,
                limit: self.capacity,
            };
        }

        let Some(limiter) = self.limiter_for(&key) else {
            return Admission::Bypassed;
        };
        if !limiter.enabled() {
            return Admission::Bypassed;
        }

        let allowed = limiter.take(1);
        let remaining = limiter.available();
        let limit = limiter.capacity();

        if allowed {
            trace!(key = %key, remaining = remaining, "Request allowed");
            Admission::Allowed { remaining, limit }
        } else {
            debug!(key = %key, limit = limit, "Rate limit exceeded");
            Admission::Denied { remaining, limit }
        }
    }

    /// The limiter for `key`, creating it if needed.
    ///
    /// Returns `None` when the configured algorithm cannot be built.
    pub fn limiter_for(&self, key: &str) -> Option<Arc<dyn Limiter>> {
        let now = self.clock.now();
        if let Some(slot) = self.limiters.get(key) {
            slot.last_seen.store(now, Ordering::Relaxed);
            return Some(slot.limiter.clone());
        }

        // Build outside the map so a slow constructor does not hold a shard lock
        let Some(limiter) = self
            .registry
            .create(&self.algorithm, self.capacity, self.period)
        else {
            warn!(
                key = %key,
                algorithm = %self.algorithm,
                "No usable limiter for key, requests pass unlimited"
            );
            return None;
        };
        limiter.set_enabled(self.enabled);

        match self.limiters.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                // Lost the race to another caller
                limiter.close();
                let slot = entry.get();
                slot.last_seen.store(now, Ordering::Relaxed);
                Some(slot.limiter.clone())
            }
            Entry::Vacant(entry) => {
                debug!(
                    key = %key,
                    algorithm = %self.algorithm,
                    capacity = self.capacity,
                    "Creating new limiter for key"
                );
                entry.insert(Slot {
                    limiter: limiter.clone(),
                    last_seen: AtomicU64::new(now),
                });
                Some(limiter)
            }
        }
    }

    /// The existing limiter for `key`, if any.
    pub fn get(&self, key: &str) -> Option<Arc<dyn Limiter>> {
        self.limiters.get(key).map(|slot| slot.limiter.clone())
    }

    /// Close and forget the limiter for `key`.
    pub fn remove(&self, key: &str) -> bool {
        match self.limiters.remove(key) {
            Some((_, slot)) => {
                slot.limiter.close();
                true
            }
            None => false,
        }
    }

    /// Close and forget limiters unused for longer than `max_idle`.
    ///
    /// Returns the number of keys evicted.
    pub fn retain_idle(&self, max_idle: Duration) -> usize {
        let now = self.clock.now();
        let max_idle = max_idle.as_nanos() as u64;
        let mut evicted = 0;

        self.limiters.retain(|_, slot| {
            let idle = now.saturating_sub(slot.last_seen.load(Ordering::Relaxed));
            if idle > max_idle {
                slot.limiter.close();
                evicted += 1;
                false
            } else {
                true
            }
        });

        if evicted > 0 {
            info!(
                evicted = evicted,
                remaining = self.limiters.len(),
                "Evicted idle rate limit keys"
            );
        }
        evicted
    }

    /// Sweep idle keys at most once per idle timeout.
    fn maybe_sweep(&self) {
        let now = self.clock.now();
        let last = self.last_sweep.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.idle_timeout.as_nanos() as u64 {
            return;
        }
        // One caller sweeps, the others carry on
        if self
            .last_sweep
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.retain_idle(self.idle_timeout);
        }
    }

    /// Whether a new key fits, evicting idle keys if the map is full.
    fn make_room(&self) -> bool {
        if self.limiters.len() < self.max_keys {
            return true;
        }
        self.retain_idle(self.idle_timeout);
        self.limiters.len() < self.max_keys
    }

    /// Close and forget every limiter.
    pub fn close(&self) {
        self.limiters.retain(|_, slot| {
            slot.limiter.close();
            false
        });
    }

    /// Get the number of live per-key limiters.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

impl KeyedLimiter<HeaderKeygen> {
    /// Build a header-keyed limiter from one configuration entry.
    pub fn from_config(config: &LimiterConfig, registry: Arc<Registry>) -> Self {
        let keygen = HeaderKeygen::new(config.header_key_name.clone())
            .with_exception_keys(config.exception_keys.iter().cloned());

        KeyedLimiter::new(
            registry,
            config.algorithm.clone(),
            config.max_requests,
            config.interval,
            keygen,
        )
        .with_enabled(config.enabled)
        .with_idle_timeout(config.idle_timeout)
        .with_max_keys(config.max_keys)
    }
}

impl<K> std::fmt::Debug for KeyedLimiter<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLimiter")
            .field("algorithm", &self.algorithm)
            .field("capacity", &self.capacity)
            .field("period", &self.period)
            .field("enabled", &self.enabled)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_keys", &self.max_keys)
            .field("keys", &self.limiters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::registry::Algorithm;
    use std::collections::HashMap;
    use std::thread;

    fn create_test_headers(token: &str) -> HashMap<String, String> {
        HashMap::from([("X-API-KEY".to_string(), token.to_string())])
    }

    fn header_limiter(capacity: u64) -> KeyedLimiter<HeaderKeygen> {
        KeyedLimiter::new(
            Arc::new(Registry::new()),
            Algorithm::Counter,
            capacity,
            Duration::from_secs(10),
            HeaderKeygen::new("X-API-KEY").with_exception_keys(["internal"]),
        )
    }

    #[test]
    fn test_keyed_limiter_creation() {
        let limiter = header_limiter(5);
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_check_creates_limiter_per_key() {
        let limiter = header_limiter(5);

        let admission = limiter.check(&create_test_headers("a"));
        assert_eq!(
            admission,
            Admission::Allowed {
                remaining: 4,
                limit: 5
            }
        );
        limiter.check(&create_test_headers("b"));

        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn test_check_denies_over_limit() {
        let limiter = header_limiter(3);
        let headers = create_test_headers("a");

        for _ in 0..3 {
            assert!(limiter.check(&headers).is_allowed());
        }

        let admission = limiter.check(&headers);
        assert_eq!(
            admission,
            Admission::Denied {
                remaining: 0,
                limit: 3
            }
        );
        assert_eq!(admission.status_code(), 429);
        assert_eq!(
            admission.headers(),
            vec![
                (HEADER_REMAINING, "0".to_string()),
                (HEADER_LIMIT, "3".to_string())
            ]
        );

        // Other keys are unaffected
        assert!(limiter.check(&create_test_headers("b")).is_allowed());
    }

    #[test]
    fn test_exempt_and_rejected_requests() {
        let limiter = header_limiter(1);

        let admission = limiter.check(&create_test_headers("internal"));
        assert_eq!(admission, Admission::Bypassed);
        assert!(admission.headers().is_empty());

        let admission = limiter.check(&HashMap::<String, String>::new());
        assert!(matches!(admission, Admission::Rejected(_)));
        assert_eq!(admission.status_code(), 403);
        assert!(!admission.is_allowed());

        assert!(limiter.is_empty());
    }

    #[test]
    fn test_disabled_limiter_is_bypassed() {
        let limiter = header_limiter(1).with_enabled(false);
        let headers = create_test_headers("a");

        for _ in 0..5 {
            assert_eq!(limiter.check(&headers), Admission::Bypassed);
        }
        let inner = limiter.get("a").unwrap();
        assert_eq!(inner.available(), 1);
    }

    #[test]
    fn test_unknown_algorithm_fails_open() {
        let limiter = KeyedLimiter::new(
            Arc::new(Registry::new()),
            "not-exists",
            1,
            Duration::from_secs(1),
            |key: &str| KeyOutcome::Key(key.to_string()),
        );

        assert_eq!(limiter.check("a"), Admission::Bypassed);
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_remove_and_close() {
        let limiter = KeyedLimiter::new(
            Arc::new(Registry::new()),
            Algorithm::TokenBucket,
            10,
            Duration::from_secs(1),
            |key: &str| KeyOutcome::Key(key.to_string()),
        );
        limiter.check("a");
        limiter.check("b");
        limiter.check("c");

        assert!(limiter.remove("a"));
        assert!(!limiter.remove("a"));
        assert_eq!(limiter.len(), 2);

        limiter.close();
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_concurrent_checks_share_one_limiter() {
        let limiter = Arc::new(header_limiter(100));
        // Open the window before the threads race for it
        assert!(limiter.check(&create_test_headers("shared")).is_allowed());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = limiter.clone();
                thread::spawn(move || {
                    let headers = create_test_headers("shared");
                    (0..50)
                        .filter(|_| limiter.check(&headers).is_allowed())
                        .count()
                })
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 99);
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn test_from_config() {
        let config = LimiterConfig {
            name: "by-api-key".to_string(),
            description: String::new(),
            enabled: true,
            algorithm: "leaky-bucket".to_string(),
            interval: Duration::from_secs(1),
            max_requests: 2,
            header_key_name: "X-API-KEY".to_string(),
            exception_keys: vec!["internal".to_string()],
            idle_timeout: Duration::from_secs(30),
            max_keys: 2,
        };
        let limiter = KeyedLimiter::from_config(&config, Arc::new(Registry::new()));

        assert_eq!(limiter.algorithm(), "leaky-bucket");
        assert_eq!(limiter.capacity(), 2);
        assert_eq!(
            limiter.check(&create_test_headers("internal")),
            Admission::Bypassed
        );
        assert!(limiter.check(&create_test_headers("a")).is_allowed());
        assert!(limiter.check(&create_test_headers("b")).is_allowed());
        assert!(!limiter.check(&create_test_headers("c")).is_allowed());
    }

    fn token_bucket_limiter() -> KeyedLimiter<impl Fn(&str) -> KeyOutcome + Send + Sync> {
        KeyedLimiter::new(
            Arc::new(Registry::new()),
            Algorithm::TokenBucket,
            10,
            Duration::from_secs(1),
            |key: &str| KeyOutcome::Key(key.to_string()),
        )
    }

    #[test]
    fn test_new_keys_denied_when_full() {
        let limiter = token_bucket_limiter().with_max_keys(3);

        for key in ["a", "b", "c"] {
            assert!(limiter.check(key).is_allowed());
        }

        let admission = limiter.check("d");
        assert_eq!(
            admission,
            Admission::Denied {
                remaining: 0,
                limit: 10
            }
        );
        assert_eq!(admission.status_code(), 429);
        assert_eq!(limiter.len(), 3);
        assert!(limiter.get("d").is_none());

        // Known keys keep working
        assert!(limiter.check("a").is_allowed());
        limiter.close();
    }

    #[test]
    fn test_many_distinct_keys_stay_bounded() {
        let limiter = token_bucket_limiter().with_max_keys(50);

        let allowed = (0..2000)
            .filter(|i| limiter.check(format!("key-{}", i).as_str()).is_allowed())
            .count();

        assert_eq!(allowed, 50);
        assert_eq!(limiter.len(), 50);
        limiter.close();
    }

    #[test]
    fn test_retain_idle_closes_unused_limiters() {
        let limiter = token_bucket_limiter();
        limiter.check("a");
        limiter.check("b");

        thread::sleep(Duration::from_millis(40));
        limiter.check("b");

        assert_eq!(limiter.retain_idle(Duration::from_millis(20)), 1);
        assert!(limiter.get("a").is_none());
        assert!(limiter.get("b").is_some());
        assert_eq!(limiter.retain_idle(Duration::from_secs(10)), 0);
        limiter.close();
    }

    #[test]
    fn test_check_sweeps_idle_keys() {
        let limiter = token_bucket_limiter().with_idle_timeout(Duration::from_millis(30));
        limiter.check("a");
        limiter.check("b");
        assert_eq!(limiter.len(), 2);

        thread::sleep(Duration::from_millis(60));
        assert!(limiter.check("c").is_allowed());

        assert_eq!(limiter.len(), 1);
        assert!(limiter.get("c").is_some());
        limiter.close();
    }

    #[test]
    fn test_full_map_makes_room_from_idle_keys() {
        let limiter = token_bucket_limiter()
            .with_max_keys(2)
            .with_idle_timeout(Duration::from_millis(30));
        limiter.check("a");
        limiter.check("b");

        thread::sleep(Duration::from_millis(60));
        // Keep the periodic sweep from running first
        limiter.last_sweep.store(limiter.clock.now(), Ordering::Relaxed);

        assert!(limiter.check("c").is_allowed());
        assert_eq!(limiter.len(), 1);
        limiter.close();
    }
}
