//! Algorithm registry.
//!
//! Maps algorithm names to limiter constructors so callers pick an algorithm
//! by name and new algorithms plug in without touching call sites.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error};

use super::counter::FixedWindowCounter;
use super::leaky_bucket::LeakyBucket;
use super::limiter::Limiter;
use super::token_bucket::TokenBucket;
use crate::error::{RateError, Result};

/// Built-in algorithms. Their names are reserved in every [`Registry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// Fixed-window counter
    Counter,
    /// Leaky bucket
    LeakyBucket,
    /// Token bucket
    TokenBucket,
}

impl Algorithm {
    /// All built-in algorithms.
    pub const ALL: [Algorithm; 3] = [
        Algorithm::Counter,
        Algorithm::LeakyBucket,
        Algorithm::TokenBucket,
    ];

    /// The registry name of this algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Counter => "counter",
            Algorithm::LeakyBucket => "leaky-bucket",
            Algorithm::TokenBucket => "token-bucket",
        }
    }

    /// Whether `name` belongs to a built-in algorithm.
    pub fn is_reserved(name: &str) -> bool {
        name.parse::<Algorithm>().is_ok()
    }

    fn construct(self, capacity: u64, period: Duration) -> Result<Arc<dyn Limiter>> {
        Ok(match self {
            Algorithm::Counter => Arc::new(FixedWindowCounter::new(capacity, period)?),
            Algorithm::LeakyBucket => Arc::new(LeakyBucket::new(capacity, period)?),
            Algorithm::TokenBucket => Arc::new(TokenBucket::new(capacity, period)?),
        })
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AsRef<str> for Algorithm {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl From<Algorithm> for String {
    fn from(algorithm: Algorithm) -> Self {
        algorithm.as_str().to_string()
    }
}

impl FromStr for Algorithm {
    type Err = RateError;

    fn from_str(s: &str) -> Result<Self> {
        Algorithm::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| RateError::UnknownAlgorithm(s.to_string()))
    }
}

/// Builds a limiter from a capacity and a period.
pub type Constructor = Arc<dyn Fn(u64, Duration) -> Result<Arc<dyn Limiter>> + Send + Sync>;

/// A name -> constructor table.
///
/// A new registry already knows the three built-in algorithms. It is meant to
/// be built once at startup and shared by reference; lookups and
/// registrations may run concurrently.
pub struct Registry {
    constructors: RwLock<HashMap<String, Constructor>>,
}

impl Registry {
    /// Create a registry holding the built-in algorithms.
    pub fn new() -> Self {
        let constructors = Algorithm::ALL
            .into_iter()
            .map(|algorithm| {
                let constructor: Constructor = Arc::new(move |capacity, period| {
                    algorithm.construct(capacity, period)
                });
                (algorithm.as_str().to_string(), constructor)
            })
            .collect();

        Self {
            constructors: RwLock::new(constructors),
        }
    }

    /// Build a limiter, or `None` if the algorithm is unknown or rejects the
    /// parameters.
    ///
    /// Construction failures are logged; use [`try_create`](Self::try_create)
    /// to get the error itself.
    pub fn create(
        &self,
        algorithm: impl AsRef<str>,
        capacity: u64,
        period: Duration,
    ) -> Option<Arc<dyn Limiter>> {
        let algorithm = algorithm.as_ref();
        match self.try_create(algorithm, capacity, period) {
            Ok(limiter) => Some(limiter),
            Err(RateError::UnknownAlgorithm(_)) => {
                debug!(algorithm = %algorithm, "No limiter registered under this name");
                None
            }
            Err(e) => {
                error!(
                    algorithm = %algorithm,
                    capacity = capacity,
                    period = ?period,
                    error = %e,
                    "Failed to construct limiter"
                );
                None
            }
        }
    }

    /// Build a limiter, reporting why it could not be built.
    pub fn try_create(
        &self,
        algorithm: impl AsRef<str>,
        capacity: u64,
        period: Duration,
    ) -> Result<Arc<dyn Limiter>> {
        let algorithm = algorithm.as_ref();
        // Release the lock before running the constructor, which may itself
        // use this registry
        let constructor = self
            .constructors
            .read()
            .get(algorithm)
            .cloned()
            .ok_or_else(|| RateError::UnknownAlgorithm(algorithm.to_string()))?;

        let limiter = constructor(capacity, period)?;
        debug!(
            algorithm = %algorithm,
            capacity = capacity,
            period = ?period,
            "Created limiter"
        );
        Ok(limiter)
    }

    /// Install a custom algorithm.
    ///
    /// Fails if `name` is a built-in algorithm or is already registered.
    pub fn register<F>(&self, name: impl Into<String>, constructor: F) -> Result<()>
    where
        F: Fn(u64, Duration) -> Result<Arc<dyn Limiter>> + Send + Sync + 'static,
    {
        let name = name.into();
        if Algorithm::is_reserved(&name) {
            return Err(RateError::ReservedAlgorithm(name));
        }

        let mut constructors = self.constructors.write();
        if constructors.contains_key(&name) {
            return Err(RateError::AlgorithmExists(name));
        }

        debug!(algorithm = %name, "Registered limiter algorithm");
        constructors.insert(name, Arc::new(constructor));
        Ok(())
    }

    /// Remove a custom algorithm. Unknown and built-in names are ignored.
    pub fn unregister(&self, name: &str) {
        if Algorithm::is_reserved(name) {
            return;
        }
        if self.constructors.write().remove(name).is_some() {
            debug!(algorithm = %name, "Unregistered limiter algorithm");
        }
    }

    /// Whether an algorithm is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.constructors.read().contains_key(name)
    }

    /// Registered algorithm names, sorted.
    pub fn algorithms(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("algorithms", &self.algorithms())
            .finish()
    }
}

/// The limiter's own counter, widened to `i64`.
///
/// Consumed permits for the counter and leaky bucket, available tokens for the
/// token bucket, zero for limiters that track neither.
pub fn count_of(limiter: &dyn Limiter) -> i64 {
    limiter.count()
}
