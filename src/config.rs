//! Limiter configuration.
//!
//! A limits file lists one entry per keyed limiter:
//!
//! ```yaml
//! rate-limits:
//!   - name: by-api-key
//!     algorithm: token-bucket
//!     interval: 1s
//!     max-requests: 30
//!     header-key-name: X-API-KEY
//!     exception-keys: [internal-test-key]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RateError, Result};
use crate::ratelimit::{Algorithm, Registry, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_KEYS};

/// Configuration for one keyed limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LimiterConfig {
    /// Name of this limiter
    #[serde(default)]
    pub name: String,

    /// Free-form description
    #[serde(default)]
    pub description: String,

    /// Whether requests are routed through the limiter
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Registry name of the algorithm
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    /// Period over which `max_requests` permits are granted
    #[serde(with = "humantime_serde", default = "default_interval")]
    pub interval: Duration,

    /// Permits per key per interval
    pub max_requests: u64,

    /// Request header whose value keys the limiter
    #[serde(default)]
    pub header_key_name: String,

    /// Header values exempt from limiting
    #[serde(default)]
    pub exception_keys: Vec<String>,

    /// Per-key limiters unused for this long are evicted
    #[serde(with = "humantime_serde", default = "default_idle_timeout")]
    pub idle_timeout: Duration,

    /// Most keys tracked at once; new keys beyond it are denied
    #[serde(default = "default_max_keys")]
    pub max_keys: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_algorithm() -> String {
    Algorithm::TokenBucket.into()
}

fn default_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_idle_timeout() -> Duration {
    DEFAULT_IDLE_TIMEOUT
}

fn default_max_keys() -> usize {
    DEFAULT_MAX_KEYS
}

impl LimiterConfig {
    /// Check the entry against the algorithms known to `registry`.
    pub fn validate(&self, registry: &Registry) -> Result<()> {
        let label = if self.name.is_empty() {
            "<unnamed>"
        } else {
            self.name.as_str()
        };

        if self.header_key_name.trim().is_empty() {
            return Err(RateError::Config(format!(
                "limiter {}: header-key-name must not be empty",
                label
            )));
        }
        if !registry.contains(&self.algorithm) {
            return Err(RateError::Config(format!(
                "limiter {}: unknown algorithm {:?}",
                label, self.algorithm
            )));
        }

        if self.max_keys == 0 {
            return Err(RateError::Config(format!(
                "limiter {}: max-keys must be positive",
                label
            )));
        }

        crate::ratelimit::derive_rate(self.max_requests, self.interval)
            .map(|_| ())
            .map_err(|e| RateError::Config(format!("limiter {}: {}", label, e)))
    }
}

/// A set of limiter entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LimitsConfig {
    #[serde(default)]
    pub rate_limits: Vec<LimiterConfig>,
}

const RATE_LIMITS_KEY: &str = "rate-limits";

impl LimitsConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    ///
    /// A document without a `rate-limits` key is read as a single limiter
    /// entry.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let document: serde_yaml::Value = serde_yaml::from_str(yaml)
            .map_err(|e| RateError::Config(format!("Failed to parse rate limit config: {}", e)))?;

        if document.get(RATE_LIMITS_KEY).is_some() {
            return serde_yaml::from_value(document).map_err(|e| {
                RateError::Config(format!("Failed to parse rate limit config: {}", e))
            });
        }

        let limiter: LimiterConfig = serde_yaml::from_value(document)
            .map_err(|e| RateError::Config(format!("Failed to parse limiter entry: {}", e)))?;
        Ok(Self {
            rate_limits: vec![limiter],
        })
    }

    /// Validate every entry and reject duplicate names.
    pub fn validate(&self, registry: &Registry) -> Result<()> {
        if self.rate_limits.is_empty() {
            return Err(RateError::Config("no rate limits configured".to_string()));
        }

        let mut seen = HashSet::new();
        for limiter in &self.rate_limits {
            limiter.validate(registry)?;
            if !limiter.name.is_empty() && !seen.insert(limiter.name.as_str()) {
                return Err(RateError::Config(format!(
                    "duplicate limiter name {:?}",
                    limiter.name
                )));
            }
        }
        Ok(())
    }
}
