//! Rate - pluggable in-process rate limiting
//!
//! This crate provides three rate limiting algorithms behind one [`Limiter`]
//! contract: a fixed-window counter, a leaky bucket and a token bucket. A
//! [`Registry`] maps algorithm names to constructors so custom algorithms can
//! be plugged in at runtime, and [`KeyedLimiter`] keeps one limiter per caller
//! key for request-handling code.
//!
//! ```no_run
//! use std::time::Duration;
//! use rate::{Algorithm, Limiter, Registry};
//!
//! let registry = Registry::new();
//! let limiter = registry
//!     .create(Algorithm::LeakyBucket, 100, Duration::from_secs(1))
//!     .expect("valid parameters");
//!
//! if !limiter.take(1) {
//!     println!("slow down");
//! }
//! limiter.close();
//! ```

pub mod config;
pub mod error;
pub mod ratelimit;

pub use config::{LimiterConfig, LimitsConfig};
pub use error::{RateError, Result};
pub use ratelimit::{count_of, Admission, Algorithm, KeyedLimiter, Limiter, Registry};
