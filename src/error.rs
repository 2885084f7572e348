//! Error types for the rate limiting library.

use std::time::Duration;
use thiserror::Error;

/// Main error type for limiter construction, registration and configuration.
///
/// Running out of permits is not an error: `take` reports it as `false`.
#[derive(Error, Debug)]
pub enum RateError {
    /// Capacity must allow at least one permit per period
    #[error("Invalid capacity: {0}, a limiter needs at least one permit")]
    InvalidCapacity(u64),

    /// The derived inter-permit interval is too small to be honored
    #[error("Rate too fine: {rate:?} per permit, the minimum is {minimum:?}")]
    RateTooFine { rate: Duration, minimum: Duration },

    /// One of the built-in algorithm names was used for a custom registration
    #[error("Reserved algorithm name: {0}")]
    ReservedAlgorithm(String),

    /// An algorithm with this name is already registered
    #[error("Algorithm already registered: {0}")]
    AlgorithmExists(String),

    /// No constructor is registered under this name
    #[error("Unknown algorithm: {0}")]
    UnknownAlgorithm(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for rate limiting operations.
pub type Result<T> = std::result::Result<T, RateError>;
