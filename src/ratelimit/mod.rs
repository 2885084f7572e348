//! Rate limiting algorithms, the algorithm registry and per-key limiting.

mod counter;
mod keyed;
mod keygen;
mod leaky_bucket;
mod limiter;
mod registry;
mod token_bucket;

pub use counter::FixedWindowCounter;
pub use keyed::{
    Admission, KeyedLimiter, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_KEYS, HEADER_LIMIT, HEADER_REMAINING,
};
pub use keygen::{HeaderKeygen, HeaderLookup, KeyOutcome, Keygen};
pub use leaky_bucket::LeakyBucket;
pub use limiter::{Limiter, MIN_RATE};
pub use registry::{count_of, Algorithm, Constructor, Registry};
pub use token_bucket::TokenBucket;

pub(crate) use limiter::derive_rate;
