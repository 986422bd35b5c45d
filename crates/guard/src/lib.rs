//! Resource guards: rate limiters, circuit breaker, bounded retry, and a
//! generic bounded connection pool.
//!
//! These are the only places the core blocks on resource acquisition.
//! Every waiting path carries a deadline; on expiry the caller gets a typed
//! error and any held resource is released.

pub mod breaker;
pub mod pool;
pub mod rate;
pub mod retry;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use pool::{Pool, PoolConfig, Pooled};
pub use rate::{SlidingWindow, TokenBucket};
pub use retry::RetrySchedule;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("rate limit exceeded for {resource}")]
    RateLimited { resource: String },

    #[error("circuit open for {resource}")]
    CircuitOpen { resource: String },

    #[error("timed out after {0} ms waiting for resource")]
    Timeout(u64),

    #[error("failed to open pooled resource: {0}")]
    Resource(String),
}

pub type GuardResult<T> = Result<T, GuardError>;
