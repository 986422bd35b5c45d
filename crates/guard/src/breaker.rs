//! Circuit breaker: Closed → Open → HalfOpen → Closed.
//!
//! Closed trips to Open after `failure_threshold` consecutive failures.
//! Open fails fast without touching the downstream until `reset_timeout`
//! elapses, then admits trial calls in HalfOpen.  `half_open_requests`
//! consecutive successes close the circuit; any failure re-opens it.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::{GuardError, GuardResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_requests: 2,
        }
    }
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    resource: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(resource: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            resource: resource.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).state
    }

    /// Admission check.  Must be called before the downstream; in Open it
    /// fails fast with [`GuardError::CircuitOpen`] without any downstream
    /// invocation.
    pub fn check(&self) -> GuardResult<()> {
        self.check_at(Instant::now())
    }

    pub fn check_at(&self, now: Instant) -> GuardResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    info!(resource = %self.resource, "circuit half-open: admitting trial calls");
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    Ok(())
                } else {
                    Err(GuardError::CircuitOpen {
                        resource: self.resource.clone(),
                    })
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_requests {
                    info!(resource = %self.resource, "circuit closed after successful trial calls");
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        resource = %self.resource,
                        failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                warn!(resource = %self.resource, "trial call failed; circuit re-opened");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.half_open_successes = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Run `op` under the breaker: admission check, then success/failure
    /// bookkeeping keyed on the result.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<Result<T, E>, GuardError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.check()?;
        let outcome = op().await;
        match &outcome {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        Ok(outcome)
    }
}
