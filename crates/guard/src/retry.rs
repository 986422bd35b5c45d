//! Bounded exponential backoff.
//!
//! The core policy: transient failures (backend unavailable, timeout, rate
//! limited, circuit open) are retried on a `1s, ×2, max 30s` schedule for at
//! most 3 attempts, then surfaced to the caller.  A small random jitter
//! spreads retries from concurrent sessions.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RetrySchedule {
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Jitter fraction applied to each delay (0.0 disables; deterministic
    /// tests use that).
    pub jitter: f64,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
            jitter: 0.1,
        }
    }
}

impl RetrySchedule {
    /// Backoff delay applied after attempt `attempt` (0-based), before
    /// jitter.  Returns `None` when no further attempt is allowed.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt + 1 >= self.max_attempts {
            return None;
        }
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        Some(Duration::from_secs_f64(
            scaled.min(self.max_delay.as_secs_f64()),
        ))
    }

    fn jittered(&self, base: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = base.as_secs_f64() * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
    }

    /// Run `op` until it succeeds, returns a non-retryable error, or the
    /// attempt budget is exhausted.  The last error is returned unchanged so
    /// the caller can map it (e.g. to `GenerationUnavailable`).
    pub async fn run<T, E, F, Fut>(&self, mut is_retryable: impl FnMut(&E) -> bool, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !is_retryable(&err) {
                        return Err(err);
                    }
                    match self.delay_after(attempt) {
                        Some(delay) => {
                            let delay = self.jittered(delay);
                            debug!(attempt = attempt + 1, ?delay, "transient failure; backing off");
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        None => return Err(err),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn no_jitter() -> RetrySchedule {
        RetrySchedule {
            jitter: 0.0,
            ..RetrySchedule::default()
        }
    }

    #[test]
    fn schedule_doubles_and_caps() {
        let schedule = RetrySchedule {
            max_attempts: 8,
            jitter: 0.0,
            ..RetrySchedule::default()
        };
        assert_eq!(schedule.delay_after(0), Some(Duration::from_secs(1)));
        assert_eq!(schedule.delay_after(1), Some(Duration::from_secs(2)));
        assert_eq!(schedule.delay_after(2), Some(Duration::from_secs(4)));
        assert_eq!(schedule.delay_after(5), Some(Duration::from_secs(30)), "capped");
        assert_eq!(schedule.delay_after(7), None, "budget exhausted");
    }

    #[test]
    fn default_allows_three_attempts() {
        let schedule = RetrySchedule::default();
        assert!(schedule.delay_after(0).is_some());
        assert!(schedule.delay_after(1).is_some());
        assert!(schedule.delay_after(2).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let attempts = AtomicU32::new(0);
        let result: Result<u32, &str> = no_jitter()
            .run(
                |_| true,
                || async {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n < 2 { Err("unavailable") } else { Ok(n) }
                },
            )
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_attempts_and_returns_last_error() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), &str> = no_jitter()
            .run(
                |_| true,
                || async {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err("still down")
                },
            )
            .await;
        assert_eq!(result, Err("still down"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_surface_immediately() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), &str> = no_jitter()
            .run(
                |e| *e != "validation",
                || async {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err("validation")
                },
            )
            .await;
        assert_eq!(result, Err("validation"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
