//! Token-bucket and sliding-window rate limiters.
//!
//! Time is injected via `_at` suffixed methods for deterministic testing;
//! production callers use the convenience methods without the suffix.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::{GuardError, GuardResult};

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket `(capacity, refill_per_sec)`.
///
/// `consume` blocks cooperatively (yielding the task, never the thread)
/// until enough tokens accumulate or the deadline passes.
pub struct TokenBucket {
    resource: String,
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(resource: impl Into<String>, capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            resource: resource.into(),
            capacity: f64::from(capacity),
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_config(resource: impl Into<String>, config: &sentra_config::BucketConfig) -> Self {
        Self::new(resource, config.capacity, config.refill_per_sec)
    }

    /// Take `n` tokens immediately if available.
    pub fn try_consume(&self, n: u32) -> bool {
        self.try_consume_at(n, Instant::now())
    }

    pub fn try_consume_at(&self, n: u32, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        self.refill(&mut state, now);
        let need = f64::from(n);
        if state.tokens + 1e-9 >= need {
            state.tokens -= need;
            true
        } else {
            false
        }
    }

    /// Take `n` tokens, waiting for refill up to `timeout`.
    /// Expiry returns [`GuardError::RateLimited`].
    pub async fn consume(&self, n: u32, timeout: Duration) -> GuardResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            let wait = {
                let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
                self.refill(&mut state, now);
                let need = f64::from(n);
                if state.tokens + 1e-9 >= need {
                    state.tokens -= need;
                    return Ok(());
                }
                let deficit = need - state.tokens;
                Duration::from_secs_f64(deficit / self.refill_per_sec.max(1e-9))
            };

            let next = now + wait;
            if next > deadline {
                trace!(resource = %self.resource, "token bucket deadline exceeded");
                return Err(GuardError::RateLimited {
                    resource: self.resource.clone(),
                });
            }
            tokio::time::sleep_until(next).await;
        }
    }

    /// Tokens currently available (after refill accounting).
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }
}

/// Sliding window `(max_requests, window)`: `allow` is true while the count
/// of requests inside `[now - window, now]` stays below the limit.
pub struct SlidingWindow {
    max_requests: usize,
    window: Duration,
    events: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests: max_requests as usize,
            window,
            events: Mutex::new(VecDeque::new()),
        }
    }

    pub fn from_config(config: &sentra_config::WindowConfig) -> Self {
        Self::new(config.max_requests, Duration::from_millis(config.window_ms))
    }

    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&self, now: Instant) -> bool {
        let mut events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        while let Some(front) = events.front() {
            if now.saturating_duration_since(*front) > self.window {
                events.pop_front();
            } else {
                break;
            }
        }

        if events.len() < self.max_requests {
            events.push_back(now);
            true
        } else {
            false
        }
    }

    /// Requests currently inside the window.
    pub fn in_window(&self) -> usize {
        let now = Instant::now();
        let mut events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        while let Some(front) = events.front() {
            if now.saturating_duration_since(*front) > self.window {
                events.pop_front();
            } else {
                break;
            }
        }
        events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bucket_grants_up_to_capacity_immediately() {
        let bucket = TokenBucket::new("llm", 10, 1.0);
        for _ in 0..10 {
            assert!(bucket.try_consume(1));
        }
        assert!(!bucket.try_consume(1), "11th token must not exist");
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_over_time() {
        let bucket = TokenBucket::new("llm", 2, 1.0);
        assert!(bucket.try_consume(2));
        assert!(!bucket.try_consume(1));

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(bucket.try_consume(1));
    }

    #[tokio::test(start_paused = true)]
    async fn consume_blocks_until_refill() {
        let bucket = TokenBucket::new("llm", 1, 10.0);
        bucket.consume(1, Duration::from_secs(5)).await.unwrap();

        let start = Instant::now();
        bucket.consume(1, Duration::from_secs(5)).await.unwrap();
        // 10 tokens/sec → one token arrives after ~100 ms of (virtual) time.
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(90), "waited only {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn consume_times_out_as_rate_limited() {
        let bucket = TokenBucket::new("llm", 1, 0.1);
        bucket.consume(1, Duration::from_secs(1)).await.unwrap();

        let result = bucket.consume(1, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(GuardError::RateLimited { .. })));
    }

    /// Long-run accepted rate under saturation tracks the refill rate ±5%.
    #[tokio::test(start_paused = true)]
    async fn bucket_steady_state_rate_matches_refill() {
        let bucket = TokenBucket::new("llm", 10, 5.0);
        // Burn the initial burst so only refill sustains acceptance.
        assert!(bucket.try_consume(10));

        let mut accepted = 0u32;
        let ticks = 60_000u64; // 60 simulated seconds, 1 ms resolution
        for _ in 0..ticks {
            tokio::time::advance(Duration::from_millis(1)).await;
            if bucket.try_consume(1) {
                accepted += 1;
            }
        }

        let expected = 5.0 * 60.0;
        let rate_error = (f64::from(accepted) - expected).abs() / expected;
        assert!(rate_error < 0.05, "accepted {accepted}, expected ≈{expected}");
    }

    #[tokio::test(start_paused = true)]
    async fn window_allows_up_to_max_then_blocks() {
        let window = SlidingWindow::new(5, Duration::from_secs(60));
        for _ in 0..5 {
            assert!(window.allow());
        }
        assert!(!window.allow());
        assert_eq!(window.in_window(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn window_frees_slots_as_time_passes() {
        let window = SlidingWindow::new(2, Duration::from_secs(10));
        assert!(window.allow());
        assert!(window.allow());
        assert!(!window.allow());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(window.allow());
    }

    /// Long-run accepted rate under saturation equals max/window ±5%.
    #[tokio::test(start_paused = true)]
    async fn window_steady_state_rate_matches_quota() {
        let window = SlidingWindow::new(10, Duration::from_secs(1));
        let mut accepted = 0u32;
        let ticks = 30_000u64; // 30 simulated seconds, 1 ms resolution
        for _ in 0..ticks {
            tokio::time::advance(Duration::from_millis(1)).await;
            if window.allow() {
                accepted += 1;
            }
        }

        let expected = 10.0 * 30.0;
        let rate_error = (f64::from(accepted) - expected).abs() / expected;
        assert!(rate_error < 0.05, "accepted {accepted}, expected ≈{expected}");
    }
}
