//! Single-flight deduplication.
//!
//! For a given key, at most one computation runs at a time; every caller
//! that arrives while it is in flight receives the same result.  The
//! computation runs in a detached task, so a waiter dropping its future
//! (cancellation) never cancels the shared work for the others.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tracing::trace;

/// Keyed single-flight runner.  `T` must be cheap to clone — results are
/// broadcast to every waiter.
pub struct SingleFlight<T: Clone + Send + Sync + 'static> {
    in_flight: Mutex<HashMap<String, watch::Receiver<Option<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `compute` for `key`, or wait on the computation already running
    /// for it.  All callers receive the same value.
    pub async fn run<F, Fut>(self: &Arc<Self>, key: &str, compute: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T> + Send + 'static,
    {
        let mut rx = {
            let mut table = self.in_flight.lock().await;
            if let Some(rx) = table.get(key) {
                trace!(key, "joining in-flight computation");
                rx.clone()
            } else {
                let (tx, rx) = watch::channel(None);
                table.insert(key.to_string(), rx.clone());

                let this = Arc::clone(self);
                let key_owned = key.to_string();
                let fut = compute();
                tokio::spawn(async move {
                    let value = fut.await;
                    // Remove the slot before broadcasting so a caller that
                    // arrives after completion starts a fresh computation.
                    this.in_flight.lock().await.remove(&key_owned);
                    let _ = tx.send(Some(value));
                });
                rx
            }
        };

        // The initial value is None; wait until the computation publishes.
        loop {
            if let Some(value) = rx.borrow().clone() {
                return value;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without publishing — the compute task
                // panicked.  Borrow once more in case a value raced in.
                if let Some(value) = rx.borrow().clone() {
                    return value;
                }
                panic!("single-flight computation panicked before producing a result");
            }
        }
    }

    /// Number of computations currently in flight (for probes/tests).
    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn concurrent_callers_share_one_computation() {
        let flight: Arc<SingleFlight<String>> = Arc::new(SingleFlight::new());
        let invocations = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flight = Arc::clone(&flight);
            let invocations = Arc::clone(&invocations);
            handles.push(tokio::spawn(async move {
                flight
                    .run("fp-1", move || async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        "generated".to_string()
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), "generated");
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 1, "generator ran more than once");
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let flight: Arc<SingleFlight<u32>> = Arc::new(SingleFlight::new());
        let a = flight.run("alpha", || async { 1 }).await;
        let b = flight.run("beta", || async { 2 }).await;
        assert_eq!((a, b), (1, 2));
    }

    #[tokio::test]
    async fn slot_clears_after_completion() {
        let flight: Arc<SingleFlight<u32>> = Arc::new(SingleFlight::new());
        flight.run("fp", || async { 7 }).await;
        assert_eq!(flight.in_flight_count().await, 0);

        // A later call recomputes rather than replaying the old result.
        let second = flight.run("fp", || async { 9 }).await;
        assert_eq!(second, 9);
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_cancel_shared_work() {
        let flight: Arc<SingleFlight<u32>> = Arc::new(SingleFlight::new());
        let started = Arc::new(AtomicUsize::new(0));

        let leader = {
            let flight = Arc::clone(&flight);
            let started = Arc::clone(&started);
            tokio::spawn(async move {
                flight
                    .run("fp", move || async move {
                        started.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(80)).await;
                        42
                    })
                    .await
            })
        };

        // Give the leader time to register, then spawn-and-abort a waiter.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let waiter = {
            let flight = Arc::clone(&flight);
            tokio::spawn(async move { flight.run("fp", || async { 0 }).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter.abort();

        assert_eq!(leader.await.unwrap(), 42);
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }
}
