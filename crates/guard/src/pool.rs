//! Generic bounded resource pool.
//!
//! Bounds concurrent leases with a semaphore, keeps idle resources for
//! reuse, and reaps resources idle past `idle_timeout` (down to `min_size`).
//! `acquire` waits up to `acquire_timeout`, then fails with a typed error —
//! resources are released on drop, including when the holder is cancelled.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::{GuardError, GuardResult};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 8,
            idle_timeout: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

struct IdleEntry<T> {
    resource: T,
    idle_since: Instant,
}

struct PoolInner<T> {
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<IdleEntry<T>>>,
    factory: Box<dyn Fn() -> BoxFuture<'static, Result<T, String>> + Send + Sync>,
}

/// Bounded pool of reusable resources (backend connections, handles).
pub struct Pool<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Send + 'static> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Pool<T> {
    pub fn new<F, Fut>(config: PoolConfig, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T, String>> + Send + 'static,
    {
        let max = config.max_size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                config,
                semaphore: Arc::new(Semaphore::new(max)),
                idle: Mutex::new(Vec::new()),
                factory: Box::new(move || Box::pin(factory())),
            }),
        }
    }

    /// Lease a resource, waiting up to `acquire_timeout` for a free slot.
    pub async fn acquire(&self) -> GuardResult<Pooled<T>> {
        let timeout = self.inner.config.acquire_timeout;
        let permit = tokio::time::timeout(
            timeout,
            Arc::clone(&self.inner.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| GuardError::Timeout(timeout.as_millis() as u64))?
        .map_err(|_| GuardError::Resource("pool closed".to_string()))?;

        // Prefer a warm idle resource; otherwise open a fresh one.
        let reusable = {
            let mut idle = self.inner.idle.lock().unwrap_or_else(|p| p.into_inner());
            idle.pop().map(|entry| entry.resource)
        };

        let resource = match reusable {
            Some(resource) => resource,
            None => (self.inner.factory)()
                .await
                .map_err(GuardError::Resource)?,
        };

        Ok(Pooled {
            resource: Some(resource),
            inner: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Drop idle resources older than `idle_timeout`, keeping `min_size`
    /// warm.  Called periodically by the owner (the health scheduler).
    pub fn reap_idle(&self) {
        let now = Instant::now();
        let mut idle = self.inner.idle.lock().unwrap_or_else(|p| p.into_inner());
        let min = self.inner.config.min_size;
        let timeout = self.inner.config.idle_timeout;

        let before = idle.len();
        let mut kept: Vec<IdleEntry<T>> = Vec::with_capacity(idle.len());
        for entry in idle.drain(..) {
            let expired = now.saturating_duration_since(entry.idle_since) > timeout;
            if !expired || kept.len() < min {
                kept.push(entry);
            }
        }
        let reaped = before - kept.len();
        *idle = kept;
        if reaped > 0 {
            debug!(reaped, remaining = idle.len(), "reaped idle pooled resources");
        }
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Slots currently free for lease.
    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }
}

/// A leased resource.  Returned to the idle list on drop; the lease slot is
/// freed at the same moment.
pub struct Pooled<T: Send + 'static> {
    resource: Option<T>,
    inner: Arc<PoolInner<T>>,
    _permit: OwnedSemaphorePermit,
}

impl<T: Send + 'static> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.resource.as_ref().expect("resource present until drop")
    }
}

impl<T: Send + 'static> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.resource.as_mut().expect("resource present until drop")
    }
}

impl<T: Send + 'static> Pooled<T> {
    /// Discard the resource instead of returning it to the pool (e.g. after
    /// observing a broken connection).
    pub fn discard(mut self) {
        self.resource = None;
    }
}

impl<T: Send + 'static> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            let mut idle = self.inner.idle.lock().unwrap_or_else(|p| p.into_inner());
            idle.push(IdleEntry {
                resource,
                idle_since: Instant::now(),
            });
        }
    }
}
