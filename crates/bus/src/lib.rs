//! Synchronous typed event bus.
//!
//! Handlers run in registration order on the publisher's thread of control.
//! A panicking handler is caught and logged; delivery continues to the
//! remaining subscribers.  The subscription table lock is released before
//! any handler runs, so handlers may subscribe/unsubscribe reentrantly.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, trace};

/// Every topic the core publishes on.  Adding a topic here is the only way
/// to introduce a new event stream — stringly-typed topics are not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    AgentRequest,
    AgentResponse,
    AgentError,
    MemoryUpdate,
    LearningEntry,
    LearningFeedback,
    HealthCheckCompleted,
    HealthHealingSuccess,
    HealthHealingFailed,
    HealthHealingError,
    AuditLogCreated,
    ToolExecution,
    CagHit,
    CagMiss,
}

impl Topic {
    /// Dotted wire name, used in logs and serialized event payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::AgentRequest => "agent.request",
            Topic::AgentResponse => "agent.response",
            Topic::AgentError => "agent.error",
            Topic::MemoryUpdate => "memory.update",
            Topic::LearningEntry => "learning.entry",
            Topic::LearningFeedback => "learning.feedback",
            Topic::HealthCheckCompleted => "health.check.completed",
            Topic::HealthHealingSuccess => "health.healing.success",
            Topic::HealthHealingFailed => "health.healing.failed",
            Topic::HealthHealingError => "health.healing.error",
            Topic::AuditLogCreated => "audit.log.created",
            Topic::ToolExecution => "tool.execution",
            Topic::CagHit => "cag.hit",
            Topic::CagMiss => "cag.miss",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published event: topic, JSON payload, and publish timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub topic: Topic,
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
}

/// Opaque handle returned by [`EventBus::subscribe`]; pass to
/// [`EventBus::unsubscribe`] to detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    handler: Handler,
}

/// Process-wide publish/subscribe broker.
///
/// Cheap to clone (`Arc` internally); all clones share the same
/// subscription table.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<HashMap<Topic, Vec<Subscription>>>>,
    next_id: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register `handler` for `topic`.  Handlers fire in registration order.
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut table = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        table.entry(topic).or_default().push(Subscription {
            id,
            handler: Arc::new(handler),
        });
        id
    }

    /// Detach a handler.  Returns `true` if the subscription existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut table = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        for subs in table.values_mut() {
            let before = subs.len();
            subs.retain(|s| s.id != id);
            if subs.len() < before {
                return true;
            }
        }
        false
    }

    /// Publish `payload` on `topic`, delivering synchronously to every
    /// subscriber in registration order.  Returns the number of handlers
    /// that ran (panicked handlers included).
    pub fn publish(&self, topic: Topic, payload: serde_json::Value) -> usize {
        let event = Event {
            topic,
            payload,
            ts: Utc::now(),
        };

        // Snapshot the handler list so subscribers run outside the lock.
        let handlers: Vec<Handler> = {
            let table = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            table
                .get(&topic)
                .map(|subs| subs.iter().map(|s| Arc::clone(&s.handler)).collect())
                .unwrap_or_default()
        };

        trace!(topic = %topic, subscribers = handlers.len(), "publishing event");

        for handler in &handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(topic = %topic, panic = %detail, "event handler panicked; continuing delivery");
            }
        }

        handlers.len()
    }

    /// Number of active subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        let table = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        table.get(&topic).map(|subs| subs.len()).unwrap_or(0)
    }
}
