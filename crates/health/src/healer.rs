//! Severity-gated healing actions.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use sentra_bus::{EventBus, Topic};

use crate::HealthStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

type ActionFn = Arc<dyn Fn() -> BoxFuture<'static, Result<String, String>> + Send + Sync>;

struct RegisteredAction {
    name: String,
    severity: Severity,
    run: ActionFn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingOutcome {
    pub action: String,
    pub severity: Severity,
    pub succeeded: bool,
    pub detail: String,
}

/// Remediation registry.  `heal` selects actions by the overall status:
/// unhealthy runs everything, degraded runs low and medium only.
pub struct SelfHealer {
    actions: Vec<RegisteredAction>,
    bus: EventBus,
}

impl SelfHealer {
    pub fn new(bus: EventBus) -> Self {
        Self {
            actions: Vec::new(),
            bus,
        }
    }

    pub fn register<F, Fut>(&mut self, name: &str, severity: Severity, action: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.actions.push(RegisteredAction {
            name: name.to_string(),
            severity,
            run: Arc::new(move || action().boxed()),
        });
    }

    pub fn action_names(&self) -> Vec<&str> {
        self.actions.iter().map(|a| a.name.as_str()).collect()
    }

    /// Run the actions selected by `overall`, in registration order.
    /// Each action publishes exactly one `health.healing.*` event:
    /// `success`, `failed` (action declined/errored), or `error` (panic).
    pub async fn heal(&self, overall: HealthStatus) -> Vec<HealingOutcome> {
        let max_severity = match overall {
            HealthStatus::Healthy => return Vec::new(),
            HealthStatus::Degraded => Severity::Medium,
            HealthStatus::Unhealthy => Severity::High,
        };

        let mut outcomes = Vec::new();
        for action in &self.actions {
            if action.severity > max_severity {
                continue;
            }

            let result = AssertUnwindSafe((action.run)()).catch_unwind().await;
            let outcome = match result {
                Ok(Ok(detail)) => {
                    info!(action = %action.name, %detail, "healing action succeeded");
                    self.bus.publish(
                        Topic::HealthHealingSuccess,
                        serde_json::json!({ "action": action.name, "detail": detail }),
                    );
                    HealingOutcome {
                        action: action.name.clone(),
                        severity: action.severity,
                        succeeded: true,
                        detail,
                    }
                }
                Ok(Err(detail)) => {
                    warn!(action = %action.name, %detail, "healing action failed");
                    self.bus.publish(
                        Topic::HealthHealingFailed,
                        serde_json::json!({ "action": action.name, "detail": detail }),
                    );
                    HealingOutcome {
                        action: action.name.clone(),
                        severity: action.severity,
                        succeeded: false,
                        detail,
                    }
                }
                Err(panic) => {
                    let detail = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "healing action panicked".to_string());
                    error!(action = %action.name, %detail, "healing action panicked");
                    self.bus.publish(
                        Topic::HealthHealingError,
                        serde_json::json!({ "action": action.name, "detail": detail }),
                    );
                    HealingOutcome {
                        action: action.name.clone(),
                        severity: action.severity,
                        succeeded: false,
                        detail,
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn healer_with_counters(bus: EventBus) -> (SelfHealer, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let low_runs = Arc::new(AtomicUsize::new(0));
        let high_runs = Arc::new(AtomicUsize::new(0));

        let mut healer = SelfHealer::new(bus);
        let low_clone = Arc::clone(&low_runs);
        healer.register("clear-memory-cache", Severity::Low, move || {
            let low_clone = Arc::clone(&low_clone);
            async move {
                low_clone.fetch_add(1, Ordering::SeqCst);
                Ok("cache cleared".to_string())
            }
        });
        let high_clone = Arc::clone(&high_runs);
        healer.register("validate-system-integrity", Severity::High, move || {
            let high_clone = Arc::clone(&high_clone);
            async move {
                high_clone.fetch_add(1, Ordering::SeqCst);
                Ok("integrity ok".to_string())
            }
        });

        (healer, low_runs, high_runs)
    }

    #[tokio::test]
    async fn degraded_runs_low_and_medium_only() {
        let (healer, low, high) = healer_with_counters(EventBus::new());
        let outcomes = healer.heal(HealthStatus::Degraded).await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(low.load(Ordering::SeqCst), 1);
        assert_eq!(high.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unhealthy_runs_everything() {
        let (healer, low, high) = healer_with_counters(EventBus::new());
        let outcomes = healer.heal(HealthStatus::Unhealthy).await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(low.load(Ordering::SeqCst), 1);
        assert_eq!(high.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn healthy_runs_nothing() {
        let (healer, low, high) = healer_with_counters(EventBus::new());
        assert!(healer.heal(HealthStatus::Healthy).await.is_empty());
        assert_eq!(low.load(Ordering::SeqCst), 0);
        assert_eq!(high.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn outcomes_publish_matching_events() {
        let bus = EventBus::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        for (topic, tag) in [
            (Topic::HealthHealingSuccess, "success"),
            (Topic::HealthHealingFailed, "failed"),
            (Topic::HealthHealingError, "error"),
        ] {
            let events = Arc::clone(&events);
            bus.subscribe(topic, move |event| {
                events
                    .lock()
                    .unwrap()
                    .push((tag, event.payload["action"].as_str().unwrap().to_string()));
            });
        }

        let mut healer = SelfHealer::new(bus);
        healer.register("works", Severity::Low, || async { Ok("done".to_string()) });
        healer.register("declines", Severity::Low, || async {
            Err("not applicable".to_string())
        });
        healer.register("explodes", Severity::Low, || async { panic!("boom") });

        let outcomes = healer.heal(HealthStatus::Unhealthy).await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].succeeded);
        assert!(!outcomes[1].succeeded);
        assert!(!outcomes[2].succeeded);

        let events = events.lock().unwrap();
        assert_eq!(
            events.as_slice(),
            [
                ("success", "works".to_string()),
                ("failed", "declines".to_string()),
                ("error", "explodes".to_string()),
            ]
        );
    }
}
