//! Health monitoring and self-healing.
//!
//! A periodic scheduler runs probes in parallel, aggregates them into an
//! overall status (any unhealthy probe wins, then any degraded), publishes
//! `health.check.completed`, and hands the verdict to the self-healer.
//! Healing actions carry severities; the policy runs all of them when the
//! system is unhealthy and only low/medium when degraded.  Healing acts on
//! components directly — it never triggers another health check.

pub mod healer;
pub mod probes;

pub use healer::{HealingOutcome, SelfHealer, Severity};
pub use probes::{BusProbe, LlmProbe, MemoryProbe, PerformanceProbe};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use sentra_bus::{EventBus, Topic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeReport {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    pub metrics: serde_json::Value,
}

#[async_trait]
pub trait Probe: Send + Sync {
    fn name(&self) -> &'static str;
    async fn check(&self) -> ProbeReport;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall: HealthStatus,
    pub probes: Vec<ProbeReport>,
    pub checked_at: DateTime<Utc>,
}

/// Any unhealthy probe makes the system unhealthy; otherwise any degraded
/// probe makes it degraded.
pub fn aggregate(probes: &[ProbeReport]) -> HealthStatus {
    if probes.iter().any(|p| p.status == HealthStatus::Unhealthy) {
        HealthStatus::Unhealthy
    } else if probes.iter().any(|p| p.status == HealthStatus::Degraded) {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

pub struct HealthMonitor {
    probes: Vec<Arc<dyn Probe>>,
    healer: SelfHealer,
    bus: EventBus,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(probes: Vec<Arc<dyn Probe>>, healer: SelfHealer, bus: EventBus, interval: Duration) -> Self {
        Self {
            probes,
            healer,
            bus,
            interval,
        }
    }

    /// Run every probe in parallel and aggregate.
    pub async fn run_check(&self) -> HealthReport {
        let futures: Vec<_> = self.probes.iter().map(|p| p.check()).collect();
        let probes = futures::future::join_all(futures).await;
        let overall = aggregate(&probes);

        let report = HealthReport {
            overall,
            probes,
            checked_at: Utc::now(),
        };

        self.bus.publish(
            Topic::HealthCheckCompleted,
            serde_json::json!({
                "overall": report.overall.as_str(),
                "probes": report.probes,
            }),
        );

        if overall != HealthStatus::Healthy {
            warn!(overall = overall.as_str(), "health check found problems");
        }
        report
    }

    /// One full cycle: check, then heal per policy.
    pub async fn check_and_heal(&self) -> (HealthReport, Vec<HealingOutcome>) {
        let report = self.run_check().await;
        let outcomes = self.healer.heal(report.overall).await;
        (report, outcomes)
    }

    /// Manually requested healing pass (the `triggerSelfHealing` surface).
    pub async fn trigger_healing(&self) -> Vec<HealingOutcome> {
        self.healer.heal(HealthStatus::Unhealthy).await
    }

    /// Background scheduler.  Runs until the returned handle is aborted.
    pub fn spawn_scheduler(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let monitor = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so startup isn't
            // probed before components settle.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let (report, outcomes) = monitor.check_and_heal().await;
                info!(
                    overall = report.overall.as_str(),
                    healing_actions = outcomes.len(),
                    "scheduled health cycle complete"
                );
            }
        })
    }

    /// Human-readable Markdown rendering of a report.
    pub fn markdown_report(report: &HealthReport) -> String {
        let mut out = String::new();
        out.push_str("# Health Report\n\n");
        out.push_str(&format!(
            "- **Overall:** {}\n- **Checked:** {}\n\n",
            report.overall.as_str(),
            report.checked_at.to_rfc3339()
        ));
        out.push_str("| Probe | Status | Message |\n|---|---|---|\n");
        for probe in &report.probes {
            out.push_str(&format!(
                "| {} | {} | {} |\n",
                probe.name,
                probe.status.as_str(),
                probe.message
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe {
        name: &'static str,
        status: HealthStatus,
    }

    #[async_trait]
    impl Probe for FixedProbe {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn check(&self) -> ProbeReport {
            ProbeReport {
                name: self.name.to_string(),
                status: self.status,
                message: format!("{} is {}", self.name, self.status.as_str()),
                metrics: serde_json::json!({}),
            }
        }
    }

    fn probe(name: &'static str, status: HealthStatus) -> Arc<dyn Probe> {
        Arc::new(FixedProbe { name, status })
    }

    #[test]
    fn aggregation_prefers_worst_status() {
        let healthy = ProbeReport {
            name: "a".into(),
            status: HealthStatus::Healthy,
            message: String::new(),
            metrics: serde_json::json!({}),
        };
        let degraded = ProbeReport {
            status: HealthStatus::Degraded,
            ..healthy.clone()
        };
        let unhealthy = ProbeReport {
            status: HealthStatus::Unhealthy,
            ..healthy.clone()
        };

        assert_eq!(aggregate(&[healthy.clone()]), HealthStatus::Healthy);
        assert_eq!(aggregate(&[healthy.clone(), degraded.clone()]), HealthStatus::Degraded);
        assert_eq!(
            aggregate(&[healthy, degraded, unhealthy]),
            HealthStatus::Unhealthy
        );
        assert_eq!(aggregate(&[]), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn run_check_publishes_completed_event() {
        use std::sync::Mutex;

        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        bus.subscribe(Topic::HealthCheckCompleted, move |event| {
            seen_clone
                .lock()
                .unwrap()
                .push(event.payload["overall"].as_str().unwrap().to_string());
        });

        let monitor = HealthMonitor::new(
            vec![
                probe("llm", HealthStatus::Healthy),
                probe("memory", HealthStatus::Degraded),
            ],
            SelfHealer::new(bus.clone()),
            bus,
            Duration::from_secs(300),
        );

        let report = monitor.run_check().await;
        assert_eq!(report.overall, HealthStatus::Degraded);
        assert_eq!(seen.lock().unwrap().as_slice(), ["degraded"]);
    }

    #[tokio::test]
    async fn markdown_report_lists_probes() {
        let bus = EventBus::new();
        let monitor = HealthMonitor::new(
            vec![probe("event-bus", HealthStatus::Healthy)],
            SelfHealer::new(bus.clone()),
            bus,
            Duration::from_secs(300),
        );
        let report = monitor.run_check().await;
        let markdown = HealthMonitor::markdown_report(&report);
        assert!(markdown.contains("# Health Report"));
        assert!(markdown.contains("| event-bus | healthy |"));
    }
}
