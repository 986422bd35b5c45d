//! Built-in probes: performance, memory subsystem, LLM, event bus.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use sentra_bus::{EventBus, Topic};
use sentra_llm::LanguageBackend;
use sentra_memory::MemorySubsystem;

use crate::{HealthStatus, Probe, ProbeReport};

/// Latency of a small in-process workload against fixed thresholds.
pub struct PerformanceProbe {
    pub degraded_after: Duration,
    pub unhealthy_after: Duration,
}

impl Default for PerformanceProbe {
    fn default() -> Self {
        Self {
            degraded_after: Duration::from_millis(250),
            unhealthy_after: Duration::from_secs(2),
        }
    }
}

#[async_trait]
impl Probe for PerformanceProbe {
    fn name(&self) -> &'static str {
        "performance"
    }

    async fn check(&self) -> ProbeReport {
        // Scheduling latency: how long a spawned no-op takes to run and
        // join.  A saturated runtime stretches this far past the floor.
        let started = Instant::now();
        let _ = tokio::spawn(async {}).await;
        let elapsed = started.elapsed();

        let status = if elapsed >= self.unhealthy_after {
            HealthStatus::Unhealthy
        } else if elapsed >= self.degraded_after {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        ProbeReport {
            name: self.name().to_string(),
            status,
            message: format!("task scheduling latency {:?}", elapsed),
            metrics: serde_json::json!({ "scheduling_latency_us": elapsed.as_micros() as u64 }),
        }
    }
}

/// Cache hit rate and store footprint of the memory subsystem.
pub struct MemoryProbe {
    memory: Arc<MemorySubsystem>,
    pub min_hit_rate: f64,
    pub max_items: usize,
}

impl MemoryProbe {
    pub fn new(memory: Arc<MemorySubsystem>) -> Self {
        Self {
            memory,
            min_hit_rate: 0.3,
            max_items: 500_000,
        }
    }
}

#[async_trait]
impl Probe for MemoryProbe {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn check(&self) -> ProbeReport {
        let stats = self.memory.stats().await;
        let hit_rate = stats.cache.hit_rate();
        let footprint = stats.episodic + stats.semantic + stats.procedural + stats.graph_nodes;

        let (status, message) = if footprint > self.max_items {
            (
                HealthStatus::Unhealthy,
                format!("memory footprint {footprint} items exceeds limit"),
            )
        } else if hit_rate < self.min_hit_rate {
            (
                HealthStatus::Degraded,
                format!("cache hit rate {hit_rate:.2} below {:.2}", self.min_hit_rate),
            )
        } else {
            (
                HealthStatus::Healthy,
                format!("hit rate {hit_rate:.2}, {footprint} items"),
            )
        };

        ProbeReport {
            name: self.name().to_string(),
            status,
            message,
            metrics: serde_json::json!({
                "cache_hit_rate": hit_rate,
                "cache_entries": stats.cache.entries,
                "footprint_items": footprint,
            }),
        }
    }
}

/// Ping the generation backend and band the response time.
pub struct LlmProbe {
    backend: Arc<dyn LanguageBackend>,
    pub degraded_after: Duration,
    pub unhealthy_after: Duration,
}

impl LlmProbe {
    pub fn new(backend: Arc<dyn LanguageBackend>) -> Self {
        Self {
            backend,
            degraded_after: Duration::from_secs(2),
            unhealthy_after: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl Probe for LlmProbe {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn check(&self) -> ProbeReport {
        let started = Instant::now();
        let result = tokio::time::timeout(self.unhealthy_after, self.backend.ping()).await;
        let elapsed = started.elapsed();

        let (status, message) = match result {
            Ok(Ok(())) if elapsed < self.degraded_after => {
                (HealthStatus::Healthy, format!("ping ok in {elapsed:?}"))
            }
            Ok(Ok(())) => (
                HealthStatus::Degraded,
                format!("ping slow: {elapsed:?}"),
            ),
            Ok(Err(err)) => (HealthStatus::Unhealthy, format!("ping failed: {err}")),
            Err(_) => (
                HealthStatus::Unhealthy,
                format!("ping timed out after {:?}", self.unhealthy_after),
            ),
        };

        ProbeReport {
            name: self.name().to_string(),
            status,
            message,
            metrics: serde_json::json!({ "ping_ms": elapsed.as_millis() as u64 }),
        }
    }
}

/// Synthetic publish/subscribe roundtrip through the event bus.
pub struct BusProbe {
    bus: EventBus,
}

impl BusProbe {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Probe for BusProbe {
    fn name(&self) -> &'static str {
        "event-bus"
    }

    async fn check(&self) -> ProbeReport {
        let delivered = Arc::new(AtomicBool::new(false));
        let delivered_clone = Arc::clone(&delivered);
        let subscription = self.bus.subscribe(Topic::AgentRequest, move |event| {
            if event.payload.get("synthetic").and_then(|v| v.as_bool()) == Some(true) {
                delivered_clone.store(true, Ordering::SeqCst);
            }
        });

        let started = Instant::now();
        // Marked synthetic so real subscribers can ignore it.
        self.bus.publish(
            Topic::AgentRequest,
            serde_json::json!({ "synthetic": true, "probe": "event-bus" }),
        );
        let elapsed = started.elapsed();
        self.bus.unsubscribe(subscription);

        let (status, message) = if delivered.load(Ordering::SeqCst) {
            (HealthStatus::Healthy, format!("roundtrip in {elapsed:?}"))
        } else {
            (
                HealthStatus::Unhealthy,
                "synthetic event was not delivered".to_string(),
            )
        };

        ProbeReport {
            name: self.name().to_string(),
            status,
            message,
            metrics: serde_json::json!({ "roundtrip_us": elapsed.as_micros() as u64 }),
        }
    }
}

#[cfg(test)]
mod tests {
    use sentra_cag::CagCache;
    use sentra_llm::{LlmError, LlmResult};
    use sentra_memory::{Embedder, HashEmbedder, InMemoryVectorStore, StoreKeys};

    use super::*;

    fn memory(dir: &std::path::Path) -> Arc<MemorySubsystem> {
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::default());
        let vector = Arc::new(InMemoryVectorStore::new(Arc::clone(&embedder)));
        let cache = Arc::new(CagCache::new(100, 3600, 0.85));
        Arc::new(MemorySubsystem::new(
            dir,
            StoreKeys {
                episodic: [1u8; 32],
                semantic: [2u8; 32],
                procedural: [3u8; 32],
                graph: [4u8; 32],
                cache: [5u8; 32],
            },
            10,
            embedder,
            vector,
            cache,
            EventBus::new(),
        ))
    }

    struct DeadBackend;

    #[async_trait]
    impl LanguageBackend for DeadBackend {
        async fn generate(&self, _prompt: &str) -> LlmResult<String> {
            Err(LlmError::BackendUnavailable("down".to_string()))
        }

        async fn embed(&self, _text: &str) -> LlmResult<Vec<f32>> {
            Err(LlmError::BackendUnavailable("down".to_string()))
        }
    }

    struct LiveBackend;

    #[async_trait]
    impl LanguageBackend for LiveBackend {
        async fn generate(&self, _prompt: &str) -> LlmResult<String> {
            Ok("pong".to_string())
        }

        async fn embed(&self, _text: &str) -> LlmResult<Vec<f32>> {
            Ok(vec![1.0])
        }
    }

    #[tokio::test]
    async fn bus_probe_roundtrips() {
        let probe = BusProbe::new(EventBus::new());
        let report = probe.check().await;
        assert_eq!(report.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn llm_probe_reports_outage_as_unhealthy() {
        let probe = LlmProbe::new(Arc::new(DeadBackend));
        let report = probe.check().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(report.message.contains("ping failed"));
    }

    #[tokio::test]
    async fn llm_probe_healthy_when_fast() {
        let probe = LlmProbe::new(Arc::new(LiveBackend));
        let report = probe.check().await;
        assert_eq!(report.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn memory_probe_flags_low_hit_rate() {
        let dir = tempfile::tempdir().unwrap();
        let memory = memory(dir.path());

        // Force a poor hit rate: misses only.
        for i in 0..10 {
            memory
                .cache()
                .lookup(&format!("never cached {i}"), None, &Default::default());
        }
        assert!(memory.stats().await.cache.hit_rate() < 0.3);

        let probe = MemoryProbe::new(Arc::clone(&memory));
        let report = probe.check().await;
        assert_eq!(report.status, HealthStatus::Degraded);

        // Clearing the cache (the healing action for this condition) resets
        // the counters; the next probe is healthy again.
        memory.cache().clear();
        let report = probe.check().await;
        assert_eq!(report.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn performance_probe_runs() {
        let report = PerformanceProbe::default().check().await;
        assert!(!report.message.is_empty());
        assert_ne!(report.status, HealthStatus::Unhealthy);
    }
}
