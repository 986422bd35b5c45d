//! `AgentRuntime`: bootstrap, the public request surface, and background
//! scheduling.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use sentra_auth::{AuditLog, AuditRecord, AuthService, SessionManager, UserStore};
use sentra_bus::{EventBus, Topic};
use sentra_cag::CagCache;
use sentra_config::AppConfig;
use sentra_guard::{SlidingWindow, TokenBucket};
use sentra_health::{
    BusProbe, HealthMonitor, HealthReport, HealingOutcome, LlmProbe, MemoryProbe,
    PerformanceProbe, Probe, SelfHealer, Severity,
};
use sentra_learning::{InteractionSample, LearningLoop};
use sentra_llm::{LanguageBackend, LlmError};
use sentra_memory::{
    Embedder, MemoryError, MemoryStats, MemorySubsystem, StoreKeys, VectorError,
    create_vector_store,
};
use sentra_pipeline::{Pipeline, QueryAnswer, QueryOptions};
use sentra_reasoning::{Executor, Planner, ReasonError, StepHost, StepOutcome, StrategyKind};
use sentra_tools::{Mode, RuntimeConfig, Tool, ToolError, ToolOutput, ToolRegistry, ToolResult};
use sentra_vault::{MasterKey, StoreKeyring, VaultError};

use crate::error::{AgentError, StartupError};
use crate::missions::{Mission, MissionBoard};

/// Interval of the background persistence snapshot task.
const PERSIST_INTERVAL: Duration = Duration::from_secs(60);

// ── Wiring adapters ──────────────────────────────────────────────────────────

/// Embeddings come from the LLM backend's `embed` endpoint.
struct BackendEmbedder {
    backend: Arc<dyn LanguageBackend>,
}

#[async_trait]
impl Embedder for BackendEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, VectorError> {
        self.backend
            .embed(text)
            .await
            .map_err(|e| VectorError::Embedding(e.to_string()))
    }
}

/// Per-tool sliding-window rate limit, applied at registration so every
/// caller path (planner, recipes) goes through it.
struct ThrottledTool {
    inner: Box<dyn Tool>,
    window: SlidingWindow,
}

#[async_trait]
impl Tool for ThrottledTool {
    fn descriptor(&self) -> sentra_tools::ToolDescriptor {
        self.inner.descriptor()
    }

    async fn run(&self, args: &HashMap<String, String>) -> ToolResult<ToolOutput> {
        if !self.window.allow() {
            return Err(ToolError::RateLimited(self.descriptor().name));
        }
        self.inner.run(args).await
    }
}

/// Reason steps answer through the full pipeline (CAG → RAG → LLM);
/// Retrieve steps hit memory similarity search directly.
struct PipelineHost {
    pipeline: Arc<Pipeline>,
    memory: Arc<MemorySubsystem>,
    use_cache: bool,
}

#[async_trait]
impl StepHost for PipelineHost {
    async fn reason(&self, prompt: &str, _strategy_hint: Option<&str>) -> Result<String, ReasonError> {
        let opts = QueryOptions {
            use_cache: self.use_cache,
            ..QueryOptions::default()
        };
        self.pipeline
            .answer(prompt, &opts)
            .await
            .map(|answer| answer.response)
            .map_err(|e| ReasonError::Host(e.to_string()))
    }

    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<String>, ReasonError> {
        self.memory
            .search_similar(query, k)
            .await
            .map(|hits| hits.into_iter().map(|h| h.text).collect())
            .map_err(|e| ReasonError::Host(e.to_string()))
    }
}

// ── Public surface types ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Interactions within one session run serially; sessions run
    /// concurrently and independently.
    pub session: String,
    pub approval_token: Option<String>,
    pub strategy: Option<StrategyKind>,
    pub use_cache: bool,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            session: "default".to_string(),
            approval_token: None,
            strategy: None,
            use_cache: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallSummary {
    pub tool: String,
    pub simulated: bool,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Performance {
    pub duration_ms: u64,
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub request_id: Uuid,
    pub text: String,
    pub reasoning: Vec<StepOutcome>,
    pub tool_calls: Vec<ToolCallSummary>,
    pub performance: Performance,
    pub memory_snapshot: MemoryStats,
}

#[derive(Debug, Clone)]
pub struct KnowledgeAnswer {
    pub response: String,
    pub techniques: Vec<String>,
    pub tools: Vec<String>,
    pub code_examples: Vec<String>,
    pub confidence: f32,
    pub sources: Vec<String>,
    pub cached: bool,
    pub hit_type: Option<String>,
    pub similarity_score: Option<f32>,
    pub degraded: bool,
    pub processing_time_ms: u64,
}

// ── The runtime ──────────────────────────────────────────────────────────────

pub struct AgentRuntime {
    config: AppConfig,
    bus: EventBus,
    backend: Arc<dyn LanguageBackend>,
    memory: Arc<MemorySubsystem>,
    pipeline: Arc<Pipeline>,
    learning: Arc<LearningLoop>,
    auth: Arc<AuthService>,
    registry: RwLock<ToolRegistry>,
    runtime_config: RwLock<RuntimeConfig>,
    monitor: Arc<HealthMonitor>,
    missions: MissionBoard,
    /// Per-session serialization lanes.
    lanes: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    memory_bucket: TokenBucket,
}

impl AgentRuntime {
    /// Assemble the full core.  Fails with a typed [`StartupError`] that
    /// maps onto the process exit codes.
    pub async fn bootstrap(
        config: AppConfig,
        backend: Arc<dyn LanguageBackend>,
    ) -> Result<Arc<Self>, StartupError> {
        let master = MasterKey::from_env().map_err(|e| StartupError::Config(e.to_string()))?;
        let data_dir = config.data_dir().to_path_buf();

        // Argon2id per store: expensive by design, so derive off the async
        // runtime threads once, up front.
        let derived = tokio::task::spawn_blocking(move || {
            let keyring = StoreKeyring::new(master);
            let stores = StoreKeys::from_keyring(&keyring)?;
            let users = keyring.key_for("users")?;
            let sessions = keyring.key_for("sessions")?;
            let jwt = keyring.key_for("sessions-jwt")?;
            let audit = keyring.key_for("audit")?;
            let learning = keyring.key_for("learning")?;
            Ok::<_, VaultError>((stores, users, sessions, jwt, audit, learning))
        })
        .await
        .map_err(|e| StartupError::Config(e.to_string()))?
        .map_err(|e| StartupError::Config(e.to_string()))?;
        let (store_keys, users_key, sessions_key, jwt_key, audit_key, learning_key) = derived;

        let bus = EventBus::new();
        let cache = Arc::new(CagCache::from_config(&config.memory, &config.cag).with_bus(bus.clone()));
        let embedder: Arc<dyn Embedder> = Arc::new(BackendEmbedder {
            backend: Arc::clone(&backend),
        });
        let vector = create_vector_store(&config.memory.vector_store, Arc::clone(&embedder), &data_dir)
            .map_err(|e| StartupError::BackendUnavailable(e.to_string()))?;

        let memory = Arc::new(MemorySubsystem::new(
            &data_dir,
            store_keys,
            config.memory.working_memory_capacity,
            embedder,
            vector,
            Arc::clone(&cache),
            bus.clone(),
        ));

        // The audit log must exist before memory init so a corrupt store
        // can be recorded on the way down.
        let audit = Arc::new(AuditLog::new(
            sentra_vault::EncryptedLineLog::new(data_dir.join("logs/audit.log"), audit_key),
            config.auth.audit_retention_days,
            bus.clone(),
        ));

        if let Err(err) = memory.initialize().await {
            return Err(Self::startup_persistence_failure(&audit, err).await);
        }

        let users = UserStore::new(sentra_vault::EncryptedFile::new(
            data_dir.join("auth/users.json"),
            users_key,
        ));
        let sessions = SessionManager::new(
            sentra_vault::EncryptedFile::new(data_dir.join("auth/sessions.json"), sessions_key),
            &jwt_key,
            config.auth.session_timeout_minutes,
            config.auth.jwt_expiration_secs,
        );
        let auth = Arc::new(AuthService::new(users, sessions, Arc::clone(&audit), &config.auth));
        if let Err(err) = auth.load().await {
            return Err(Self::startup_persistence_failure(&audit, err).await);
        }

        let learning = Arc::new(LearningLoop::new_encrypted(
            data_dir.join("learning/learning-history.json"),
            learning_key,
            bus.clone(),
            0.1,
            1000,
        ));
        if let Err(err) = learning.load().await {
            return Err(Self::startup_persistence_failure(&audit, err).await);
        }

        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&memory),
            Arc::clone(&backend),
            bus.clone(),
            &config.llm,
            &config.rate_limits.llm,
        ));

        let monitor = Self::build_monitor(&config, &bus, &memory, &backend);

        let runtime = Arc::new(Self {
            memory_bucket: TokenBucket::from_config("memory", &config.rate_limits.memory),
            runtime_config: RwLock::new(RuntimeConfig::with_mode(Mode::Safe)),
            registry: RwLock::new(ToolRegistry::default()),
            missions: MissionBoard::default(),
            lanes: Mutex::new(HashMap::new()),
            config,
            bus,
            backend,
            memory,
            pipeline,
            learning,
            auth,
            monitor,
        });

        if runtime.config.cag.pre_warm_on_start {
            let seeds: Vec<(String, String)> = runtime
                .memory
                .recent_interactions(20)
                .await
                .into_iter()
                .map(|i| (i.input, i.output))
                .collect();
            runtime.memory.cache().pre_warm(&seeds);
            info!(seeds = seeds.len(), "CAG pre-warmed from episodic history");
        }

        info!("agent runtime bootstrapped");
        Ok(runtime)
    }

    async fn startup_persistence_failure(
        audit: &Arc<AuditLog>,
        err: impl std::fmt::Display,
    ) -> StartupError {
        let message = err.to_string();
        audit
            .try_append(
                AuditRecord::new("system", "startup.persistence.corrupt", "persistence", false)
                    .with_details(message.clone()),
            )
            .await;
        StartupError::PersistenceCorrupt(message)
    }

    fn build_monitor(
        config: &AppConfig,
        bus: &EventBus,
        memory: &Arc<MemorySubsystem>,
        backend: &Arc<dyn LanguageBackend>,
    ) -> Arc<HealthMonitor> {
        let probes: Vec<Arc<dyn Probe>> = vec![
            Arc::new(PerformanceProbe::default()),
            Arc::new(MemoryProbe::new(Arc::clone(memory))),
            Arc::new(LlmProbe::new(Arc::clone(backend))),
            Arc::new(BusProbe::new(bus.clone())),
        ];

        let mut healer = SelfHealer::new(bus.clone());
        {
            let cache = Arc::clone(memory.cache());
            healer.register("clear-memory-cache", Severity::Low, move || {
                let cache = Arc::clone(&cache);
                async move {
                    let dropped = cache.len();
                    cache.clear();
                    Ok(format!("dropped {dropped} cache entries"))
                }
            });
        }
        healer.register("restart-performance-monitoring", Severity::Medium, || async {
            // Fresh latency sample confirms the scheduler has headroom again.
            let started = Instant::now();
            let _ = tokio::spawn(async {}).await;
            Ok(format!("scheduling latency {:?}", started.elapsed()))
        });
        {
            let memory = Arc::clone(memory);
            healer.register("optimize-memory-usage", Severity::Medium, move || {
                let memory = Arc::clone(&memory);
                async move {
                    let (nodes, evicted) = memory.optimize().await;
                    Ok(format!("graph compacted to {nodes} nodes, {evicted} cache entries evicted"))
                }
            });
        }
        {
            let memory = Arc::clone(memory);
            healer.register("validate-system-integrity", Severity::High, move || {
                let memory = Arc::clone(&memory);
                async move {
                    memory.persist().await.map_err(|e| e.to_string())?;
                    let stats = memory.stats().await;
                    Ok(format!(
                        "stores persisted cleanly ({} episodic, {} semantic items)",
                        stats.episodic, stats.semantic
                    ))
                }
            });
        }

        Arc::new(HealthMonitor::new(
            probes,
            healer,
            bus.clone(),
            Duration::from_millis(config.health.interval_ms),
        ))
    }

    /// Ping the generation backend; the CLI maps a failure to exit 74.
    pub async fn verify_backend(&self) -> Result<(), StartupError> {
        self.backend
            .ping()
            .await
            .map_err(|e: LlmError| StartupError::BackendUnavailable(e.to_string()))
    }

    /// Register a tool.  Every tool gets the configured per-tool sliding
    /// window wrapped around it.
    pub async fn register_tool(&self, tool: Box<dyn Tool>) {
        let throttled = ThrottledTool {
            window: SlidingWindow::from_config(&self.config.rate_limits.tool),
            inner: tool,
        };
        self.registry.write().await.register(Box::new(throttled));
    }

    /// Switch the runtime safety posture.
    pub async fn set_mode(&self, mode: Mode) {
        self.runtime_config.write().await.mode = mode;
        info!(?mode, "runtime mode changed");
    }

    pub async fn mode(&self) -> Mode {
        self.runtime_config.read().await.mode
    }

    /// Spawn the background schedulers: periodic health cycle and periodic
    /// persistence snapshots.  Returns handles the caller owns.
    pub fn start_background(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let health = Arc::clone(&self.monitor).spawn_scheduler();

        let runtime = Arc::clone(self);
        let persistence = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PERSIST_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = runtime.memory.persist().await {
                    warn!(%err, "scheduled memory persistence failed");
                }
                if let Err(err) = runtime.auth.persist().await {
                    warn!(%err, "scheduled auth persistence failed");
                }
            }
        });

        vec![health, persistence]
    }

    /// Flush all persistent state.  Called on orderly shutdown.
    pub async fn shutdown(&self) -> Result<(), AgentError> {
        let request_id = Uuid::new_v4();
        self.memory
            .persist()
            .await
            .map_err(|e| AgentError::from_memory(e, request_id))?;
        self.auth
            .persist()
            .await
            .map_err(|e| AgentError::from_auth(e, request_id))?;
        info!("runtime state flushed");
        Ok(())
    }

    // ── Request surface ──────────────────────────────────────────────────

    /// Full request cycle: plan → gate → execute → remember → learn.
    pub async fn process(
        &self,
        input: &str,
        opts: &ProcessOptions,
    ) -> Result<ProcessOutcome, AgentError> {
        let request_id = Uuid::new_v4();
        let started = Instant::now();

        if input.trim().is_empty() {
            return Err(AgentError::Validation {
                message: "input must not be empty".to_string(),
                request_id,
            });
        }

        self.bus.publish(
            Topic::AgentRequest,
            serde_json::json!({
                "request_id": request_id.to_string(),
                "session": opts.session,
                "input_len": input.len(),
            }),
        );

        // Per-session lane: interactions within a session run serially.
        let lane = {
            let mut lanes = self.lanes.lock().await;
            Arc::clone(lanes.entry(opts.session.clone()).or_default())
        };
        let _serial = lane.lock().await;

        // Memory-op admission.
        self.memory_bucket
            .consume(1, Duration::from_secs(2))
            .await
            .map_err(|e| AgentError::RateLimited {
                message: e.to_string(),
                request_id,
            })?;

        let strategy = opts.strategy.unwrap_or_else(|| {
            self.config
                .reasoning
                .strategy
                .parse()
                .unwrap_or(StrategyKind::Auto)
        });
        let planner = Planner::new(strategy, self.config.reasoning.max_steps);
        let plan = planner.plan(input);

        let host = PipelineHost {
            pipeline: Arc::clone(&self.pipeline),
            memory: Arc::clone(&self.memory),
            use_cache: opts.use_cache,
        };
        let runtime_config = self.runtime_config.read().await.clone();
        let execution = {
            let registry = self.registry.read().await;
            let executor = Executor::new(
                &registry,
                &runtime_config,
                &host,
                self.config.reasoning.max_steps,
                Duration::from_millis(self.config.reasoning.timeout_ms),
            )
            .with_bus(&self.bus)
            .with_approval_token(opts.approval_token.clone());
            executor.execute(&plan).await
        };

        let result = match execution {
            Ok(result) => result,
            Err(err) => {
                let agent_err = AgentError::from_reason(err, request_id);
                self.bus.publish(
                    Topic::AgentError,
                    serde_json::json!({
                        "request_id": request_id.to_string(),
                        "code": agent_err.code(),
                    }),
                );
                // Failures are learning samples too.
                self.learning
                    .record(InteractionSample {
                        input: input.to_string(),
                        response: agent_err.code().to_string(),
                        feedback: None,
                        had_error: true,
                    })
                    .await;
                return Err(agent_err);
            }
        };

        let text = result.final_output().unwrap_or_default().to_string();

        if let Err(err) = self
            .memory
            .store_interaction(input, &text, &format!("session:{}", opts.session))
            .await
        {
            // Losing a memory write degrades recall; it does not fail the
            // interaction the user already got an answer for.
            warn!(%err, "failed to store interaction");
        }

        self.learning
            .record(InteractionSample {
                input: input.to_string(),
                response: text.clone(),
                feedback: None,
                had_error: false,
            })
            .await;

        let tool_calls = result
            .outcomes
            .iter()
            .filter(|o| o.kind == "tool")
            .map(|o| ToolCallSummary {
                tool: plan
                    .steps
                    .get(o.index)
                    .and_then(|s| match s {
                        sentra_reasoning::Step::Tool { tool_name, .. } => Some(tool_name.clone()),
                        _ => None,
                    })
                    .unwrap_or_default(),
                simulated: o.simulated,
                output: o.output.clone(),
            })
            .collect();

        Ok(ProcessOutcome {
            request_id,
            text,
            tool_calls,
            performance: Performance {
                duration_ms: started.elapsed().as_millis() as u64,
                truncated: result.truncated,
            },
            memory_snapshot: self.memory.stats().await,
            reasoning: result.outcomes,
        })
    }

    /// Execute a stored procedural recipe.  The recipe is data until this
    /// point; conversion validates its ops and every tool step still faces
    /// the permission gate.
    pub async fn run_recipe(
        &self,
        name: &str,
        args: HashMap<String, String>,
        opts: &ProcessOptions,
    ) -> Result<ProcessOutcome, AgentError> {
        let request_id = Uuid::new_v4();
        let started = Instant::now();

        let recipe = self
            .memory
            .recipe(name)
            .await
            .ok_or_else(|| AgentError::NotFound {
                message: format!("recipe '{name}'"),
                request_id,
            })?;
        let plan = sentra_reasoning::plan_from_recipe(&recipe, &args)
            .map_err(|e| AgentError::from_reason(e, request_id))?;

        let lane = {
            let mut lanes = self.lanes.lock().await;
            Arc::clone(lanes.entry(opts.session.clone()).or_default())
        };
        let _serial = lane.lock().await;

        let host = PipelineHost {
            pipeline: Arc::clone(&self.pipeline),
            memory: Arc::clone(&self.memory),
            use_cache: opts.use_cache,
        };
        let runtime_config = self.runtime_config.read().await.clone();
        let execution = {
            let registry = self.registry.read().await;
            let executor = Executor::new(
                &registry,
                &runtime_config,
                &host,
                self.config.reasoning.max_steps,
                Duration::from_millis(self.config.reasoning.timeout_ms),
            )
            .with_bus(&self.bus)
            .with_approval_token(opts.approval_token.clone());
            executor.execute(&plan).await
        };
        let result = execution.map_err(|e| AgentError::from_reason(e, request_id))?;

        let text = result.final_output().unwrap_or_default().to_string();
        let tool_calls = result
            .outcomes
            .iter()
            .filter(|o| o.kind == "tool")
            .map(|o| ToolCallSummary {
                tool: plan
                    .steps
                    .get(o.index)
                    .and_then(|s| match s {
                        sentra_reasoning::Step::Tool { tool_name, .. } => Some(tool_name.clone()),
                        _ => None,
                    })
                    .unwrap_or_default(),
                simulated: o.simulated,
                output: o.output.clone(),
            })
            .collect();

        Ok(ProcessOutcome {
            request_id,
            text,
            tool_calls,
            performance: Performance {
                duration_ms: started.elapsed().as_millis() as u64,
                truncated: result.truncated,
            },
            memory_snapshot: self.memory.stats().await,
            reasoning: result.outcomes,
        })
    }

    /// Direct knowledge query through the retrieval/generation pipeline.
    pub async fn query_knowledge(
        &self,
        query: &str,
        opts: &QueryOptions,
    ) -> Result<KnowledgeAnswer, AgentError> {
        let request_id = Uuid::new_v4();
        let answer: QueryAnswer = self
            .pipeline
            .answer(query, opts)
            .await
            .map_err(|e| AgentError::from_pipeline(e, request_id))?;

        let techniques = self
            .memory
            .knowledge_catalog(query, &BTreeMap::new(), 5)
            .await;
        let tools = {
            let registry = self.registry.read().await;
            registry
                .list(None)
                .into_iter()
                .map(|d| d.name)
                .filter(|name| answer.response.to_lowercase().contains(&name.to_lowercase()))
                .collect()
        };
        let code_examples = extract_code_blocks(&answer.response);

        Ok(KnowledgeAnswer {
            techniques,
            tools,
            code_examples,
            confidence: answer.confidence,
            sources: answer.sources,
            cached: answer.cached,
            hit_type: answer.hit_type.map(|h| {
                match h {
                    sentra_cag::HitType::Exact => "exact",
                    sentra_cag::HitType::Semantic => "semantic",
                }
                .to_string()
            }),
            similarity_score: answer.similarity_score,
            degraded: answer.degraded,
            processing_time_ms: answer.processing_time_ms,
            response: answer.response,
        })
    }

    /// Ingest a document: split into paragraph chunks, embed, index.
    pub async fn ingest(&self, doc_path: &Path) -> Result<(usize, usize), AgentError> {
        let request_id = Uuid::new_v4();
        let raw = tokio::fs::read_to_string(doc_path).await.map_err(|e| {
            AgentError::NotFound {
                message: format!("{}: {e}", doc_path.display()),
                request_id,
            }
        })?;

        let chunks: Vec<String> = raw
            .split("\n\n")
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(String::from)
            .collect();

        self.memory
            .ingest_chunks(chunks)
            .await
            .map_err(|e: MemoryError| AgentError::from_memory(e, request_id))
    }

    // ── Learn mode ───────────────────────────────────────────────────────

    pub async fn start_mission(&self, topic: &str) -> Mission {
        self.missions.start(topic).await
    }

    /// Submit an answer for a mission step.  Accepted when the answer is
    /// substantive and on-topic; either way it feeds the learning loop.
    pub async fn submit_step(
        &self,
        mission_id: Uuid,
        step_index: usize,
        answer: &str,
    ) -> Result<(bool, Mission), AgentError> {
        let request_id = Uuid::new_v4();
        let mission = self
            .missions
            .get(mission_id)
            .await
            .ok_or_else(|| AgentError::NotFound {
                message: format!("mission {mission_id}"),
                request_id,
            })?;

        let topic_lower = mission.topic.to_lowercase();
        let accepted = answer.trim().len() >= 30
            && answer
                .to_lowercase()
                .split(|ch: char| !ch.is_alphanumeric())
                .any(|word| !word.is_empty() && topic_lower.contains(word));

        let updated = self
            .missions
            .submit(mission_id, step_index, answer)
            .await
            .ok_or_else(|| AgentError::NotFound {
                message: format!("mission {mission_id} step {step_index}"),
                request_id,
            })?;

        self.learning
            .record(InteractionSample {
                input: format!("mission[{}] step {}", mission.topic, step_index),
                response: answer.to_string(),
                feedback: None,
                had_error: !accepted,
            })
            .await;

        Ok((accepted, updated))
    }

    /// Structured feedback on a previous answer.
    pub async fn provide_feedback(&self, about: &str, feedback: &str) {
        self.learning
            .record(InteractionSample {
                input: about.to_string(),
                response: String::new(),
                feedback: Some(feedback.to_string()),
                had_error: false,
            })
            .await;
    }

    pub async fn explain_concept(&self, concept: &str) -> Result<KnowledgeAnswer, AgentError> {
        self.query_knowledge(
            &format!("Explain {concept} step by step for a learner"),
            &QueryOptions::default(),
        )
        .await
    }

    // ── Health surface ───────────────────────────────────────────────────

    pub async fn health_check(&self) -> HealthReport {
        self.monitor.run_check().await
    }

    pub async fn health_report(&self) -> String {
        let report = self.monitor.run_check().await;
        HealthMonitor::markdown_report(&report)
    }

    pub async fn trigger_self_healing(&self) -> Vec<HealingOutcome> {
        self.monitor.trigger_healing().await
    }

    pub async fn check_and_heal(&self) -> (HealthReport, Vec<HealingOutcome>) {
        self.monitor.check_and_heal().await
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn memory(&self) -> &Arc<MemorySubsystem> {
        &self.memory
    }

    pub fn auth(&self) -> &Arc<AuthService> {
        &self.auth
    }

    pub fn learning(&self) -> &Arc<LearningLoop> {
        &self.learning
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

/// Pull fenced code blocks out of a response.
fn extract_code_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let after = &rest[start + 3..];
        // Skip the language tag line.
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        let Some(end) = body.find("```") else { break };
        let block = body[..end].trim();
        if !block.is_empty() {
            blocks.push(block.to_string());
        }
        rest = &body[end + 3..];
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_block_extraction() {
        let text = "Use this:\n```bash\nnmap -sV 10.0.0.1\n```\nand then\n```\necho done\n```";
        let blocks = extract_code_blocks(text);
        assert_eq!(blocks, vec!["nmap -sV 10.0.0.1", "echo done"]);
    }

    #[test]
    fn no_blocks_no_results() {
        assert!(extract_code_blocks("plain text only").is_empty());
        assert!(extract_code_blocks("unterminated ```bash\nnmap").is_empty());
    }
}
