//! Hybrid retrieval/generation pipeline: CAG first, then RAG over memory
//! and the knowledge catalog, then the LLM under rate limit, circuit
//! breaker, and bounded retry.  Misses on the same fingerprint collapse to
//! one generation; on LLM failure the cache ladder answers in degraded
//! mode or the caller gets a typed `GenerationUnavailable`.  The pipeline
//! never synthesizes content itself.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use sentra_bus::{EventBus, Topic};
use sentra_cag::{CagCache, HitType, SingleFlight, fingerprint};
use sentra_guard::{BreakerConfig, CircuitBreaker, GuardError, RetrySchedule, TokenBucket};
use sentra_llm::{LanguageBackend, LlmError};
use sentra_memory::{MemorySubsystem, RetrieveOptions};

/// Fixed semantic floor of the degraded fallback ladder.
const FALLBACK_SEMANTIC_FLOOR: f32 = 0.95;

/// System preamble ahead of every augmented prompt.
const SYSTEM_PREAMBLE: &str = "You are a cybersecurity assistant. Answer using the provided \
context where it is relevant, and say so when it is not.";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("generation unavailable: {0}")]
    GenerationUnavailable(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub use_cache: bool,
    pub debug: bool,
    pub category: Option<String>,
    pub difficulty: Option<String>,
    pub limit: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            debug: false,
            category: None,
            difficulty: None,
            limit: 6,
        }
    }
}

impl QueryOptions {
    /// Salient options that participate in the cache fingerprint.
    fn fingerprint_options(&self) -> BTreeMap<String, String> {
        let mut options = BTreeMap::new();
        if let Some(category) = &self.category {
            options.insert("category".to_string(), category.clone());
        }
        if let Some(difficulty) = &self.difficulty {
            options.insert("difficulty".to_string(), difficulty.clone());
        }
        options
    }

    fn graph_filters(&self) -> BTreeMap<String, String> {
        self.fingerprint_options()
    }
}

#[derive(Debug, Clone)]
pub struct QueryAnswer {
    pub response: String,
    pub sources: Vec<String>,
    pub confidence: f32,
    pub cached: bool,
    pub hit_type: Option<HitType>,
    pub similarity_score: Option<f32>,
    pub degraded: bool,
    pub processing_time_ms: u64,
}

/// Shared result of one single-flight generation.
#[derive(Debug, Clone)]
struct Generated {
    response: String,
    sources: Vec<String>,
    confidence: f32,
}

pub struct Pipeline {
    memory: Arc<MemorySubsystem>,
    backend: Arc<dyn LanguageBackend>,
    bus: EventBus,
    llm_bucket: Arc<TokenBucket>,
    breaker: CircuitBreaker,
    retry: RetrySchedule,
    flight: Arc<SingleFlight<Result<Generated, String>>>,
    max_context_chars: usize,
    llm_timeout: Duration,
}

impl Pipeline {
    pub fn new(
        memory: Arc<MemorySubsystem>,
        backend: Arc<dyn LanguageBackend>,
        bus: EventBus,
        llm_config: &sentra_config::LlmConfig,
        llm_bucket_config: &sentra_config::BucketConfig,
    ) -> Self {
        Self {
            memory,
            backend,
            bus,
            llm_bucket: Arc::new(TokenBucket::from_config("llm", llm_bucket_config)),
            breaker: CircuitBreaker::new("llm", BreakerConfig::default()),
            retry: RetrySchedule::default(),
            flight: Arc::new(SingleFlight::new()),
            max_context_chars: llm_config.max_context_chars,
            llm_timeout: Duration::from_millis(llm_config.timeout_ms),
        }
    }

    fn cache(&self) -> &Arc<CagCache> {
        self.memory.cache()
    }

    /// Answer `query` through the CAG → RAG → LLM path.
    pub async fn answer(&self, query: &str, opts: &QueryOptions) -> PipelineResult<QueryAnswer> {
        let started = Instant::now();
        let options = opts.fingerprint_options();

        // Embedding enables semantic cache probes; its loss degrades to
        // exact-only matching rather than failing the request.
        let embedding = match self.backend.embed(query).await {
            Ok(vector) => Some(vector),
            Err(err) => {
                debug!(%err, "query embedding unavailable");
                None
            }
        };

        if opts.use_cache && !opts.debug {
            if let Some(hit) = self.cache().lookup(query, embedding.as_deref(), &options) {
                let answer = QueryAnswer {
                    response: hit.response,
                    sources: hit.sources,
                    confidence: hit.confidence,
                    cached: true,
                    hit_type: Some(hit.hit_type),
                    similarity_score: Some(hit.similarity),
                    degraded: false,
                    processing_time_ms: started.elapsed().as_millis() as u64,
                };
                self.publish_response(query, &answer);
                return Ok(answer);
            }
        }

        // An open circuit fails fast without touching the downstream; the
        // cache ladder may still answer in degraded mode.
        if let Err(GuardError::CircuitOpen { .. }) = self.breaker.check() {
            return self.fallback(query, embedding.as_deref(), &options, "llm circuit open", started);
        }

        // Concurrent misses on one fingerprint share a single generation.
        // The computation runs detached (waiter cancellation must not kill
        // it), so everything it needs is captured by value.
        let fp = fingerprint(query, &options);
        let generated = {
            let memory = Arc::clone(&self.memory);
            let backend = Arc::clone(&self.backend);
            let bucket = Arc::clone(&self.llm_bucket);
            let retry = self.retry.clone();
            let query_owned = query.to_string();
            let opts_owned = opts.clone();
            let embedding_owned = embedding.clone();
            let llm_timeout = self.llm_timeout;
            let max_context = self.max_context_chars;

            self.flight
                .run(&fp, move || async move {
                    generate_once(
                        memory,
                        backend,
                        bucket,
                        &query_owned,
                        &opts_owned,
                        embedding_owned,
                        retry,
                        llm_timeout,
                        max_context,
                    )
                    .await
                })
                .await
        };

        match generated {
            Ok(answer) => {
                self.breaker.record_success();
                let answer = QueryAnswer {
                    response: answer.response,
                    sources: answer.sources,
                    confidence: answer.confidence,
                    cached: false,
                    hit_type: None,
                    similarity_score: None,
                    degraded: false,
                    processing_time_ms: started.elapsed().as_millis() as u64,
                };
                self.publish_response(query, &answer);
                Ok(answer)
            }
            Err(reason) => {
                self.breaker.record_failure();
                self.fallback(query, embedding.as_deref(), &options, &reason, started)
            }
        }
    }

    /// Fallback ladder on generation failure: exact hit, then semantic hit
    /// at the fixed 0.95 floor, then a typed error.  Ladder answers carry
    /// `degraded: true` so callers can display a notice.
    fn fallback(
        &self,
        query: &str,
        embedding: Option<&[f32]>,
        options: &BTreeMap<String, String>,
        reason: &str,
        started: Instant,
    ) -> PipelineResult<QueryAnswer> {
        warn!(%reason, "generation failed; consulting cache ladder");

        if let Some(hit) =
            self.cache()
                .lookup_with_floor(query, embedding, options, FALLBACK_SEMANTIC_FLOOR)
        {
            let answer = QueryAnswer {
                response: hit.response,
                sources: hit.sources,
                confidence: hit.confidence,
                cached: true,
                hit_type: Some(hit.hit_type),
                similarity_score: Some(hit.similarity),
                degraded: true,
                processing_time_ms: started.elapsed().as_millis() as u64,
            };
            self.publish_response(query, &answer);
            return Ok(answer);
        }

        self.bus.publish(
            Topic::AgentError,
            serde_json::json!({ "code": "GenerationUnavailable", "query": query }),
        );
        Err(PipelineError::GenerationUnavailable(reason.to_string()))
    }

    /// Warm the cache by answering each query once.  Failures are logged
    /// and skipped; pre-warming must never block startup.
    pub async fn pre_warm(&self, queries: &[String]) -> usize {
        let mut warmed = 0usize;
        for query in queries {
            match self.answer(query, &QueryOptions::default()).await {
                Ok(_) => warmed += 1,
                Err(err) => warn!(%err, query, "pre-warm query failed"),
            }
        }
        info!(warmed, total = queries.len(), "cache pre-warm finished");
        warmed
    }

    fn publish_response(&self, query: &str, answer: &QueryAnswer) {
        self.bus.publish(
            Topic::AgentResponse,
            serde_json::json!({
                "query": query,
                "cached": answer.cached,
                "degraded": answer.degraded,
                "confidence": answer.confidence,
            }),
        );
    }
}

/// One actual generation: retrieval fan-out, prompt assembly, guarded LLM
/// call, cache insert.
#[allow(clippy::too_many_arguments)]
async fn generate_once(
    memory: Arc<MemorySubsystem>,
    backend: Arc<dyn LanguageBackend>,
    bucket: Arc<TokenBucket>,
    query: &str,
    opts: &QueryOptions,
    embedding: Option<Vec<f32>>,
    retry: RetrySchedule,
    llm_timeout: Duration,
    max_context_chars: usize,
) -> Result<Generated, String> {
    // The rate-limit token covers the LLM call itself; waiters joining the
    // single flight never consume one.
    bucket
        .consume(1, llm_timeout)
        .await
        .map_err(|err| err.to_string())?;

    // Parallel retrieval fan-out: memory similarity + knowledge catalog.
    let retrieve_opts = RetrieveOptions {
        limit: opts.limit,
        use_cache: false,
    };
    let filters = opts.graph_filters();
    let (retrieved, catalog) = tokio::join!(
        memory.retrieve_relevant(query, &retrieve_opts),
        memory.knowledge_catalog(query, &filters, opts.limit),
    );

    let memories = match retrieved {
        Ok(outcome) => outcome.memories,
        Err(err) => {
            warn!(%err, "memory retrieval failed; generating without context");
            Vec::new()
        }
    };
    let top_score = memories.first().map(|m| m.score).unwrap_or(0.0);

    let prompt = build_prompt(query, &memories, &catalog, max_context_chars);
    let mut sources: Vec<String> = memories.iter().map(|m| m.id.clone()).collect();
    sources.extend(catalog.iter().map(|c| format!("catalog:{c}")));

    // Bounded retry over transient failures only.
    let response = retry
        .run(
            |err: &LlmError| {
                matches!(err, LlmError::BackendUnavailable(_) | LlmError::Timeout(_))
            },
            || {
                let backend = Arc::clone(&backend);
                let prompt = prompt.clone();
                async move {
                    match tokio::time::timeout(llm_timeout, backend.generate(&prompt)).await {
                        Ok(result) => result,
                        Err(_) => Err(LlmError::Timeout(llm_timeout.as_millis() as u64)),
                    }
                }
            },
        )
        .await
        .map_err(|err| err.to_string())?;

    let confidence = derive_confidence(top_score, &response);
    memory.cache().insert(
        query,
        embedding.unwrap_or_default(),
        &opts.fingerprint_options(),
        response.clone(),
        sources.clone(),
        confidence,
    );

    Ok(Generated {
        response,
        sources,
        confidence,
    })
}

/// Augmented prompt: preamble, ranked snippets bounded by
/// `max_context_chars`, then the user query.
fn build_prompt(
    query: &str,
    memories: &[sentra_memory::ScoredMemory],
    catalog: &[String],
    max_context_chars: usize,
) -> String {
    let mut context = String::new();
    for memory in memories {
        let line = format!("- [{:.2}] {}\n", memory.score, memory.text);
        if context.len() + line.len() > max_context_chars {
            break;
        }
        context.push_str(&line);
    }
    for concept in catalog {
        let line = format!("- concept: {concept}\n");
        if context.len() + line.len() > max_context_chars {
            break;
        }
        context.push_str(&line);
    }

    if context.is_empty() {
        format!("{SYSTEM_PREAMBLE}\n\nQUESTION:\n{query}\n\nANSWER:")
    } else {
        format!("{SYSTEM_PREAMBLE}\n\nCONTEXT:\n{context}\nQUESTION:\n{query}\n\nANSWER:")
    }
}

/// Confidence blends the best retrieval score with a response-shape
/// signal: substantial, non-error responses rate higher.
fn derive_confidence(top_score: f32, response: &str) -> f32 {
    let trimmed = response.trim();
    let looks_like_error = trimmed.is_empty()
        || trimmed.to_lowercase().starts_with("error")
        || trimmed.to_lowercase().contains("unavailable");
    let length_signal = if looks_like_error {
        0.0
    } else if trimmed.len() >= 40 {
        1.0
    } else {
        0.5
    };
    (0.5 * top_score + 0.5 * length_signal).clamp(0.0, 1.0)
}
