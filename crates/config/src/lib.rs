use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Vector store backend: `inmemory`, `server`, or `sql`.
    pub vector_store: String,
    /// Root directory for encrypted store files.
    pub persistence_path: String,
    /// Maximum number of CAG cache entries before LRU eviction.
    pub cache_size: usize,
    /// Cache entry time-to-live in seconds.
    pub cache_ttl_secs: u64,
    /// Working-memory ring capacity (FIFO eviction on overflow).
    pub working_memory_capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            vector_store: "inmemory".to_string(),
            persistence_path: "data".to_string(),
            cache_size: 10_000,
            cache_ttl_secs: 3600,
            working_memory_capacity: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the generation/embedding backend.  Overridden at runtime
    /// by the `SENTRA_LLM_URL` environment variable when set.
    pub api_url: String,
    pub timeout_ms: u64,
    pub max_tokens: u32,
    /// Upper bound of retrieved context characters injected into a prompt.
    pub max_context_chars: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8085".to_string(),
            timeout_ms: 15_000,
            max_tokens: 1024,
            max_context_chars: 6_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub password_min_length: usize,
    pub max_failed_attempts: u32,
    pub lockout_minutes: i64,
    pub session_timeout_minutes: i64,
    /// JWT lifetime in seconds.
    pub jwt_expiration_secs: i64,
    /// Days of audit records retained in the in-memory query ring.
    pub audit_retention_days: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            password_min_length: 12,
            max_failed_attempts: 5,
            lockout_minutes: 30,
            session_timeout_minutes: 60,
            jwt_expiration_secs: 3600,
            audit_retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningConfig {
    pub max_steps: usize,
    pub timeout_ms: u64,
    /// Planning strategy: `auto`, `zero-shot`, `evolutionary`,
    /// or `first-principles`.
    pub strategy: String,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            max_steps: 8,
            timeout_ms: 30_000,
            strategy: "auto".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CagConfig {
    /// Cosine similarity floor for a semantic cache hit.
    pub similarity_threshold: f32,
    pub pre_warm_on_start: bool,
}

impl Default for CagConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            pre_warm_on_start: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_per_sec: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub max_requests: u32,
    pub window_ms: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_requests: 5,
            window_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitsConfig {
    /// LLM calls: token bucket.
    pub llm: BucketConfig,
    /// Tool execution: sliding window, tracked per tool name.
    pub tool: WindowConfig,
    /// Memory subsystem operations: token bucket.
    pub memory: BucketConfig,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            llm: BucketConfig {
                capacity: 10,
                refill_per_sec: 1.0,
            },
            tool: WindowConfig {
                max_requests: 5,
                window_ms: 60_000,
            },
            memory: BucketConfig {
                capacity: 100,
                refill_per_sec: 10.0,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub memory: MemoryConfig,
    pub llm: LlmConfig,
    pub auth: AuthConfig,
    pub reasoning: ReasoningConfig,
    pub cag: CagConfig,
    pub health: HealthConfig,
    pub rate_limits: RateLimitsConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("SENTRA_LLM_URL") {
            if !value.is_empty() {
                config.llm.api_url = value;
            }
        }
        if let Ok(value) = env::var("SENTRA_DATA_DIR") {
            if !value.is_empty() {
                config.memory.persistence_path = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        Path::new(&self.memory.persistence_path)
    }
}
