//! LLM backend client.
//!
//! The core treats the model as an RPC endpoint with two operations:
//! `generate(prompt) → text` and `embed(text) → vector`.  Everything else
//! (prompt construction, caching, retries, circuit breaking) lives in the
//! calling crates.  When the backend is unreachable this client returns a
//! typed error; it never substitutes text of its own.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use sentra_config::LlmConfig;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("LLM call timed out after {0} ms")]
    Timeout(u64),

    #[error("LLM backend returned a malformed response: {0}")]
    Malformed(String),
}

pub type LlmResult<T> = Result<T, LlmError>;

/// The generation/embedding contract the rest of the core consumes.
/// Production uses [`HttpBackend`]; tests substitute mocks.
#[async_trait]
pub trait LanguageBackend: Send + Sync {
    async fn generate(&self, prompt: &str) -> LlmResult<String>;

    async fn embed(&self, text: &str) -> LlmResult<Vec<f32>>;

    /// Short round-trip used by the health monitor.  Default implementation
    /// issues a one-word generation.
    async fn ping(&self) -> LlmResult<()> {
        self.generate("ping").await.map(|_| ())
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    text: String,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    vector: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    max_tokens: u32,
}

/// HTTP client for the backend's JSON API (`POST /generate`, `POST /embed`).
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    timeout_ms: u64,
    max_tokens: u32,
}

impl HttpBackend {
    /// Build from config.  The underlying connection pool is bounded and
    /// idle connections are reaped, so concurrent callers share sockets
    /// instead of opening one per request.
    pub fn new(config: &LlmConfig) -> LlmResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| LlmError::BackendUnavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            timeout_ms: config.timeout_ms,
            max_tokens: config.max_tokens,
        })
    }

    fn classify(&self, error: reqwest::Error) -> LlmError {
        if error.is_timeout() {
            LlmError::Timeout(self.timeout_ms)
        } else if error.is_decode() {
            LlmError::Malformed(error.to_string())
        } else {
            LlmError::BackendUnavailable(error.to_string())
        }
    }
}

#[async_trait]
impl LanguageBackend for HttpBackend {
    async fn generate(&self, prompt: &str) -> LlmResult<String> {
        let endpoint = format!("{}/generate", self.base_url);
        debug!(endpoint = %endpoint, prompt_len = prompt.len(), "LLM generate");

        let response = self
            .client
            .post(&endpoint)
            .json(&GenerateRequest {
                prompt,
                max_tokens: self.max_tokens,
            })
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::BackendUnavailable(format!(
                "generate returned HTTP {status}"
            )));
        }

        let body: GenerateResponse = response.json().await.map_err(|e| self.classify(e))?;
        Ok(body.text)
    }

    async fn embed(&self, text: &str) -> LlmResult<Vec<f32>> {
        let endpoint = format!("{}/embed", self.base_url);
        debug!(endpoint = %endpoint, text_len = text.len(), "LLM embed");

        let response = self
            .client
            .post(&endpoint)
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::BackendUnavailable(format!(
                "embed returned HTTP {status}"
            )));
        }

        let body: EmbedResponse = response.json().await.map_err(|e| self.classify(e))?;
        if body.vector.is_empty() {
            return Err(LlmError::Malformed("empty embedding vector".to_string()));
        }
        Ok(body.vector)
    }
}
