//! Pluggable vector store: in-memory, external server, or relational.
//!
//! All variants rank by cosine similarity and honor `k`/`threshold`.  Any
//! backend failure surfaces as [`VectorError::BackendUnavailable`]; callers
//! degrade to semantic-memory-only retrieval rather than failing the
//! request.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::extract::cosine_similarity;

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("vector backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("vector storage failure: {0}")]
    Storage(String),

    #[error("embedding failure: {0}")]
    Embedding(String),
}

pub type VectorResult<T> = Result<T, VectorError>;

/// A ranked similarity hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorHit {
    pub id: String,
    pub text: String,
    pub score: f32,
}

/// Text → vector mapping.  The production implementation wraps the LLM
/// backend's `embed` endpoint; [`HashEmbedder`] is the deterministic
/// offline fallback used by tests and keyless dev setups.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> VectorResult<Vec<f32>>;
}

/// Deterministic token-hash embedder.
///
/// Each token is hashed into a dimension/sign pair, so texts sharing
/// vocabulary land near each other.  Not a semantic model — just stable,
/// dependency-free geometry.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(8) }
    }

    /// Synchronous embedding used by callers that rank many small texts in
    /// a tight loop (e.g. plan fitness scoring).
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dim];
        for token in text
            .split(|ch: char| !ch.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
        {
            let digest = Sha256::digest(token.as_bytes());
            let slot = usize::from(digest[0]) << 8 | usize::from(digest[1]);
            let sign = if digest[2] & 1 == 0 { 1.0 } else { -1.0 };
            vector[slot % self.dim] += sign;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> VectorResult<Vec<f32>> {
        Ok(self.embed_sync(text))
    }
}

/// Embedding add / k-NN search / delete.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Store `(id, text)` with its computed embedding.  Idempotent on `id`:
    /// re-adding replaces the stored text and vector.
    async fn add(&self, id: &str, text: &str) -> VectorResult<()>;

    /// At most `k` results with `score >= threshold`, best first.
    async fn find_similar(&self, query: &str, k: usize, threshold: f32) -> VectorResult<Vec<VectorHit>>;

    async fn remove(&self, id: &str) -> VectorResult<bool>;

    async fn count(&self) -> VectorResult<usize>;
}

// ── In-memory variant ─────────────────────────────────────────────────────────

pub struct InMemoryVectorStore {
    embedder: Arc<dyn Embedder>,
    entries: RwLock<HashMap<String, (String, Vec<f32>)>>,
}

impl InMemoryVectorStore {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            entries: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn add(&self, id: &str, text: &str) -> VectorResult<()> {
        let vector = self.embedder.embed(text).await?;
        self.entries
            .write()
            .await
            .insert(id.to_string(), (text.to_string(), vector));
        Ok(())
    }

    async fn find_similar(&self, query: &str, k: usize, threshold: f32) -> VectorResult<Vec<VectorHit>> {
        let query_vec = self.embedder.embed(query).await?;
        let entries = self.entries.read().await;

        let mut hits: Vec<VectorHit> = entries
            .iter()
            .filter_map(|(id, (text, vector))| {
                let score = cosine_similarity(&query_vec, vector);
                (score >= threshold).then(|| VectorHit {
                    id: id.clone(),
                    text: text.clone(),
                    score,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(k);
        Ok(hits)
    }

    async fn remove(&self, id: &str) -> VectorResult<bool> {
        Ok(self.entries.write().await.remove(id).is_some())
    }

    async fn count(&self) -> VectorResult<usize> {
        Ok(self.entries.read().await.len())
    }
}

// ── External server variant ───────────────────────────────────────────────────

/// Client for a dedicated vector server speaking a small JSON API:
/// `POST /vectors {id, text}`, `POST /search {query, k, threshold}`,
/// `POST /delete {id}`, `GET /count`.
pub struct HttpVectorStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpVectorStore {
    pub fn new(base_url: &str) -> VectorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| VectorError::BackendUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn unavailable(error: reqwest::Error) -> VectorError {
        VectorError::BackendUnavailable(error.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Vec<VectorHit>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: usize,
}

#[async_trait]
impl VectorStore for HttpVectorStore {
    async fn add(&self, id: &str, text: &str) -> VectorResult<()> {
        let response = self
            .client
            .post(format!("{}/vectors", self.base_url))
            .json(&serde_json::json!({ "id": id, "text": text }))
            .send()
            .await
            .map_err(Self::unavailable)?;
        if !response.status().is_success() {
            return Err(VectorError::Storage(format!("add returned HTTP {}", response.status())));
        }
        Ok(())
    }

    async fn find_similar(&self, query: &str, k: usize, threshold: f32) -> VectorResult<Vec<VectorHit>> {
        let response = self
            .client
            .post(format!("{}/search", self.base_url))
            .json(&serde_json::json!({ "query": query, "k": k, "threshold": threshold }))
            .send()
            .await
            .map_err(Self::unavailable)?;
        if !response.status().is_success() {
            return Err(VectorError::BackendUnavailable(format!(
                "search returned HTTP {}",
                response.status()
            )));
        }
        let body: SearchResponse = response.json().await.map_err(Self::unavailable)?;
        Ok(body.results)
    }

    async fn remove(&self, id: &str) -> VectorResult<bool> {
        let response = self
            .client
            .post(format!("{}/delete", self.base_url))
            .json(&serde_json::json!({ "id": id }))
            .send()
            .await
            .map_err(Self::unavailable)?;
        Ok(response.status().is_success())
    }

    async fn count(&self) -> VectorResult<usize> {
        let response = self
            .client
            .get(format!("{}/count", self.base_url))
            .send()
            .await
            .map_err(Self::unavailable)?;
        let body: CountResponse = response.json().await.map_err(Self::unavailable)?;
        Ok(body.count)
    }
}

// ── Relational variant ────────────────────────────────────────────────────────

/// SQLite-backed store with the embedding held in a BLOB column
/// (f32 little-endian).  Ranking happens in-process after a full column
/// scan; adequate for the catalog sizes this core manages.
pub struct SqliteVectorStore {
    conn: Mutex<rusqlite::Connection>,
    embedder: Arc<dyn Embedder>,
}

impl SqliteVectorStore {
    pub fn open(path: impl AsRef<Path>, embedder: Arc<dyn Embedder>) -> VectorResult<Self> {
        let conn = rusqlite::Connection::open(path.as_ref())
            .map_err(|e| VectorError::Storage(e.to_string()))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS vectors (
                id TEXT PRIMARY KEY,
                text TEXT NOT NULL,
                embedding BLOB NOT NULL
            )",
            [],
        )
        .map_err(|e| VectorError::Storage(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
            embedder,
        })
    }

    fn encode(vector: &[f32]) -> Vec<u8> {
        vector.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn decode(blob: &[u8]) -> Vec<f32> {
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn add(&self, id: &str, text: &str) -> VectorResult<()> {
        let vector = self.embedder.embed(text).await?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO vectors (id, text, embedding) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET text = ?2, embedding = ?3",
            rusqlite::params![id, text, Self::encode(&vector)],
        )
        .map_err(|e| VectorError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn find_similar(&self, query: &str, k: usize, threshold: f32) -> VectorResult<Vec<VectorHit>> {
        let query_vec = self.embedder.embed(query).await?;
        let conn = self.conn.lock().await;

        let mut stmt = conn
            .prepare("SELECT id, text, embedding FROM vectors")
            .map_err(|e| VectorError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            })
            .map_err(|e| VectorError::Storage(e.to_string()))?;

        let mut hits = Vec::new();
        for row in rows {
            let (id, text, blob) = row.map_err(|e| VectorError::Storage(e.to_string()))?;
            let score = cosine_similarity(&query_vec, &Self::decode(&blob));
            if score >= threshold {
                hits.push(VectorHit { id, text, score });
            }
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        hits.truncate(k);
        Ok(hits)
    }

    async fn remove(&self, id: &str) -> VectorResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute("DELETE FROM vectors WHERE id = ?1", rusqlite::params![id])
            .map_err(|e| VectorError::Storage(e.to_string()))?;
        Ok(changed > 0)
    }

    async fn count(&self) -> VectorResult<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM vectors", [], |row| row.get(0))
            .map_err(|e| VectorError::Storage(e.to_string()))?;
        Ok(count as usize)
    }
}

/// Build the configured vector store variant.
///
/// `server` needs `SENTRA_VECTOR_URL`; when it is absent the factory warns
/// and falls back to the in-memory variant rather than failing startup.
pub fn create_vector_store(
    kind: &str,
    embedder: Arc<dyn Embedder>,
    data_dir: &Path,
) -> VectorResult<Arc<dyn VectorStore>> {
    match kind {
        "server" => match std::env::var("SENTRA_VECTOR_URL") {
            Ok(url) if !url.trim().is_empty() => {
                info!(url = %url, "using external vector server");
                Ok(Arc::new(HttpVectorStore::new(&url)?))
            }
            _ => {
                warn!("SENTRA_VECTOR_URL not set; falling back to in-memory vector store");
                Ok(Arc::new(InMemoryVectorStore::new(embedder)))
            }
        },
        "sql" => {
            let path = data_dir.join("memory/vectors.db");
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| VectorError::Storage(e.to_string()))?;
            }
            info!(path = %path.display(), "using sqlite vector store");
            Ok(Arc::new(SqliteVectorStore::open(path, embedder)?))
        }
        _ => Ok(Arc::new(InMemoryVectorStore::new(embedder))),
    }
}
