//! The memory subsystem facade.
//!
//! Owns the four typed stores and the concept graph exclusively; external
//! components go through the methods here.  Reader/writer discipline is
//! `tokio::sync::RwLock` per store — concurrent readers, exclusive writers.
//! Persistence is crash-consistent per store (atomic rename in the vault),
//! not atomic across stores.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use sentra_bus::{EventBus, Topic};
use sentra_cag::{CacheExport, CacheStats, CagCache};
use sentra_vault::{EncryptedFile, StoreKeyring, VaultResult};

use crate::episodic::EpisodicStore;
use crate::extract::extract_concepts;
use crate::graph::ConceptGraph;
use crate::procedural::{ProceduralStore, Recipe};
use crate::semantic::SemanticStore;
use crate::value::{MemoryItem, Value};
use crate::vector::{Embedder, VectorStore};
use crate::working::WorkingMemory;
use crate::MemoryResult;

/// Number of concept phrases extracted per interaction.
const CONCEPTS_PER_INTERACTION: usize = 5;
/// Characters of interaction text kept as the semantic snippet.
const SNIPPET_CHARS: usize = 400;

/// Per-store cipher keys.  Derivation (expensive) happens once in the
/// caller; tests construct these directly.
#[derive(Clone)]
pub struct StoreKeys {
    pub episodic: [u8; 32],
    pub semantic: [u8; 32],
    pub procedural: [u8; 32],
    pub graph: [u8; 32],
    pub cache: [u8; 32],
}

impl StoreKeys {
    pub fn from_keyring(keyring: &StoreKeyring) -> VaultResult<Self> {
        Ok(Self {
            episodic: keyring.key_for("episodic")?,
            semantic: keyring.key_for("semantic")?,
            procedural: keyring.key_for("procedural")?,
            graph: keyring.key_for("conceptGraph")?,
            cache: keyring.key_for("cache")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMemory {
    pub id: String,
    pub text: String,
    pub score: f32,
    /// `semantic` or `vector`.
    pub origin: &'static str,
}

#[derive(Debug, Clone)]
pub struct RetrieveOptions {
    pub limit: usize,
    pub use_cache: bool,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            limit: 8,
            use_cache: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrieveOutcome {
    pub memories: Vec<ScoredMemory>,
    pub from_cache: bool,
    pub cached_value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStats {
    pub episodic: usize,
    pub semantic: usize,
    pub procedural: usize,
    pub working: usize,
    pub graph_nodes: usize,
    pub graph_edges: usize,
    pub cache: CacheStats,
}

struct StoreFiles {
    episodic: EncryptedFile,
    semantic: EncryptedFile,
    procedural: EncryptedFile,
    graph: EncryptedFile,
    cache: EncryptedFile,
}

pub struct MemorySubsystem {
    episodic: RwLock<EpisodicStore>,
    semantic: RwLock<SemanticStore>,
    procedural: RwLock<ProceduralStore>,
    working: RwLock<WorkingMemory>,
    graph: RwLock<ConceptGraph>,
    vector: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    cache: Arc<CagCache>,
    bus: EventBus,
    files: StoreFiles,
    initialized: Mutex<bool>,
}

impl MemorySubsystem {
    pub fn new(
        data_dir: &Path,
        keys: StoreKeys,
        working_capacity: usize,
        embedder: Arc<dyn Embedder>,
        vector: Arc<dyn VectorStore>,
        cache: Arc<CagCache>,
        bus: EventBus,
    ) -> Self {
        let memory_dir = data_dir.join("memory");
        Self {
            episodic: RwLock::new(EpisodicStore::new()),
            semantic: RwLock::new(SemanticStore::new()),
            procedural: RwLock::new(ProceduralStore::new()),
            working: RwLock::new(WorkingMemory::new(working_capacity)),
            graph: RwLock::new(ConceptGraph::new()),
            vector,
            embedder,
            cache,
            bus,
            files: StoreFiles {
                episodic: EncryptedFile::new(memory_dir.join("episodic.json"), keys.episodic),
                semantic: EncryptedFile::new(memory_dir.join("semantic.json"), keys.semantic),
                procedural: EncryptedFile::new(memory_dir.join("procedural.json"), keys.procedural),
                graph: EncryptedFile::new(memory_dir.join("conceptGraph.json"), keys.graph),
                cache: EncryptedFile::new(memory_dir.join("cache.json"), keys.cache),
            },
            initialized: Mutex::new(false),
        }
    }

    /// Load every persistent store.  Any decryption failure aborts the call
    /// and leaves the subsystem uninitialized — startup maps this to the
    /// unrecoverable-persistence exit path.  Idempotent: a second call
    /// (including a concurrent one) is a no-op.
    pub async fn initialize(&self) -> MemoryResult<()> {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            debug!("memory subsystem already initialized");
            return Ok(());
        }

        if let Some(snapshot) = self.files.episodic.load().await? {
            self.episodic.write().await.restore(snapshot);
        }
        if let Some(snapshot) = self.files.semantic.load().await? {
            self.semantic.write().await.restore(snapshot);
        }
        if let Some(snapshot) = self.files.procedural.load().await? {
            self.procedural.write().await.restore(snapshot)?;
        }
        if let Some(snapshot) = self.files.graph.load().await? {
            self.graph.write().await.restore(snapshot)?;
        }
        if let Some(image) = self.files.cache.load().await? {
            let image: CacheExport = image;
            self.cache.import(image);
        }

        // Transient state starts clean on every boot.
        self.working.write().await.clear();

        *initialized = true;
        let stats = self.stats().await;
        info!(
            episodic = stats.episodic,
            semantic = stats.semantic,
            procedural = stats.procedural,
            graph_nodes = stats.graph_nodes,
            cache_entries = stats.cache.entries,
            "memory subsystem initialized"
        );
        Ok(())
    }

    /// Record one interaction across every store: episodic append, concept
    /// extraction into semantic memory / vector index / concept graph,
    /// working-memory insert, and a CAG seed under the query fingerprint.
    pub async fn store_interaction(
        &self,
        input: &str,
        output: &str,
        context: &str,
    ) -> MemoryResult<String> {
        let key = self.episodic.write().await.record(input, output, context)?;

        let combined = format!("{input}\n{output}");
        let snippet: String = combined.chars().take(SNIPPET_CHARS).collect();
        let concepts = extract_concepts(&combined, CONCEPTS_PER_INTERACTION);

        // Embedding failures degrade the semantic half of the write; the
        // episodic record above is already durable.
        let embedding = match self.embedder.embed(&snippet).await {
            Ok(embedding) => embedding,
            Err(err) => {
                warn!(%err, "embedding unavailable; storing interaction without semantic index");
                Vec::new()
            }
        };

        if !embedding.is_empty() {
            let mut semantic = self.semantic.write().await;
            for concept in &concepts {
                semantic.upsert(concept, &snippet, embedding.clone())?;
            }
            drop(semantic);

            for concept in &concepts {
                if let Err(err) = self.vector.add(concept, &snippet).await {
                    warn!(%err, concept, "vector index add failed; continuing");
                    break;
                }
            }
        }

        {
            let mut graph = self.graph.write().await;
            let ids: Vec<_> = concepts
                .iter()
                .map(|c| graph.upsert_node(c, "concept"))
                .collect();
            for pair in ids.windows(2) {
                let _ = graph.add_edge(pair[0], pair[1], "co-occurs", BTreeMap::new());
            }
        }

        {
            let mut map = BTreeMap::new();
            map.insert("input".to_string(), Value::from(input));
            map.insert("output".to_string(), Value::from(output));
            self.working
                .write()
                .await
                .push(MemoryItem::new(key.clone(), Value::Map(map)));
        }

        self.cache.insert(
            input,
            embedding,
            &BTreeMap::new(),
            output,
            vec!["memory".to_string()],
            1.0,
        );

        self.bus.publish(
            Topic::MemoryUpdate,
            serde_json::json!({ "key": key, "concepts": concepts }),
        );
        Ok(key)
    }

    /// Union of semantic-store and vector-index hits, deduplicated by id,
    /// re-ranked by score, truncated to `limit`.
    pub async fn search_similar(&self, query: &str, limit: usize) -> MemoryResult<Vec<ScoredMemory>> {
        let embedding = match self.embedder.embed(query).await {
            Ok(embedding) => embedding,
            Err(err) => {
                warn!(%err, "embedding unavailable; similarity search degraded to vector index only");
                Vec::new()
            }
        };

        let mut merged: BTreeMap<String, ScoredMemory> = BTreeMap::new();

        if !embedding.is_empty() {
            for hit in self.semantic.read().await.similar(&embedding, limit, 0.0) {
                merged.insert(
                    hit.key.clone(),
                    ScoredMemory {
                        id: hit.key,
                        text: hit.text,
                        score: hit.score,
                        origin: "semantic",
                    },
                );
            }
        }

        match self.vector.find_similar(query, limit, 0.0).await {
            Ok(hits) => {
                for hit in hits {
                    let candidate = ScoredMemory {
                        id: hit.id.clone(),
                        text: hit.text,
                        score: hit.score,
                        origin: "vector",
                    };
                    merged
                        .entry(hit.id)
                        .and_modify(|existing| {
                            if candidate.score > existing.score {
                                *existing = candidate.clone();
                            }
                        })
                        .or_insert(candidate);
                }
            }
            Err(err) => {
                warn!(%err, "vector backend unavailable; serving semantic hits only");
            }
        }

        let mut results: Vec<ScoredMemory> = merged.into_values().collect();
        results.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        results.truncate(limit);
        Ok(results)
    }

    /// Cache-checked retrieval.
    pub async fn retrieve_relevant(
        &self,
        query: &str,
        opts: &RetrieveOptions,
    ) -> MemoryResult<RetrieveOutcome> {
        if opts.use_cache {
            let embedding = self.embedder.embed(query).await.ok();
            if let Some(hit) = self.cache.lookup(query, embedding.as_deref(), &BTreeMap::new()) {
                return Ok(RetrieveOutcome {
                    memories: Vec::new(),
                    from_cache: true,
                    cached_value: Some(hit.response),
                });
            }
        }

        let memories = self.search_similar(query, opts.limit).await?;
        Ok(RetrieveOutcome {
            memories,
            from_cache: false,
            cached_value: None,
        })
    }

    /// Concept-graph catalog lookup: nodes matching the property filters
    /// whose labels intersect the query vocabulary.
    pub async fn knowledge_catalog(
        &self,
        query: &str,
        filters: &BTreeMap<String, String>,
        limit: usize,
    ) -> Vec<String> {
        let graph = self.graph.read().await;
        let candidates = if filters.is_empty() {
            let query_lower = query.to_lowercase();
            graph
                .search("")
                .into_iter()
                .filter(|node| query_lower.contains(&node.label.to_lowercase()))
                .collect::<Vec<_>>()
        } else {
            graph
                .nodes_matching(filters)
                .into_iter()
                .collect::<Vec<_>>()
        };

        candidates
            .into_iter()
            .take(limit)
            .map(|node| node.label.clone())
            .collect()
    }

    /// Bulk document ingestion into semantic memory.  Chunks shorter than a
    /// sentence carry no retrievable signal and are rejected.
    pub async fn ingest_chunks(&self, chunks: Vec<String>) -> MemoryResult<(usize, usize)> {
        let mut accepted = 0usize;
        let mut rejected = 0usize;

        for chunk in chunks {
            let trimmed = chunk.trim();
            if trimmed.len() < 24 {
                rejected += 1;
                continue;
            }
            let key = format!("doc-{}", uuid::Uuid::new_v4());
            match self.embedder.embed(trimmed).await {
                Ok(embedding) => {
                    self.semantic.write().await.upsert(&key, trimmed, embedding)?;
                    if let Err(err) = self.vector.add(&key, trimmed).await {
                        warn!(%err, "vector add failed during ingest");
                    }
                    accepted += 1;
                }
                Err(err) => {
                    warn!(%err, "embedding failed during ingest; chunk rejected");
                    rejected += 1;
                }
            }
        }
        Ok((accepted, rejected))
    }

    pub async fn recipe(&self, name: &str) -> Option<Recipe> {
        self.procedural.read().await.recipe(name).cloned()
    }

    pub async fn insert_recipe(&self, name: &str, recipe: Recipe) -> MemoryResult<()> {
        self.procedural.write().await.insert(name, recipe)
    }

    /// Snapshot every persistent store concurrently.  Completes only when
    /// all files are written and fsynced.  Crash consistency is per store;
    /// a reader may observe one store newer than another after a crash.
    pub async fn persist(&self) -> MemoryResult<()> {
        let episodic = self.episodic.read().await.snapshot();
        let semantic = self.semantic.read().await.snapshot();
        let procedural = self.procedural.read().await.snapshot();
        let graph = self.graph.read().await.snapshot();
        let cache = self.cache.export();

        futures::try_join!(
            self.files.episodic.save(&episodic),
            self.files.semantic.save(&semantic),
            self.files.procedural.save(&procedural),
            self.files.graph.save(&graph),
            self.files.cache.save(&cache),
        )?;

        debug!("memory snapshots persisted");
        Ok(())
    }

    /// Reclaim space: compact the concept graph arena and sweep expired
    /// cache entries.  Returns (graph nodes live, cache entries evicted).
    pub async fn optimize(&self) -> (usize, usize) {
        let mut graph = self.graph.write().await;
        graph.compact();
        let nodes = graph.node_count();
        drop(graph);

        let evicted = self.cache.evict();
        (nodes, evicted)
    }

    pub async fn stats(&self) -> MemoryStats {
        use crate::store::MemoryStore as _;
        MemoryStats {
            episodic: self.episodic.read().await.count(),
            semantic: self.semantic.read().await.count(),
            procedural: self.procedural.read().await.count(),
            working: self.working.read().await.len(),
            graph_nodes: self.graph.read().await.node_count(),
            graph_edges: self.graph.read().await.edge_count(),
            cache: self.cache.stats(),
        }
    }

    /// Recent interactions for prompt context, newest first.
    pub async fn recent_interactions(&self, limit: usize) -> Vec<crate::episodic::Interaction> {
        self.episodic.read().await.recent(limit)
    }

    pub fn cache(&self) -> &Arc<CagCache> {
        &self.cache
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryError;
    use crate::vector::{HashEmbedder, InMemoryVectorStore};

    fn test_keys() -> StoreKeys {
        let mut base = [0u8; 32];
        for (i, b) in base.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut keys = StoreKeys {
            episodic: base,
            semantic: base,
            procedural: base,
            graph: base,
            cache: base,
        };
        keys.semantic[0] = 1;
        keys.procedural[0] = 2;
        keys.graph[0] = 3;
        keys.cache[0] = 4;
        keys
    }

    fn subsystem(dir: &Path) -> MemorySubsystem {
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::default());
        let vector = Arc::new(InMemoryVectorStore::new(Arc::clone(&embedder)));
        let cache = Arc::new(CagCache::new(100, 3600, 0.85));
        MemorySubsystem::new(
            dir,
            test_keys(),
            10,
            embedder,
            vector,
            cache,
            EventBus::new(),
        )
    }

    #[tokio::test]
    async fn store_interaction_populates_every_store() {
        let dir = tempfile::tempdir().unwrap();
        let memory = subsystem(dir.path());
        memory.initialize().await.unwrap();

        let key = memory
            .store_interaction(
                "explain privilege escalation techniques",
                "privilege escalation abuses misconfigured services",
                "lesson-3",
            )
            .await
            .unwrap();

        let stats = memory.stats().await;
        assert_eq!(stats.episodic, 1);
        assert!(stats.semantic > 0, "concepts must land in semantic store");
        assert!(stats.graph_nodes > 0, "concepts must land in the graph");
        assert_eq!(stats.working, 1);
        assert!(stats.cache.entries > 0, "interaction must seed the CAG");
        assert!(key.starts_with("interaction-"));
    }

    #[tokio::test]
    async fn search_similar_merges_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let memory = subsystem(dir.path());
        memory.initialize().await.unwrap();

        memory
            .store_interaction(
                "describe lateral movement inside windows domains",
                "lateral movement pivots through compromised hosts",
                "",
            )
            .await
            .unwrap();

        let results = memory
            .search_similar("lateral movement windows", 10)
            .await
            .unwrap();
        assert!(!results.is_empty());

        let mut ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), results.len(), "results must be deduplicated by id");

        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score, "results must rank descending");
        }
    }

    #[tokio::test]
    async fn retrieve_relevant_serves_cached_value() {
        let dir = tempfile::tempdir().unwrap();
        let memory = subsystem(dir.path());
        memory.initialize().await.unwrap();

        memory
            .store_interaction("what is credential stuffing", "Credential stuffing is …", "")
            .await
            .unwrap();

        let outcome = memory
            .retrieve_relevant("what is credential stuffing", &RetrieveOptions::default())
            .await
            .unwrap();
        assert!(outcome.from_cache);
        assert_eq!(outcome.cached_value.as_deref(), Some("Credential stuffing is …"));

        let uncached = memory
            .retrieve_relevant(
                "what is credential stuffing",
                &RetrieveOptions { limit: 5, use_cache: false },
            )
            .await
            .unwrap();
        assert!(!uncached.from_cache);
    }

    #[tokio::test]
    async fn persist_then_load_restores_state() {
        let dir = tempfile::tempdir().unwrap();

        {
            let memory = subsystem(dir.path());
            memory.initialize().await.unwrap();
            memory
                .store_interaction(
                    "enumerate subdomains for the target",
                    "subdomain enumeration found 12 hosts",
                    "recon",
                )
                .await
                .unwrap();
            memory.persist().await.unwrap();
        }

        let reloaded = subsystem(dir.path());
        reloaded.initialize().await.unwrap();
        let stats = reloaded.stats().await;
        assert_eq!(stats.episodic, 1);
        assert!(stats.semantic > 0);
        assert!(stats.graph_nodes > 0);
        assert!(stats.cache.entries > 0);
        // Working memory is transient and must come back empty.
        assert_eq!(stats.working, 0);
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        {
            let memory = subsystem(dir.path());
            memory.initialize().await.unwrap();
            memory.store_interaction("q", "a", "").await.unwrap();
            memory.persist().await.unwrap();
        }

        let memory = subsystem(dir.path());
        memory.initialize().await.unwrap();
        let first = memory.stats().await;
        memory.initialize().await.unwrap();
        let second = memory.stats().await;

        assert_eq!(first.episodic, second.episodic);
        assert_eq!(first.semantic, second.semantic);
        assert_eq!(first.graph_nodes, second.graph_nodes);
    }

    #[tokio::test]
    async fn corrupted_store_aborts_initialize() {
        let dir = tempfile::tempdir().unwrap();
        {
            let memory = subsystem(dir.path());
            memory.initialize().await.unwrap();
            memory.persist().await.unwrap();
        }

        // Overwrite one store with random bytes.
        std::fs::write(dir.path().join("memory/episodic.json"), b"not an envelope").unwrap();

        let memory = subsystem(dir.path());
        let result = memory.initialize().await;
        assert!(matches!(
            result,
            Err(MemoryError::Persistence(sentra_vault::VaultError::Corrupt(_)))
        ));
    }

    #[tokio::test]
    async fn ingest_accepts_substantial_chunks_only() {
        let dir = tempfile::tempdir().unwrap();
        let memory = subsystem(dir.path());
        memory.initialize().await.unwrap();

        let (accepted, rejected) = memory
            .ingest_chunks(vec![
                "Cross-site scripting lets attackers run script in a victim's browser.".to_string(),
                "too short".to_string(),
            ])
            .await
            .unwrap();
        assert_eq!((accepted, rejected), (1, 1));
    }

    #[tokio::test]
    async fn knowledge_catalog_matches_query_concepts() {
        let dir = tempfile::tempdir().unwrap();
        let memory = subsystem(dir.path());
        memory.initialize().await.unwrap();
        memory
            .store_interaction(
                "study injection payloads",
                "injection payloads bypass validation",
                "",
            )
            .await
            .unwrap();

        let names = memory
            .knowledge_catalog("tell me about injection payloads", &BTreeMap::new(), 5)
            .await;
        assert!(names.iter().any(|n| n == "injection"));
    }
}
