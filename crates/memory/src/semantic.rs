//! Semantic store: text snippets with embeddings, similarity lookup only.

use serde::{Deserialize, Serialize};

use crate::extract::cosine_similarity;
use crate::store::{BaseStore, MemoryStore, StoreSnapshot};
use crate::value::{MemoryItem, Value};
use crate::{MemoryError, MemoryResult};

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredSnippet {
    pub key: String,
    pub text: String,
    pub score: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SemanticSnapshot {
    pub store: StoreSnapshot,
    pub embeddings: Vec<(String, Vec<f32>)>,
}

/// Snippet store addressed exclusively by similarity.  Direct key-get is
/// not part of the contract; the capability trait's `get` returns `None`.
#[derive(Debug, Default)]
pub struct SemanticStore {
    base: BaseStore,
    embeddings: std::collections::HashMap<String, Vec<f32>>,
}

impl SemanticStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a snippet with its embedding.
    pub fn upsert(&mut self, key: &str, text: &str, embedding: Vec<f32>) -> MemoryResult<()> {
        if self.base.get(key).is_some() {
            self.base.update(key, Value::from(text))?;
        } else {
            self.base.add(MemoryItem::new(key, Value::from(text)))?;
        }
        self.embeddings.insert(key.to_string(), embedding);
        Ok(())
    }

    /// Rank all snippets against `query_embedding`, best first, keeping
    /// scores at or above `threshold`.
    pub fn similar(&self, query_embedding: &[f32], limit: usize, threshold: f32) -> Vec<ScoredSnippet> {
        let mut scored: Vec<ScoredSnippet> = self
            .base
            .get_all()
            .into_iter()
            .filter_map(|item| {
                let embedding = self.embeddings.get(&item.key)?;
                let score = cosine_similarity(query_embedding, embedding);
                (score >= threshold).then(|| ScoredSnippet {
                    key: item.key.clone(),
                    text: item.content.render_text(),
                    score,
                })
            })
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(limit);
        scored
    }

    pub fn embedding(&self, key: &str) -> Option<&[f32]> {
        self.embeddings.get(key).map(Vec::as_slice)
    }

    pub fn snapshot(&self) -> SemanticSnapshot {
        SemanticSnapshot {
            store: self.base.snapshot(),
            embeddings: self
                .embeddings
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    pub fn restore(&mut self, snapshot: SemanticSnapshot) {
        self.base.restore(snapshot.store);
        self.embeddings = snapshot.embeddings.into_iter().collect();
    }
}

impl MemoryStore for SemanticStore {
    fn add(&mut self, item: MemoryItem) -> MemoryResult<()> {
        if self.base.get(&item.key).is_some() {
            return Err(MemoryError::DuplicateKey(item.key));
        }
        self.base.add(item)
    }

    /// Similarity lookup only: direct key access is not offered.
    fn get(&self, _key: &str) -> Option<&MemoryItem> {
        None
    }

    fn get_all(&self) -> Vec<&MemoryItem> {
        self.base.get_all()
    }

    fn find(&self, needle: &str) -> Vec<&MemoryItem> {
        self.base.find(needle)
    }

    fn remove(&mut self, key: &str) -> bool {
        self.embeddings.remove(key);
        self.base.remove(key)
    }

    fn count(&self) -> usize {
        self.base.count()
    }

    fn update(&mut self, key: &str, content: Value) -> MemoryResult<()> {
        self.base.update(key, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn similar_ranks_descending_with_threshold() {
        let mut store = SemanticStore::new();
        store.upsert("close", "rust async tips", vec![0.9, 0.1, 0.0]).unwrap();
        store.upsert("far", "grocery shopping", vec![0.0, 0.0, 1.0]).unwrap();
        store.upsert("mid", "rust sync tips", vec![0.6, 0.4, 0.0]).unwrap();

        let hits = store.similar(&[1.0, 0.0, 0.0], 10, 0.5);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].key, "close");
        assert_eq!(hits[1].key, "mid");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn limit_truncates_results() {
        let mut store = SemanticStore::new();
        for i in 0..5 {
            store.upsert(&format!("k{i}"), "text", vec![1.0, 0.0]).unwrap();
        }
        assert_eq!(store.similar(&[1.0, 0.0], 2, 0.0).len(), 2);
    }

    #[test]
    fn key_get_is_not_offered() {
        let mut store = SemanticStore::new();
        store.upsert("k", "text", vec![1.0]).unwrap();
        assert!(store.get("k").is_none());
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn upsert_refreshes_existing_snippet() {
        let mut store = SemanticStore::new();
        store.upsert("k", "old", vec![1.0, 0.0]).unwrap();
        store.upsert("k", "new", vec![0.0, 1.0]).unwrap();

        assert_eq!(store.count(), 1);
        let hits = store.similar(&[0.0, 1.0], 1, 0.9);
        assert_eq!(hits[0].text, "new");
    }

    #[test]
    fn snapshot_roundtrip_keeps_embeddings() {
        let mut store = SemanticStore::new();
        store.upsert("k", "snippet", vec![0.3, 0.7]).unwrap();

        let mut restored = SemanticStore::new();
        restored.restore(store.snapshot());
        assert_eq!(restored.embedding("k"), Some(&[0.3_f32, 0.7][..]));
        assert_eq!(restored.similar(&[0.3, 0.7], 1, 0.9).len(), 1);
    }

    #[test]
    fn remove_drops_embedding_too() {
        let mut store = SemanticStore::new();
        store.upsert("k", "snippet", vec![1.0]).unwrap();
        assert!(store.remove("k"));
        assert!(store.embedding("k").is_none());
        assert!(store.similar(&[1.0], 5, 0.0).is_empty());
    }
}
