//! The cache proper: exact + semantic hit levels, TTL, LRU capacity.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use sentra_bus::{EventBus, Topic};

use crate::fingerprint::fingerprint;

/// One cached generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub query_text: String,
    /// Salient options active when the entry was created.  Semantic
    /// matching stays inside one option partition: a category-filtered
    /// lookup never reuses an unfiltered answer.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Embedding of the normalized query; empty when no embedder was
    /// available at insert time (entry is then exact-match only).
    pub query_embedding: Vec<f32>,
    pub response: String,
    pub sources: Vec<String>,
    pub confidence: f32,
    pub created_at: i64,
    pub last_accessed: i64,
    pub hit_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitType {
    Exact,
    Semantic,
}

#[derive(Debug, Clone)]
pub struct CacheHit {
    pub response: String,
    pub sources: Vec<String>,
    pub confidence: f32,
    pub hit_type: HitType,
    /// Cosine similarity that produced the hit; 1.0 for exact.
    pub similarity: f32,
}

/// Counters for the health monitor and learning loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub exact_hits: u64,
    pub semantic_hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.exact_hits + self.semantic_hits;
        let total = hits + self.misses;
        if total == 0 {
            return 1.0;
        }
        hits as f64 / total as f64
    }
}

/// Serialized cache image for persistence and `export`/`import`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheExport {
    pub entries: Vec<CacheEntry>,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Recency order only; evicting from here drives entry removal.
    order: LruCache<String, ()>,
    exact_hits: u64,
    semantic_hits: u64,
    misses: u64,
}

/// Exact + semantic cache over generator outputs.
pub struct CagCache {
    inner: Mutex<CacheInner>,
    max_entries: usize,
    ttl_ms: i64,
    similarity_threshold: f32,
    bus: Option<EventBus>,
}

impl CagCache {
    pub fn new(max_entries: usize, ttl_secs: u64, similarity_threshold: f32) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).expect("max(1) is non-zero");
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: LruCache::new(cap),
                exact_hits: 0,
                semantic_hits: 0,
                misses: 0,
            }),
            max_entries: max_entries.max(1),
            ttl_ms: (ttl_secs as i64).saturating_mul(1000),
            similarity_threshold,
            bus: None,
        }
    }

    pub fn from_config(memory: &sentra_config::MemoryConfig, cag: &sentra_config::CagConfig) -> Self {
        Self::new(memory.cache_size, memory.cache_ttl_secs, cag.similarity_threshold)
    }

    /// Attach the event bus for `cag.hit` / `cag.miss` publications.
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Consult the cache: exact fingerprint first, then the semantic index.
    /// Expired entries encountered on the way are removed (miss).
    pub fn lookup(
        &self,
        query: &str,
        query_embedding: Option<&[f32]>,
        options: &BTreeMap<String, String>,
    ) -> Option<CacheHit> {
        self.lookup_at(query, query_embedding, options, now_ms())
    }

    pub fn lookup_at(
        &self,
        query: &str,
        query_embedding: Option<&[f32]>,
        options: &BTreeMap<String, String>,
        now: i64,
    ) -> Option<CacheHit> {
        self.lookup_with_floor_at(query, query_embedding, options, self.similarity_threshold, now)
    }

    /// Lookup with an explicit semantic floor.  The degraded fallback
    /// ladder uses this with its fixed 0.95 rung, independent of the
    /// configured threshold.
    pub fn lookup_with_floor(
        &self,
        query: &str,
        query_embedding: Option<&[f32]>,
        options: &BTreeMap<String, String>,
        floor: f32,
    ) -> Option<CacheHit> {
        self.lookup_with_floor_at(query, query_embedding, options, floor, now_ms())
    }

    fn lookup_with_floor_at(
        &self,
        query: &str,
        query_embedding: Option<&[f32]>,
        options: &BTreeMap<String, String>,
        floor: f32,
        now: i64,
    ) -> Option<CacheHit> {
        let fp = fingerprint(query, options);
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());

        // Exact level.
        if let Some(entry) = inner.entries.get(&fp) {
            if self.expired(entry, now) {
                inner.entries.remove(&fp);
                inner.order.pop(&fp);
                trace!(fingerprint = %fp, "exact entry expired on access");
            } else {
                let hit = {
                    let entry = inner.entries.get_mut(&fp).expect("checked above");
                    entry.last_accessed = now.max(entry.created_at);
                    entry.hit_count += 1;
                    CacheHit {
                        response: entry.response.clone(),
                        sources: entry.sources.clone(),
                        confidence: entry.confidence,
                        hit_type: HitType::Exact,
                        similarity: 1.0,
                    }
                };
                inner.order.get(&fp);
                inner.exact_hits += 1;
                drop(inner);
                self.publish_hit(HitType::Exact);
                return Some(hit);
            }
        }

        // Semantic level.
        if let Some(embedding) = query_embedding.filter(|e| !e.is_empty()) {
            let mut expired_keys = Vec::new();
            let mut best: Option<(String, f32)> = None;
            for (key, entry) in &inner.entries {
                if self.expired(entry, now) {
                    expired_keys.push(key.clone());
                    continue;
                }
                if entry.query_embedding.is_empty() || entry.options != *options {
                    continue;
                }
                let score = cosine(embedding, &entry.query_embedding);
                if score >= floor && best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
                    best = Some((key.clone(), score));
                }
            }
            for key in expired_keys {
                inner.entries.remove(&key);
                inner.order.pop(&key);
            }

            if let Some((key, score)) = best {
                let hit = {
                    let entry = inner.entries.get_mut(&key).expect("winner not expired");
                    entry.last_accessed = now.max(entry.created_at);
                    entry.hit_count += 1;
                    CacheHit {
                        response: entry.response.clone(),
                        sources: entry.sources.clone(),
                        confidence: entry.confidence,
                        hit_type: HitType::Semantic,
                        similarity: score,
                    }
                };
                inner.order.get(&key);
                inner.semantic_hits += 1;
                drop(inner);
                self.publish_hit(HitType::Semantic);
                return Some(hit);
            }
        }

        inner.misses += 1;
        drop(inner);
        if let Some(bus) = &self.bus {
            bus.publish(Topic::CagMiss, serde_json::json!({ "query": query }));
        }
        None
    }

    /// Insert a generated answer.  Capacity is enforced immediately: the
    /// least-recently-used entry is dropped when the cache is full.
    pub fn insert(
        &self,
        query: &str,
        query_embedding: Vec<f32>,
        options: &BTreeMap<String, String>,
        response: impl Into<String>,
        sources: Vec<String>,
        confidence: f32,
    ) -> String {
        self.insert_at(query, query_embedding, options, response, sources, confidence, now_ms())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_at(
        &self,
        query: &str,
        query_embedding: Vec<f32>,
        options: &BTreeMap<String, String>,
        response: impl Into<String>,
        sources: Vec<String>,
        confidence: f32,
        now: i64,
    ) -> String {
        let fp = fingerprint(query, options);
        let entry = CacheEntry {
            fingerprint: fp.clone(),
            query_text: query.to_string(),
            options: options.clone(),
            query_embedding,
            response: response.into(),
            sources,
            confidence: confidence.clamp(0.0, 1.0),
            created_at: now,
            last_accessed: now,
            hit_count: 0,
        };

        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if let Some((evicted, ())) = inner.order.push(fp.clone(), ()) {
            if evicted != fp {
                inner.entries.remove(&evicted);
                debug!(fingerprint = %evicted, "LRU evicted cache entry");
            }
        }
        inner.entries.insert(fp.clone(), entry);
        fp
    }

    /// Background sweep: drop expired entries and trim over-capacity.
    pub fn evict(&self) -> usize {
        self.evict_at(now_ms())
    }

    pub fn evict_at(&self, now: i64) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let expired: Vec<String> = inner
            .entries
            .values()
            .filter(|e| self.expired(e, now))
            .map(|e| e.fingerprint.clone())
            .collect();
        for key in &expired {
            inner.entries.remove(key);
            inner.order.pop(key);
        }

        let mut removed = expired.len();
        while inner.entries.len() > self.max_entries {
            let Some((key, ())) = inner.order.pop_lru() else { break };
            inner.entries.remove(&key);
            removed += 1;
        }
        removed
    }

    /// Seed the cache with known-good pairs (startup pre-warm).
    pub fn pre_warm(&self, seeds: &[(String, String)]) {
        let options = BTreeMap::new();
        for (query, response) in seeds {
            self.insert(query, Vec::new(), &options, response.clone(), vec!["pre-warm".to_string()], 1.0);
        }
    }

    pub fn export(&self) -> CacheExport {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut entries: Vec<CacheEntry> = inner.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.last_accessed);
        CacheExport { entries }
    }

    /// Replace the cache contents with an exported image.  Entries arrive
    /// oldest-access first so LRU order is rebuilt faithfully.
    pub fn import(&self, image: CacheExport) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.entries.clear();
        inner.order.clear();
        for entry in image.entries {
            let fp = entry.fingerprint.clone();
            if let Some((evicted, ())) = inner.order.push(fp.clone(), ()) {
                if evicted != fp {
                    inner.entries.remove(&evicted);
                }
            }
            inner.entries.insert(fp, entry);
        }
    }

    /// Drop every entry and reset the hit/miss counters, so post-clear
    /// metrics reflect the fresh cache rather than its history.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.entries.clear();
        inner.order.clear();
        inner.exact_hits = 0;
        inner.semantic_hits = 0;
        inner.misses = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        CacheStats {
            entries: inner.entries.len(),
            exact_hits: inner.exact_hits,
            semantic_hits: inner.semantic_hits,
            misses: inner.misses,
        }
    }

    fn expired(&self, entry: &CacheEntry, now: i64) -> bool {
        now.saturating_sub(entry.created_at) > self.ttl_ms
    }

    fn publish_hit(&self, hit_type: HitType) {
        if let Some(bus) = &self.bus {
            let label = match hit_type {
                HitType::Exact => "exact",
                HitType::Semantic => "semantic",
            };
            bus.publish(Topic::CagHit, serde_json::json!({ "type": label }));
        }
    }
}

pub(crate) fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(0.0, 1.0)
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_options() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn exact_hit_roundtrip() {
        let cache = CagCache::new(100, 3600, 0.85);
        cache.insert("what is sql injection?", vec![], &no_options(), "SQLi is …", vec!["kb".into()], 0.9);

        let hit = cache.lookup("What is SQL injection?", None, &no_options()).unwrap();
        assert_eq!(hit.hit_type, HitType::Exact);
        assert_eq!(hit.response, "SQLi is …");
        assert!((hit.similarity - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn semantic_hit_above_threshold() {
        let cache = CagCache::new(100, 3600, 0.85);
        cache.insert("what is xss?", vec![1.0, 0.0, 0.1], &no_options(), "XSS is…", vec![], 0.8);

        let probe = [0.98_f32, 0.02, 0.12];
        let hit = cache
            .lookup("describe cross-site scripting", Some(&probe), &no_options())
            .unwrap();
        assert_eq!(hit.hit_type, HitType::Semantic);
        assert!(hit.similarity >= 0.85);
        assert_eq!(hit.response, "XSS is…");
    }

    #[test]
    fn semantic_match_stays_inside_option_partition() {
        let cache = CagCache::new(100, 3600, 0.85);
        cache.insert("what is xss?", vec![1.0, 0.0], &no_options(), "XSS is…", vec![], 0.8);

        let mut filtered = BTreeMap::new();
        filtered.insert("category".to_string(), "web".to_string());
        let probe = [1.0_f32, 0.0];
        assert!(
            cache.lookup("describe xss", Some(&probe), &filtered).is_none(),
            "a filtered lookup must not reuse an unfiltered entry"
        );
        assert!(cache.lookup("describe xss", Some(&probe), &no_options()).is_some());
    }

    #[test]
    fn semantic_below_threshold_misses() {
        let cache = CagCache::new(100, 3600, 0.85);
        cache.insert("what is xss?", vec![1.0, 0.0, 0.0], &no_options(), "XSS is…", vec![], 0.8);

        let orthogonal = [0.0_f32, 1.0, 0.0];
        assert!(cache.lookup("unrelated", Some(&orthogonal), &no_options()).is_none());
    }

    #[test]
    fn ttl_expiry_on_access_removes_entry() {
        let cache = CagCache::new(100, 1, 0.85);
        let t0 = 1_000_000;
        cache.insert_at("stale query", vec![], &no_options(), "old", vec![], 0.9, t0);

        // Two seconds later the 1s TTL has lapsed: miss, and the entry is gone.
        let t1 = t0 + 2_000;
        assert!(cache.lookup_at("stale query", None, &no_options(), t1).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let cache = CagCache::new(3, 3600, 0.85);
        for i in 0..10 {
            cache.insert(&format!("query number {i}"), vec![], &no_options(), "r", vec![], 0.5);
            assert!(cache.len() <= 3, "cache grew past max_entries");
        }
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let cache = CagCache::new(2, 3600, 0.85);
        cache.insert("alpha", vec![], &no_options(), "a", vec![], 0.5);
        cache.insert("beta", vec![], &no_options(), "b", vec![], 0.5);

        // Touch alpha so beta becomes the LRU victim.
        cache.lookup("alpha", None, &no_options()).unwrap();
        cache.insert("gamma", vec![], &no_options(), "c", vec![], 0.5);

        assert!(cache.lookup("alpha", None, &no_options()).is_some());
        assert!(cache.lookup("beta", None, &no_options()).is_none());
    }

    #[test]
    fn hit_updates_count_and_last_accessed() {
        let cache = CagCache::new(10, 3600, 0.85);
        let t0 = 5_000;
        cache.insert_at("q", vec![], &no_options(), "r", vec![], 0.5, t0);
        cache.lookup_at("q", None, &no_options(), t0 + 500).unwrap();
        cache.lookup_at("q", None, &no_options(), t0 + 900).unwrap();

        let image = cache.export();
        let entry = &image.entries[0];
        assert_eq!(entry.hit_count, 2);
        assert_eq!(entry.last_accessed, t0 + 900);
        assert!(entry.last_accessed >= entry.created_at);
    }

    #[test]
    fn export_import_roundtrip() {
        let cache = CagCache::new(10, 3600, 0.85);
        cache.insert("q1", vec![0.1, 0.2], &no_options(), "r1", vec!["s".into()], 0.7);
        cache.insert("q2", vec![], &no_options(), "r2", vec![], 0.6);

        let image = cache.export();
        let restored = CagCache::new(10, 3600, 0.85);
        restored.import(image);

        assert_eq!(restored.len(), 2);
        let hit = restored.lookup("q1", None, &no_options()).unwrap();
        assert_eq!(hit.response, "r1");
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let cache = CagCache::new(10, 3600, 0.85);
        cache.insert("known", vec![], &no_options(), "r", vec![], 0.5);

        cache.lookup("known", None, &no_options());
        cache.lookup("unknown", None, &no_options());
        cache.lookup("also unknown", None, &no_options());

        let stats = cache.stats();
        assert_eq!(stats.exact_hits, 1);
        assert_eq!(stats.misses, 2);
        assert!((stats.hit_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn bus_sees_hit_and_miss_events() {
        use std::sync::Arc;
        use std::sync::Mutex as StdMutex;

        let bus = EventBus::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_hits = Arc::clone(&seen);
        bus.subscribe(Topic::CagHit, move |e| {
            seen_hits.lock().unwrap().push(format!("hit:{}", e.payload["type"].as_str().unwrap()));
        });
        let seen_misses = Arc::clone(&seen);
        bus.subscribe(Topic::CagMiss, move |_| {
            seen_misses.lock().unwrap().push("miss".to_string());
        });

        let cache = CagCache::new(10, 3600, 0.85).with_bus(bus);
        cache.lookup("nothing cached", None, &no_options());
        cache.insert("q", vec![], &no_options(), "r", vec![], 0.5);
        cache.lookup("q", None, &no_options());

        let events = seen.lock().unwrap().clone();
        assert_eq!(events, vec!["miss".to_string(), "hit:exact".to_string()]);
    }

    #[test]
    fn evict_sweeps_expired_entries() {
        let cache = CagCache::new(10, 1, 0.85);
        let t0 = 10_000;
        cache.insert_at("old", vec![], &no_options(), "r", vec![], 0.5, t0);
        cache.insert_at("new", vec![], &no_options(), "r", vec![], 0.5, t0 + 5_000);

        let removed = cache.evict_at(t0 + 5_500);
        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 1);
    }
}
