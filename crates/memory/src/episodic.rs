//! Episodic store: append-mostly record of interactions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{BaseStore, MemoryStore, StoreSnapshot};
use crate::value::{MemoryItem, Value};
use crate::MemoryResult;

/// One recorded exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub input: String,
    pub output: String,
    pub context: String,
    pub ts: i64,
}

/// Ordered interaction history with exact key-get and substring find.
#[derive(Debug, Default)]
pub struct EpisodicStore {
    base: BaseStore,
}

impl EpisodicStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interaction; returns the generated key.
    pub fn record(&mut self, input: &str, output: &str, context: &str) -> MemoryResult<String> {
        let key = format!("interaction-{}", Uuid::new_v4());
        let mut map = BTreeMap::new();
        map.insert("input".to_string(), Value::from(input));
        map.insert("output".to_string(), Value::from(output));
        map.insert("context".to_string(), Value::from(context));

        self.base.add(MemoryItem::new(key.clone(), Value::Map(map)))?;
        Ok(key)
    }

    /// Decode an item back into an [`Interaction`].
    pub fn interaction(&self, key: &str) -> Option<Interaction> {
        let item = self.base.get(key)?;
        let Value::Map(map) = &item.content else {
            return None;
        };
        Some(Interaction {
            input: map.get("input")?.as_str()?.to_string(),
            output: map.get("output")?.as_str()?.to_string(),
            context: map.get("context").and_then(Value::as_str).unwrap_or_default().to_string(),
            ts: item.timestamp,
        })
    }

    /// Interactions whose input or output contains `needle`, oldest first.
    pub fn find_interactions(&self, needle: &str) -> Vec<Interaction> {
        self.base
            .find(needle)
            .into_iter()
            .filter_map(|item| self.interaction(&item.key))
            .collect()
    }

    /// Most recent `limit` interactions, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Interaction> {
        let mut keys: Vec<&MemoryItem> = self.base.get_all();
        keys.sort_by_key(|item| std::cmp::Reverse(item.timestamp));
        keys.into_iter()
            .take(limit)
            .filter_map(|item| self.interaction(&item.key))
            .collect()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.base.snapshot()
    }

    pub fn restore(&mut self, snapshot: StoreSnapshot) {
        self.base.restore(snapshot);
    }

    pub fn clear(&mut self) {
        self.base = BaseStore::new();
    }
}

impl MemoryStore for EpisodicStore {
    fn add(&mut self, item: MemoryItem) -> MemoryResult<()> {
        self.base.add(item)
    }

    fn get(&self, key: &str) -> Option<&MemoryItem> {
        self.base.get(key)
    }

    fn get_all(&self) -> Vec<&MemoryItem> {
        self.base.get_all()
    }

    fn find(&self, needle: &str) -> Vec<&MemoryItem> {
        self.base.find(needle)
    }

    fn remove(&mut self, key: &str) -> bool {
        self.base.remove(key)
    }

    fn count(&self) -> usize {
        self.base.count()
    }

    fn update(&mut self, key: &str, content: Value) -> MemoryResult<()> {
        self.base.update(key, content)
    }
}
