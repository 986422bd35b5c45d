//! The single capability interface shared by every typed store, plus the
//! vec-backed base implementation the stores compose.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::value::{MemoryItem, Value};
use crate::{MemoryError, MemoryResult};

/// Capability contract of a memory store.  Polymorphism over store types is
/// expressed through this one interface; persistence goes through each
/// store's snapshot/restore pair so the encrypted codec stays uniform.
pub trait MemoryStore {
    /// Insert a new item.  Keys are unique within a store; re-adding an
    /// existing key is a conflict, not an upsert.
    fn add(&mut self, item: MemoryItem) -> MemoryResult<()>;

    fn get(&self, key: &str) -> Option<&MemoryItem>;

    fn get_all(&self) -> Vec<&MemoryItem>;

    /// Case-insensitive substring search over rendered content.
    fn find(&self, needle: &str) -> Vec<&MemoryItem>;

    fn remove(&mut self, key: &str) -> bool;

    fn count(&self) -> usize;

    /// Replace the content of an existing item.  The original insertion
    /// timestamp is preserved; only explicit update mutates an item.
    fn update(&mut self, key: &str, content: Value) -> MemoryResult<()>;
}

/// Serializable image of a [`BaseStore`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub items: Vec<MemoryItem>,
    pub clock: i64,
}

/// Insertion-ordered item vector with O(1) key lookup and a monotonic
/// insertion clock.
#[derive(Debug, Default)]
pub struct BaseStore {
    items: Vec<MemoryItem>,
    by_key: HashMap<String, usize>,
    /// Last assigned timestamp; inserts always get `max(now, clock + 1)` so
    /// ordering survives wall-clock regression.
    clock: i64,
}

impl BaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            items: self.items.clone(),
            clock: self.clock,
        }
    }

    pub fn restore(&mut self, snapshot: StoreSnapshot) {
        self.by_key = snapshot
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.key.clone(), i))
            .collect();
        self.items = snapshot.items;
        self.clock = snapshot.clock;
    }

    fn next_timestamp(&mut self) -> i64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        self.clock = now.max(self.clock + 1);
        self.clock
    }

    fn rebuild_index(&mut self) {
        self.by_key = self
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.key.clone(), i))
            .collect();
    }
}

impl MemoryStore for BaseStore {
    fn add(&mut self, mut item: MemoryItem) -> MemoryResult<()> {
        if self.by_key.contains_key(&item.key) {
            return Err(MemoryError::DuplicateKey(item.key));
        }
        item.timestamp = self.next_timestamp();
        self.by_key.insert(item.key.clone(), self.items.len());
        self.items.push(item);
        Ok(())
    }

    fn get(&self, key: &str) -> Option<&MemoryItem> {
        self.by_key.get(key).and_then(|&i| self.items.get(i))
    }

    fn get_all(&self) -> Vec<&MemoryItem> {
        self.items.iter().collect()
    }

    fn find(&self, needle: &str) -> Vec<&MemoryItem> {
        let needle = needle.to_lowercase();
        self.items
            .iter()
            .filter(|item| item.content.render_text().to_lowercase().contains(&needle))
            .collect()
    }

    fn remove(&mut self, key: &str) -> bool {
        let Some(idx) = self.by_key.remove(key) else {
            return false;
        };
        self.items.remove(idx);
        self.rebuild_index();
        true
    }

    fn count(&self) -> usize {
        self.items.len()
    }

    fn update(&mut self, key: &str, content: Value) -> MemoryResult<()> {
        let Some(&idx) = self.by_key.get(key) else {
            return Err(MemoryError::NotFound(key.to_string()));
        };
        self.items[idx].content = content;
        Ok(())
    }
}
