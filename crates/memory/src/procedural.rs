//! Procedural store: named declarative recipes.
//!
//! A recipe is data, not code: an ordered list of `{op, args}` instructions
//! interpreted by the reasoning executor.  Nothing is evaluated at load
//! time, and execution of tool ops still passes the permission gate like
//! any other tool step.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::store::{BaseStore, MemoryStore, StoreSnapshot};
use crate::value::{MemoryItem, Value};
use crate::{MemoryError, MemoryResult};

/// Instruction opcodes a recipe may contain.  Unknown ops are rejected at
/// insert so a corrupted or hand-edited store cannot smuggle new behavior.
pub const KNOWN_OPS: &[&str] = &["reason", "tool", "retrieve", "verify"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeOp {
    pub op: String,
    #[serde(default)]
    pub args: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub params: Vec<String>,
    pub body: Vec<RecipeOp>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Recipe {
    pub fn validate(&self) -> MemoryResult<()> {
        for op in &self.body {
            if !KNOWN_OPS.contains(&op.op.as_str()) {
                return Err(MemoryError::NotFound(format!("unknown recipe op '{}'", op.op)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProceduralSnapshot {
    pub store: StoreSnapshot,
    pub recipes: Vec<(String, Recipe)>,
}

/// Name → recipe mapping.
#[derive(Debug, Default)]
pub struct ProceduralStore {
    base: BaseStore,
    recipes: std::collections::HashMap<String, Recipe>,
}

impl ProceduralStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, recipe: Recipe) -> MemoryResult<()> {
        recipe.validate()?;
        let summary = format!(
            "recipe {name} ({} params, {} steps)",
            recipe.params.len(),
            recipe.body.len()
        );
        self.base.add(MemoryItem::new(name, Value::from(summary)))?;
        self.recipes.insert(name.to_string(), recipe);
        Ok(())
    }

    pub fn recipe(&self, name: &str) -> Option<&Recipe> {
        self.recipes.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.recipes.keys().map(String::as_str).collect()
    }

    pub fn snapshot(&self) -> ProceduralSnapshot {
        ProceduralSnapshot {
            store: self.base.snapshot(),
            recipes: self
                .recipes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Restore from disk.  Every recipe is re-validated; an image carrying
    /// an unknown op is treated as corrupt input and refused.
    pub fn restore(&mut self, snapshot: ProceduralSnapshot) -> MemoryResult<()> {
        for (_, recipe) in &snapshot.recipes {
            recipe.validate()?;
        }
        self.base.restore(snapshot.store);
        self.recipes = snapshot.recipes.into_iter().collect();
        Ok(())
    }
}

impl MemoryStore for ProceduralStore {
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
        self.recipes.remove(key);
        self.base.remove(key)
    }

    fn count(&self) -> usize {
        self.base.count()
    }

    fn update(&mut self, key: &str, content: Value) -> MemoryResult<()> {
        self.base.update(key, content)
    }
}
