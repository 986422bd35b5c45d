use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Tagged payload value stored in every memory item.
///
/// Serializes with serde's external tagging (`{"str": "..."}`,
/// `{"num": 3.0}`, …) so `bytes` and `list` never collide on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Value {
    Str(String),
    Num(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Flattened text view used by substring search: strings verbatim,
    /// containers recursively joined.
    pub fn render_text(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Num(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Bytes(b) => format!("<{} bytes>", b.len()),
            Value::List(items) => items
                .iter()
                .map(Value::render_text)
                .collect::<Vec<_>>()
                .join(" "),
            Value::Map(map) => map
                .iter()
                .map(|(k, v)| format!("{k}: {}", v.render_text()))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Num(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Universal memory payload: unique key within its store, tagged content,
/// monotonically assigned insertion timestamp, free-form metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub key: String,
    pub content: Value,
    pub timestamp: i64,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl MemoryItem {
    pub fn new(key: impl Into<String>, content: Value) -> Self {
        Self {
            key: key.into(),
            content,
            timestamp: 0,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_serde_is_externally_tagged() {
        let value = Value::Str("hello".to_string());
        assert_eq!(serde_json::to_string(&value).unwrap(), r#"{"str":"hello"}"#);

        let bytes = Value::Bytes(vec![1, 2, 3]);
        let rendered = serde_json::to_string(&bytes).unwrap();
        assert_eq!(rendered, r#"{"bytes":[1,2,3]}"#);

        // bytes and list of nums stay distinguishable on the wire
        let list = Value::List(vec![Value::Num(1.0), Value::Num(2.0)]);
        let back: Value = serde_json::from_str(&serde_json::to_string(&list).unwrap()).unwrap();
        assert_eq!(back, list);
    }

    #[test]
    fn nested_roundtrip() {
        let mut map = BTreeMap::new();
        map.insert("target".to_string(), Value::from("10.0.0.1"));
        map.insert("ports".to_string(), Value::List(vec![Value::Num(22.0), Value::Num(443.0)]));
        let value = Value::Map(map);

        let json = serde_json::to_string(&value).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn render_text_flattens_containers() {
        let mut map = BTreeMap::new();
        map.insert("kind".to_string(), Value::from("scan"));
        let value = Value::List(vec![Value::from("nmap"), Value::Map(map)]);
        assert_eq!(value.render_text(), "nmap kind: scan");
    }

    #[test]
    fn item_metadata_builder() {
        let item = MemoryItem::new("k1", Value::from("content"))
            .with_metadata("source", Value::from("user-input"));
        assert_eq!(item.metadata["source"].as_str(), Some("user-input"));
    }
}
