//! Concept graph: labeled directed graph over extracted knowledge entities.
//!
//! Arena-backed: nodes and edges live in flat vectors, ids map to slots.
//! Deletion tombstones the slot and cascades to incident edges; the arena
//! compacts itself once tombstones outnumber live entries.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::value::Value;
use crate::{MemoryError, MemoryResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptNode {
    pub id: Uuid,
    pub label: String,
    pub node_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptEdge {
    pub id: Uuid,
    pub source: Uuid,
    pub target: Uuid,
    pub label: String,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

/// Persistable image containing live entries only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<ConceptNode>,
    pub edges: Vec<ConceptEdge>,
}

#[derive(Debug, Default)]
pub struct ConceptGraph {
    nodes: Vec<Option<ConceptNode>>,
    node_slots: HashMap<Uuid, usize>,
    /// Lowercased label → node id, backing label-based upserts.
    label_index: HashMap<String, Uuid>,
    edges: Vec<Option<ConceptEdge>>,
    edge_slots: HashMap<Uuid, usize>,
    /// Node id → incident edge ids (either direction).
    incident: HashMap<Uuid, Vec<Uuid>>,
    tombstones: usize,
}

impl ConceptGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(
        &mut self,
        label: &str,
        node_type: &str,
        properties: BTreeMap<String, Value>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let node = ConceptNode {
            id,
            label: label.to_string(),
            node_type: node_type.to_string(),
            properties,
        };
        self.node_slots.insert(id, self.nodes.len());
        self.label_index.insert(label.to_lowercase(), id);
        self.incident.insert(id, Vec::new());
        self.nodes.push(Some(node));
        id
    }

    /// Find a node by label (case-insensitive) or create it.
    pub fn upsert_node(&mut self, label: &str, node_type: &str) -> Uuid {
        if let Some(&id) = self.label_index.get(&label.to_lowercase()) {
            if self.node_slots.contains_key(&id) {
                return id;
            }
        }
        self.add_node(label, node_type, BTreeMap::new())
    }

    pub fn node(&self, id: Uuid) -> Option<&ConceptNode> {
        self.node_slots
            .get(&id)
            .and_then(|&slot| self.nodes.get(slot))
            .and_then(Option::as_ref)
    }

    pub fn find_by_label(&self, label: &str) -> Option<&ConceptNode> {
        self.label_index
            .get(&label.to_lowercase())
            .and_then(|&id| self.node(id))
    }

    /// Add an edge; both endpoints must exist.
    pub fn add_edge(
        &mut self,
        source: Uuid,
        target: Uuid,
        label: &str,
        properties: BTreeMap<String, Value>,
    ) -> MemoryResult<Uuid> {
        if self.node(source).is_none() {
            return Err(MemoryError::NotFound(format!("source node {source}")));
        }
        if self.node(target).is_none() {
            return Err(MemoryError::NotFound(format!("target node {target}")));
        }

        let id = Uuid::new_v4();
        let edge = ConceptEdge {
            id,
            source,
            target,
            label: label.to_string(),
            properties,
        };
        self.edge_slots.insert(id, self.edges.len());
        self.edges.push(Some(edge));
        self.incident.entry(source).or_default().push(id);
        if source != target {
            self.incident.entry(target).or_default().push(id);
        }
        Ok(id)
    }

    pub fn edge(&self, id: Uuid) -> Option<&ConceptEdge> {
        self.edge_slots
            .get(&id)
            .and_then(|&slot| self.edges.get(slot))
            .and_then(Option::as_ref)
    }

    /// Tombstone a node and every incident edge.
    pub fn remove_node(&mut self, id: Uuid) -> bool {
        let Some(slot) = self.node_slots.remove(&id) else {
            return false;
        };
        if let Some(node) = self.nodes[slot].take() {
            self.label_index.remove(&node.label.to_lowercase());
        }
        self.tombstones += 1;

        for edge_id in self.incident.remove(&id).unwrap_or_default() {
            self.remove_edge_internal(edge_id, Some(id));
        }

        self.maybe_compact();
        true
    }

    pub fn remove_edge(&mut self, id: Uuid) -> bool {
        let removed = self.remove_edge_internal(id, None);
        if removed {
            self.maybe_compact();
        }
        removed
    }

    fn remove_edge_internal(&mut self, id: Uuid, skip_node: Option<Uuid>) -> bool {
        let Some(slot) = self.edge_slots.remove(&id) else {
            return false;
        };
        let Some(edge) = self.edges[slot].take() else {
            return false;
        };
        self.tombstones += 1;

        for endpoint in [edge.source, edge.target] {
            if Some(endpoint) == skip_node {
                continue;
            }
            if let Some(list) = self.incident.get_mut(&endpoint) {
                list.retain(|&e| e != id);
            }
        }
        true
    }

    /// Nodes reachable over one edge in either direction.
    pub fn neighbors(&self, id: Uuid) -> Vec<&ConceptNode> {
        let Some(edge_ids) = self.incident.get(&id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for edge_id in edge_ids {
            if let Some(edge) = self.edge(*edge_id) {
                let other = if edge.source == id { edge.target } else { edge.source };
                if let Some(node) = self.node(other) {
                    out.push(node);
                }
            }
        }
        out
    }

    /// Nodes whose label contains `needle` (case-insensitive).
    pub fn search(&self, needle: &str) -> Vec<&ConceptNode> {
        let needle = needle.to_lowercase();
        self.live_nodes()
            .filter(|node| node.label.to_lowercase().contains(&needle))
            .collect()
    }

    /// Nodes whose string properties are a superset of `filters`
    /// (e.g. `category`/`difficulty` restrictions on catalog lookups).
    pub fn nodes_matching(&self, filters: &BTreeMap<String, String>) -> Vec<&ConceptNode> {
        self.live_nodes()
            .filter(|node| {
                filters.iter().all(|(key, expected)| {
                    node.properties
                        .get(key)
                        .and_then(Value::as_str)
                        .map(|actual| actual == expected)
                        .unwrap_or(false)
                })
            })
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.node_slots.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_slots.len()
    }

    fn live_nodes(&self) -> impl Iterator<Item = &ConceptNode> {
        self.nodes.iter().filter_map(Option::as_ref)
    }

    fn maybe_compact(&mut self) {
        let live = self.node_slots.len() + self.edge_slots.len();
        if self.tombstones > live.max(8) {
            self.compact();
        }
    }

    /// Rebuild the arenas without tombstones.
    pub fn compact(&mut self) {
        let nodes: Vec<ConceptNode> = self.nodes.drain(..).flatten().collect();
        let edges: Vec<ConceptEdge> = self.edges.drain(..).flatten().collect();
        debug!(nodes = nodes.len(), edges = edges.len(), dropped = self.tombstones, "compacting concept graph");

        self.node_slots.clear();
        self.edge_slots.clear();
        self.incident.clear();
        self.label_index.clear();
        self.tombstones = 0;

        for node in nodes {
            self.node_slots.insert(node.id, self.nodes.len());
            self.label_index.insert(node.label.to_lowercase(), node.id);
            self.incident.insert(node.id, Vec::new());
            self.nodes.push(Some(node));
        }
        for edge in edges {
            let id = edge.id;
            let (source, target) = (edge.source, edge.target);
            self.edge_slots.insert(id, self.edges.len());
            self.edges.push(Some(edge));
            self.incident.entry(source).or_default().push(id);
            if source != target {
                self.incident.entry(target).or_default().push(id);
            }
        }
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.live_nodes().cloned().collect(),
            edges: self.edges.iter().filter_map(Option::as_ref).cloned().collect(),
        }
    }

    pub fn restore(&mut self, snapshot: GraphSnapshot) -> MemoryResult<()> {
        *self = Self::new();
        for node in snapshot.nodes {
            self.node_slots.insert(node.id, self.nodes.len());
            self.label_index.insert(node.label.to_lowercase(), node.id);
            self.incident.insert(node.id, Vec::new());
            self.nodes.push(Some(node));
        }
        for edge in snapshot.edges {
            // Enforce the referential invariant on load too.
            if !self.node_slots.contains_key(&edge.source) {
                return Err(MemoryError::NotFound(format!("edge source {}", edge.source)));
            }
            if !self.node_slots.contains_key(&edge.target) {
                return Err(MemoryError::NotFound(format!("edge target {}", edge.target)));
            }
            let id = edge.id;
            let (source, target) = (edge.source, edge.target);
            self.edge_slots.insert(id, self.edges.len());
            self.edges.push(Some(edge));
            self.incident.entry(source).or_default().push(id);
            if source != target {
                self.incident.entry(target).or_default().push(id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edges_require_existing_nodes() {
        let mut graph = ConceptGraph::new();
        let a = graph.add_node("sql injection", "technique", BTreeMap::new());
        let ghost = Uuid::new_v4();

        assert!(graph.add_edge(a, ghost, "related-to", BTreeMap::new()).is_err());
        assert!(graph.add_edge(ghost, a, "related-to", BTreeMap::new()).is_err());
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn remove_node_cascades_to_incident_edges() {
        let mut graph = ConceptGraph::new();
        let a = graph.add_node("phishing", "technique", BTreeMap::new());
        let b = graph.add_node("email", "vector", BTreeMap::new());
        let c = graph.add_node("spoofing", "technique", BTreeMap::new());
        graph.add_edge(a, b, "uses", BTreeMap::new()).unwrap();
        graph.add_edge(b, c, "enables", BTreeMap::new()).unwrap();

        assert!(graph.remove_node(b));
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 0, "both incident edges must cascade");
        assert!(graph.neighbors(a).is_empty());
    }

    #[test]
    fn upsert_by_label_is_case_insensitive() {
        let mut graph = ConceptGraph::new();
        let first = graph.upsert_node("Nmap", "tool");
        let second = graph.upsert_node("nmap", "tool");
        assert_eq!(first, second);
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn neighbors_cross_edge_direction() {
        let mut graph = ConceptGraph::new();
        let a = graph.add_node("recon", "phase", BTreeMap::new());
        let b = graph.add_node("nmap", "tool", BTreeMap::new());
        graph.add_edge(a, b, "uses", BTreeMap::new()).unwrap();

        assert_eq!(graph.neighbors(a)[0].label, "nmap");
        assert_eq!(graph.neighbors(b)[0].label, "recon");
    }

    #[test]
    fn property_filters_match_subset() {
        let mut graph = ConceptGraph::new();
        let mut props = BTreeMap::new();
        props.insert("category".to_string(), Value::from("web"));
        props.insert("difficulty".to_string(), Value::from("beginner"));
        graph.add_node("xss", "technique", props);
        graph.add_node("bgp hijack", "technique", BTreeMap::new());

        let mut filters = BTreeMap::new();
        filters.insert("category".to_string(), "web".to_string());
        assert_eq!(graph.nodes_matching(&filters).len(), 1);

        filters.insert("difficulty".to_string(), "expert".to_string());
        assert!(graph.nodes_matching(&filters).is_empty());
    }

    #[test]
    fn compaction_preserves_structure() {
        let mut graph = ConceptGraph::new();
        let mut kept = Vec::new();
        for i in 0..20 {
            kept.push(graph.add_node(&format!("node-{i}"), "t", BTreeMap::new()));
        }
        for pair in kept.windows(2) {
            graph.add_edge(pair[0], pair[1], "next", BTreeMap::new()).unwrap();
        }

        // Remove most nodes to force automatic compaction.
        for &id in &kept[..15] {
            graph.remove_node(id);
        }

        assert_eq!(graph.node_count(), 5);
        assert_eq!(graph.edge_count(), 4);
        // The survivors are still chained.
        assert_eq!(graph.neighbors(kept[16]).len(), 2);
    }

    #[test]
    fn snapshot_restore_rejects_dangling_edges() {
        let mut graph = ConceptGraph::new();
        let a = graph.add_node("a", "t", BTreeMap::new());
        let b = graph.add_node("b", "t", BTreeMap::new());
        graph.add_edge(a, b, "x", BTreeMap::new()).unwrap();

        let mut snapshot = graph.snapshot();
        snapshot.nodes.retain(|n| n.id != b);

        let mut restored = ConceptGraph::new();
        assert!(restored.restore(snapshot).is_err());
    }

    #[test]
    fn snapshot_roundtrip() {
        let mut graph = ConceptGraph::new();
        let a = graph.add_node("sql injection", "technique", BTreeMap::new());
        let b = graph.add_node("sqlmap", "tool", BTreeMap::new());
        graph.add_edge(b, a, "exploits", BTreeMap::new()).unwrap();

        let mut restored = ConceptGraph::new();
        restored.restore(graph.snapshot()).unwrap();
        assert_eq!(restored.node_count(), 2);
        assert_eq!(restored.edge_count(), 1);
        assert_eq!(restored.find_by_label("sqlmap").unwrap().node_type, "tool");
        assert_eq!(restored.neighbors(a).len(), 1);
    }
}
