//! Cascade multi-round extraction
//!
//! Builds a candidate graph in three stages: node discovery, relation-type
//! discovery and triplet assembly, each repeated for a fixed number of
//! rounds. Node ids are ephemeral (the normalized name); the resolver maps
//! them onto stored entities. Nothing here touches the store.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::Result;
use crate::extraction::{parse_structured, Extractor};
use crate::node::{normalize_name, Relation};
use crate::retry::{with_retry, RetryPolicy};

/// Cascade settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    /// Rounds per stage (default: 2)
    pub rounds: usize,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self { rounds: 2 }
    }
}

/// Node of the candidate graph
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateNode {
    /// Ephemeral id: the normalized name
    pub id: String,
    pub name: String,
    pub entity_type: String,
}

/// Directed edge between candidate node ids
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateEdge {
    pub source: String,
    pub target: String,
    pub relation: Relation,
    pub fact: String,
}

/// Output of a cascade run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateGraph {
    pub nodes: Vec<CandidateNode>,
    pub relation_types: Vec<String>,
    pub edges: Vec<CandidateEdge>,
}

impl CandidateGraph {
    pub fn node(&self, id: &str) -> Option<&CandidateNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Add a node unless its normalized name is already present
    fn add_node(&mut self, name: &str, entity_type: &str) -> bool {
        let id = normalize_name(name);
        if id.is_empty() || self.node(&id).is_some() {
            return false;
        }
        self.nodes.push(CandidateNode {
            id,
            name: name.trim().to_string(),
            entity_type: entity_type.trim().to_string(),
        });
        true
    }

    fn add_relation_type(&mut self, relation: &str) -> bool {
        let key = normalize_name(relation);
        if key.is_empty() || self.relation_types.iter().any(|r| normalize_name(r) == key) {
            return false;
        }
        self.relation_types.push(relation.trim().to_string());
        true
    }

    fn add_edge(&mut self, edge: CandidateEdge) -> bool {
        let duplicate = self.edges.iter().any(|e| {
            e.source == edge.source && e.target == edge.target && e.relation == edge.relation
        });
        if duplicate {
            return false;
        }
        self.edges.push(edge);
        true
    }

    /// Union another round's graph into this one
    fn merge(&mut self, other: CandidateGraph) {
        for node in other.nodes {
            if self.node(&node.id).is_none() {
                self.nodes.push(node);
            }
        }
        for edge in other.edges {
            self.add_edge(edge);
        }
    }

    /// Drop edges whose endpoints are not nodes; returns how many were dropped
    fn drop_dangling_edges(&mut self) -> usize {
        let ids: HashSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        let before = self.edges.len();
        let kept: Vec<CandidateEdge> = self
            .edges
            .drain(..)
            .filter(|e| ids.contains(e.source.as_str()) && ids.contains(e.target.as_str()))
            .collect();
        self.edges = kept;
        before - self.edges.len()
    }
}

#[derive(Debug, Deserialize)]
struct DiscoveredNode {
    name: String,
    #[serde(rename = "type", alias = "entity_type", default)]
    entity_type: String,
}

#[derive(Debug, Default, Deserialize)]
struct NodeDiscovery {
    #[serde(default)]
    nodes: Vec<DiscoveredNode>,
}

#[derive(Debug, Default, Deserialize)]
struct RelationDiscovery {
    #[serde(default)]
    relation_types: Vec<String>,
    #[serde(default)]
    nodes: Vec<DiscoveredNode>,
}

#[derive(Debug, Deserialize)]
struct Triplet {
    source: String,
    target: String,
    relation: String,
    #[serde(default)]
    fact: String,
}

#[derive(Debug, Default, Deserialize)]
struct TripletRound {
    #[serde(default)]
    triplets: Vec<Triplet>,
    #[serde(default)]
    nodes: Vec<DiscoveredNode>,
}

fn node_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "name": { "type": "string" },
            "type": { "type": "string" }
        },
        "required": ["name"]
    })
}

fn node_discovery_schema() -> Value {
    json!({
        "title": "node_discovery",
        "type": "object",
        "properties": { "nodes": { "type": "array", "items": node_schema() } },
        "required": ["nodes"]
    })
}

fn relation_discovery_schema() -> Value {
    json!({
        "title": "relation_discovery",
        "type": "object",
        "properties": {
            "relation_types": { "type": "array", "items": { "type": "string" } },
            "nodes": { "type": "array", "items": node_schema() }
        },
        "required": ["relation_types"]
    })
}

fn triplet_schema() -> Value {
    json!({
        "title": "triplet_extraction",
        "type": "object",
        "properties": {
            "triplets": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "source": { "type": "string" },
                        "target": { "type": "string" },
                        "relation": { "type": "string" },
                        "fact": { "type": "string" }
                    },
                    "required": ["source", "target", "relation"]
                }
            },
            "nodes": { "type": "array", "items": node_schema() }
        },
        "required": ["triplets"]
    })
}

fn bullet_list(items: impl Iterator<Item = String>) -> String {
    let lines: Vec<String> = items.map(|i| format!("- {}", i)).collect();
    if lines.is_empty() {
        "(none)".to_string()
    } else {
        lines.join("\n")
    }
}

fn with_context(text: &str, context: &[String]) -> String {
    if context.is_empty() {
        format!("Text:\n{}", text)
    } else {
        format!(
            "Previous messages:\n{}\n\nText:\n{}",
            bullet_list(context.iter().cloned()),
            text
        )
    }
}

/// Multi-round candidate graph extractor
pub struct CascadeExtractor {
    extractor: Arc<dyn Extractor>,
    config: CascadeConfig,
    retry: RetryPolicy,
}

impl CascadeExtractor {
    pub fn new(extractor: Arc<dyn Extractor>, config: CascadeConfig, retry: RetryPolicy) -> Self {
        Self {
            extractor,
            config,
            retry,
        }
    }

    async fn ask<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        prompt: String,
        schema: Value,
    ) -> Result<T> {
        with_retry(&self.retry, operation, || async {
            let value = self.extractor.structured_output(&prompt, &schema).await?;
            parse_structured(operation, value)
        })
        .await
    }

    /// Run all three stages and return the cleaned candidate graph
    #[tracing::instrument(skip(self, text, context))]
    pub async fn extract(&self, text: &str, context: &[String]) -> Result<CandidateGraph> {
        let rounds = self.config.rounds.max(1);
        let mut graph = CandidateGraph::default();

        for round in 0..rounds {
            let prompt = format!(
                "{}\n\nNodes found so far:\n{}\n\nList additional entities (people, organizations, places, concepts) not yet in the list. Round {} of {}.",
                with_context(text, context),
                bullet_list(graph.nodes.iter().map(|n| n.name.clone())),
                round + 1,
                rounds
            );
            let found: NodeDiscovery = self
                .ask("cascade_nodes", prompt, node_discovery_schema())
                .await?;
            let added = found
                .nodes
                .iter()
                .filter(|n| graph.add_node(&n.name, &n.entity_type))
                .count();
            tracing::debug!("Node discovery round {}: {} new nodes", round + 1, added);
        }

        for round in 0..rounds {
            let prompt = format!(
                "{}\n\nNodes:\n{}\n\nRelation types found so far:\n{}\n\nList relation types that connect these nodes, and any nodes that were missed. Round {} of {}.",
                with_context(text, context),
                bullet_list(graph.nodes.iter().map(|n| n.name.clone())),
                bullet_list(graph.relation_types.iter().cloned()),
                round + 1,
                rounds
            );
            let found: RelationDiscovery = self
                .ask("cascade_relations", prompt, relation_discovery_schema())
                .await?;
            for relation in &found.relation_types {
                graph.add_relation_type(relation);
            }
            for node in &found.nodes {
                graph.add_node(&node.name, &node.entity_type);
            }
        }

        for round in 0..rounds {
            let prompt = format!(
                "{}\n\nNodes:\n{}\n\nRelation types:\n{}\n\nExtract (source, target, relation, fact) triplets between the nodes. Report any new nodes you use. Round {} of {}.",
                with_context(text, context),
                bullet_list(graph.nodes.iter().map(|n| n.name.clone())),
                bullet_list(graph.relation_types.iter().cloned()),
                round + 1,
                rounds
            );
            let found: TripletRound = self
                .ask("cascade_triplets", prompt, triplet_schema())
                .await?;

            let mut round_graph = CandidateGraph::default();
            for node in &found.nodes {
                round_graph.add_node(&node.name, &node.entity_type);
            }
            for triplet in found.triplets {
                let fact = if triplet.fact.trim().is_empty() {
                    format!("{} {} {}", triplet.source, triplet.relation, triplet.target)
                } else {
                    triplet.fact.trim().to_string()
                };
                round_graph.add_edge(CandidateEdge {
                    source: normalize_name(&triplet.source),
                    target: normalize_name(&triplet.target),
                    relation: Relation::new(&triplet.relation),
                    fact,
                });
            }
            graph.merge(round_graph);
        }

        let dropped = graph.drop_dangling_edges();
        if dropped > 0 {
            tracing::warn!("Dropped {} cascade edges with unknown endpoints", dropped);
        }
        tracing::debug!(
            "Cascade graph: {} nodes, {} relation types, {} edges",
            graph.nodes.len(),
            graph.relation_types.len(),
            graph.edges.len()
        );
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MemoryError;
    use crate::testing::ScriptedExtractor;

    fn cascade(extractor: Arc<ScriptedExtractor>, rounds: usize) -> CascadeExtractor {
        CascadeExtractor::new(extractor, CascadeConfig { rounds }, RetryPolicy::immediate(2))
    }

    #[tokio::test]
    async fn test_rounds_accumulate_and_dedup() {
        let extractor = Arc::new(ScriptedExtractor::new());
        extractor.respond(
            "node_discovery",
            json!({"nodes": [{"name": "Alice", "type": "person"}, {"name": "Google"}]}),
        );
        extractor.respond(
            "node_discovery",
            json!({"nodes": [{"name": "alice"}, {"name": "Mountain View", "type": "location"}]}),
        );
        extractor.respond(
            "relation_discovery",
            json!({"relation_types": ["works at", "WORKS AT"], "nodes": []}),
        );
        extractor.respond(
            "triplet_extraction",
            json!({"triplets": [
                {"source": "Alice", "target": "Google", "relation": "works at", "fact": "Alice works at Google"},
                {"source": "Google", "target": "Mountain View", "relation": "located in"}
            ]}),
        );
        extractor.respond(
            "triplet_extraction",
            json!({"triplets": [
                {"source": "alice", "target": "google", "relation": "WORKS_AT"}
            ]}),
        );

        let graph = cascade(extractor.clone(), 2)
            .extract("Alice works at Google in Mountain View", &[])
            .await
            .unwrap();

        let names: Vec<&str> = graph.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["Alice", "Google", "Mountain View"]);
        assert_eq!(graph.relation_types, vec!["works at"]);
        assert_eq!(graph.edges.len(), 2);
        assert_eq!(graph.edges[1].fact, "Google located in Mountain View");
        assert_eq!(extractor.calls("structured_output"), 6);
    }

    #[tokio::test]
    async fn test_dangling_edges_are_dropped() {
        let extractor = Arc::new(ScriptedExtractor::new());
        extractor.respond("node_discovery", json!({"nodes": [{"name": "Alice"}]}));
        extractor.respond(
            "triplet_extraction",
            json!({
                "triplets": [
                    {"source": "Alice", "target": "Bob", "relation": "knows"},
                    {"source": "Alice", "target": "Carol", "relation": "knows"}
                ],
                "nodes": [{"name": "Carol", "type": "person"}]
            }),
        );

        let graph = cascade(extractor, 1).extract("text", &[]).await.unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.edges.len(), 1);
        assert_eq!(graph.edges[0].target, "carol");
    }

    #[tokio::test]
    async fn test_malformed_payload_retries_then_fails() {
        let extractor = Arc::new(ScriptedExtractor::new());
        extractor.respond("node_discovery", json!({"nodes": "not a list"}));
        extractor.respond("node_discovery", json!({"nodes": 7}));

        let err = cascade(extractor.clone(), 1)
            .extract("text", &[])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MemoryError::RetriesExhausted { attempts: 2, .. }
        ));
        assert_eq!(extractor.calls("structured_output"), 2);
    }
}
