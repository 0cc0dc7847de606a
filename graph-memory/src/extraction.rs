//! Extraction collaborator interface
//!
//! The LLM client behind [`Extractor`] is external. Everything it returns is
//! parsed into the strict structs below; a payload that does not fit is a
//! recoverable [`MemoryError::MalformedOutput`], never a panic.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{MemoryError, Result};

/// Longest surface name accepted from the extractor
const MAX_NAME_LEN: usize = 256;

/// Candidate entity returned by extraction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(rename = "type", alias = "entity_type", default)]
    pub entity_type: String,
}

impl ExtractedEntity {
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
        }
    }

    /// Reject candidates that cannot become entities
    pub fn validate(&self) -> std::result::Result<(), String> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err("empty entity name".to_string());
        }
        if name.len() > MAX_NAME_LEN {
            return Err(format!("entity name longer than {} bytes", MAX_NAME_LEN));
        }
        Ok(())
    }
}

/// Candidate relationship returned by extraction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRelationship {
    pub source: String,
    pub relation: String,
    #[serde(alias = "target")]
    pub destination: String,
    /// Sentence stating the relationship
    #[serde(default)]
    pub fact: String,
}

impl ExtractedRelationship {
    pub fn new(
        source: impl Into<String>,
        relation: impl Into<String>,
        destination: impl Into<String>,
        fact: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            relation: relation.into(),
            destination: destination.into(),
            fact: fact.into(),
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.source.trim().is_empty() || self.destination.trim().is_empty() {
            return Err("relationship endpoint is empty".to_string());
        }
        if self.relation.trim().is_empty() {
            return Err("relationship name is empty".to_string());
        }
        Ok(())
    }

    /// Fact text, falling back to `source relation destination`
    pub fn fact_text(&self) -> String {
        if self.fact.trim().is_empty() {
            format!("{} {} {}", self.source, self.relation, self.destination)
        } else {
            self.fact.trim().to_string()
        }
    }
}

/// A new fact judged to contradict or supersede an existing one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contradiction {
    #[serde(alias = "new_idx")]
    pub new_index: usize,
    #[serde(alias = "existing_idx")]
    pub existing_index: usize,
    #[serde(default)]
    pub reason: String,
}

/// Regenerated entity summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySummary {
    pub summary: String,
}

impl EntitySummary {
    pub fn schema() -> Value {
        json!({
            "title": "entity_summary",
            "type": "object",
            "properties": { "summary": { "type": "string" } },
            "required": ["summary"]
        })
    }
}

/// LLM-backed extraction client
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Candidate entities mentioned in `text`
    async fn extract_entities(
        &self,
        text: &str,
        owner: &str,
        context: &[String],
    ) -> Result<Vec<ExtractedEntity>>;

    /// Candidate relationships between the resolved `names`
    async fn extract_relationships(
        &self,
        text: &str,
        names: &[String],
        owner: &str,
        context: &[String],
    ) -> Result<Vec<ExtractedRelationship>>;

    /// Pairwise contradiction judgement between new and existing fact texts
    async fn detect_contradictions(
        &self,
        new_facts: &[String],
        existing_facts: &[String],
    ) -> Result<Vec<Contradiction>>;

    /// Free-form structured call constrained by a JSON schema
    async fn structured_output(&self, prompt: &str, schema: &Value) -> Result<Value>;
}

/// Parse a structured payload into `T`
pub fn parse_structured<T: DeserializeOwned>(operation: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| MemoryError::malformed(operation, e.to_string()))
}
