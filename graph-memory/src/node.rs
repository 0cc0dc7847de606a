//! Graph record types and builders
//!
//! Episodes, entities, facts and mention edges: the four record kinds of
//! the memory graph.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::temporal::FactTemporal;

/// Free-form attributes attached to entities and facts
pub type Attributes = BTreeMap<String, Value>;

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random id
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from existing UUID
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

record_id!(
    /// Unique identifier for episodes
    EpisodeId
);
record_id!(
    /// Unique identifier for entities
    EntityId
);
record_id!(
    /// Unique identifier for facts
    FactId
);

/// Lowercase and collapse whitespace; the dedup key for surface names
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $($variant,)+
            /// Any value outside the known vocabulary, kept verbatim
            Other(String),
        }

        impl $name {
            /// Canonical string form
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $text,)+
                    Self::Other(s) => s.as_str(),
                }
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Self::default();
                }
                $(
                    if trimmed.eq_ignore_ascii_case($text) {
                        return Self::$variant;
                    }
                )+
                Self::Other(trimmed.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self::from(s.as_str())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.as_str().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum!(
    /// Where an episode came from
    EpisodeSource {
        Message => "message",
        Text => "text",
        Json => "json",
        Document => "document",
    }
);

string_enum!(
    /// Whether an episode is a user query or a saved memory
    EpisodeTag {
        Query => "query",
        Memory => "memory",
    }
);

string_enum!(
    /// Entity type assigned at first resolution
    EntityType {
        Person => "person",
        Organization => "organization",
        Location => "location",
        Event => "event",
        Concept => "concept",
        Object => "object",
    }
);

impl Default for EpisodeSource {
    fn default() -> Self {
        Self::Text
    }
}

impl Default for EpisodeTag {
    fn default() -> Self {
        Self::Memory
    }
}

impl Default for EntityType {
    fn default() -> Self {
        Self::Concept
    }
}

/// Relation name, normalized to upper snake case (`works at` -> `WORKS_AT`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Relation(String);

impl Relation {
    pub fn new(name: &str) -> Self {
        let normalized = name
            .split(|c: char| !c.is_alphanumeric())
            .filter(|part| !part.is_empty())
            .map(str::to_uppercase)
            .collect::<Vec<_>>()
            .join("_");
        if normalized.is_empty() {
            Self("RELATES_TO".to_string())
        } else {
            Self(normalized)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Relation {
    fn from(s: String) -> Self {
        Self::new(&s)
    }
}

impl From<Relation> for String {
    fn from(value: Relation) -> Self {
        value.0
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One ingested unit of raw content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: EpisodeId,
    /// Owner (user or agent) the episode belongs to
    pub owner: String,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Raw content, never modified after ingestion
    pub content: String,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub source: EpisodeSource,
    pub tag: EpisodeTag,
    pub created_at: DateTime<Utc>,
    pub valid_at: DateTime<Utc>,
    /// JSON object; may nest `session.tags` and `session.saved_memories`
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Facts produced while resolving this episode
    #[serde(default)]
    pub fact_ids: Vec<FactId>,
}

impl Episode {
    /// Create a new builder for Episode
    pub fn builder() -> EpisodeBuilder {
        EpisodeBuilder::default()
    }

    /// Merge top-level keys of `patch` into the metadata
    pub fn patch_metadata(&mut self, patch: Map<String, Value>) {
        for (key, value) in patch {
            self.metadata.insert(key, value);
        }
    }

    /// Normalized tag set: the episode tag plus `tags` and `session.tags`
    pub fn tags(&self) -> Vec<String> {
        let mut tags = vec![normalize_name(self.tag.as_str())];
        let nested = self
            .metadata
            .get("session")
            .and_then(|session| session.get("tags"));
        for list in [self.metadata.get("tags"), nested].into_iter().flatten() {
            if let Some(items) = list.as_array() {
                tags.extend(
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(normalize_name)
                        .filter(|t| !t.is_empty()),
                );
            }
        }
        tags.sort();
        tags.dedup();
        tags
    }

    /// Saved-memory fragments nested in session metadata
    pub fn saved_memories(&self) -> Vec<String> {
        self.metadata
            .get("session")
            .and_then(|session| session.get("saved_memories"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| match item {
                        Value::String(s) => Some(s.clone()),
                        Value::Object(obj) => obj
                            .get("content")
                            .and_then(Value::as_str)
                            .map(String::from),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Get the searchable text for this episode
    pub fn searchable_text(&self) -> String {
        let mut text = self.content.clone();
        for fragment in self.saved_memories() {
            text.push(' ');
            text.push_str(&fragment);
        }
        text
    }
}

/// Builder for Episode with fluent API
#[derive(Debug, Default)]
pub struct EpisodeBuilder {
    id: Option<EpisodeId>,
    owner: Option<String>,
    session_id: Option<String>,
    content: Option<String>,
    embedding: Option<Vec<f32>>,
    source: EpisodeSource,
    tag: EpisodeTag,
    created_at: Option<DateTime<Utc>>,
    valid_at: Option<DateTime<Utc>>,
    metadata: Map<String, Value>,
}

impl EpisodeBuilder {
    /// Set the episode ID (auto-generated if not set)
    pub fn id(mut self, id: EpisodeId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn source(mut self, source: EpisodeSource) -> Self {
        self.source = source;
        self
    }

    pub fn tag(mut self, tag: EpisodeTag) -> Self {
        self.tag = tag;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// When the content became true (defaults to creation time)
    pub fn valid_at(mut self, at: DateTime<Utc>) -> Self {
        self.valid_at = Some(at);
        self
    }

    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Build the Episode
    pub fn build(self) -> Result<Episode, RecordBuilderError> {
        let owner = self.owner.ok_or(RecordBuilderError::MissingOwner)?;
        let content = self.content.ok_or(RecordBuilderError::MissingContent)?;
        let created_at = self.created_at.unwrap_or_else(Utc::now);

        Ok(Episode {
            id: self.id.unwrap_or_default(),
            owner,
            session_id: self.session_id,
            content,
            embedding: self.embedding,
            source: self.source,
            tag: self.tag,
            created_at,
            valid_at: self.valid_at.unwrap_or(created_at),
            metadata: self.metadata,
            fact_ids: Vec::new(),
        })
    }
}

/// A resolved, deduplicated concept node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub owner: String,
    /// Canonical name, fixed after first resolution
    pub name: String,
    pub entity_type: EntityType,
    /// Rolling summary regenerated on every merge
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub name_embedding: Option<Vec<f32>>,
    pub mention_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Entity {
    /// A freshly resolved entity with one mention
    pub fn new(owner: impl Into<String>, name: impl Into<String>, entity_type: EntityType) -> Self {
        let now = Utc::now();
        let label = entity_type.as_str().to_string();
        Self {
            id: EntityId::new(),
            owner: owner.into(),
            name: name.into(),
            entity_type,
            summary: String::new(),
            name_embedding: None,
            mention_count: 1,
            created_at: now,
            updated_at: now,
            labels: vec![label],
            attributes: Attributes::new(),
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.name_embedding = Some(embedding);
        self
    }

    /// Text embedded for similarity matching: `name (type)`
    pub fn embedding_text(name: &str, entity_type: &EntityType) -> String {
        format!("{} ({})", name, entity_type)
    }

    /// Record another mention
    pub fn record_mention(&mut self) {
        self.mention_count = self.mention_count.saturating_add(1);
        self.updated_at = Utc::now();
    }

    /// Get the searchable text for this entity
    pub fn searchable_text(&self) -> String {
        format!("{} {} {}", self.name, self.entity_type, self.summary)
    }
}

/// A bi-temporally versioned relationship edge between two entities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: FactId,
    /// Owner of both endpoints
    pub owner: String,
    pub source: EntityId,
    pub target: EntityId,
    pub relation: Relation,
    /// Natural-language statement of the fact
    pub fact: String,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub temporal: FactTemporal,
    /// Supporting episodes, oldest first
    #[serde(default)]
    pub episodes: Vec<EpisodeId>,
    pub mention_count: u32,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Fact {
    pub fn new(
        owner: impl Into<String>,
        source: EntityId,
        target: EntityId,
        relation: Relation,
        fact: impl Into<String>,
    ) -> Self {
        Self {
            id: FactId::new(),
            owner: owner.into(),
            source,
            target,
            relation,
            fact: fact.into(),
            embedding: None,
            temporal: FactTemporal::now(),
            episodes: Vec::new(),
            mention_count: 1,
            attributes: Attributes::new(),
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_episode(mut self, episode: EpisodeId) -> Self {
        self.add_episode(episode);
        self
    }

    /// Append a supporting episode, ignoring duplicates
    pub fn add_episode(&mut self, episode: EpisodeId) {
        if !self.episodes.contains(&episode) {
            self.episodes.push(episode);
        }
    }

    /// Whether the fact touches the entity on either end
    pub fn touches(&self, entity: EntityId) -> bool {
        self.source == entity || self.target == entity
    }

    /// The endpoint opposite to `entity`
    pub fn other_end(&self, entity: EntityId) -> Option<EntityId> {
        if self.source == entity {
            Some(self.target)
        } else if self.target == entity {
            Some(self.source)
        } else {
            None
        }
    }

    pub fn is_live(&self) -> bool {
        self.temporal.is_live()
    }

    /// Merge attribute keys, later values win
    pub fn merge_attributes(&mut self, attributes: Attributes) {
        self.attributes.extend(attributes);
    }

    /// Get the searchable text for this fact
    pub fn searchable_text(&self) -> String {
        format!("{} {}", self.relation, self.fact)
    }
}

/// Records that an episode's extraction referenced an entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mention {
    pub episode: EpisodeId,
    pub entity: EntityId,
    pub created_at: DateTime<Utc>,
}

impl Mention {
    pub fn new(episode: EpisodeId, entity: EntityId) -> Self {
        Self {
            episode,
            entity,
            created_at: Utc::now(),
        }
    }
}

/// Errors that can occur when building a record
#[derive(Debug, thiserror::Error)]
pub enum RecordBuilderError {
    #[error("Missing required field: owner")]
    MissingOwner,
    #[error("Missing required field: content")]
    MissingContent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_id_generation() {
        assert_ne!(EntityId::new(), EntityId::new());
    }

    #[test]
    fn test_record_id_parse() {
        let id = FactId::new();
        let parsed: FactId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  Alice   Smith "), "alice smith");
        assert_eq!(normalize_name("GOOGLE"), "google");
    }

    #[test]
    fn test_entity_type_parse_fallback() {
        assert_eq!(EntityType::from("Person"), EntityType::Person);
        assert_eq!(EntityType::from(" ORGANIZATION "), EntityType::Organization);
        assert_eq!(
            EntityType::from("Spaceship"),
            EntityType::Other("Spaceship".to_string())
        );
    }

    #[test]
    fn test_entity_type_serializes_as_string() {
        let json = serde_json::to_string(&EntityType::Location).unwrap();
        assert_eq!(json, "\"location\"");
        let back: EntityType = serde_json::from_str("\"gadget\"").unwrap();
        assert_eq!(back, EntityType::Other("gadget".to_string()));
    }

    #[test]
    fn test_relation_normalization() {
        assert_eq!(Relation::new("works at").as_str(), "WORKS_AT");
        assert_eq!(Relation::new("Works-At").as_str(), "WORKS_AT");
        assert_eq!(Relation::new("  ").as_str(), "RELATES_TO");
    }

    #[test]
    fn test_episode_builder_missing_owner() {
        let result = Episode::builder().content("hello").build();
        assert!(matches!(result, Err(RecordBuilderError::MissingOwner)));
    }

    #[test]
    fn test_episode_tags_merge_nested_session() {
        let metadata = json!({
            "tags": ["Billing", "urgent"],
            "session": { "tags": ["billing", "Support Desk"] }
        });
        let episode = Episode::builder()
            .owner("u1")
            .content("invoice overdue")
            .tag(EpisodeTag::Query)
            .metadata(metadata.as_object().unwrap().clone())
            .build()
            .unwrap();

        assert_eq!(
            episode.tags(),
            vec!["billing", "query", "support desk", "urgent"]
        );
    }

    #[test]
    fn test_searchable_text_includes_saved_memories() {
        let metadata = json!({
            "session": {
                "saved_memories": ["prefers email", {"content": "lives in Berlin"}, 42]
            }
        });
        let episode = Episode::builder()
            .owner("u1")
            .content("hi")
            .metadata(metadata.as_object().unwrap().clone())
            .build()
            .unwrap();

        let text = episode.searchable_text();
        assert!(text.contains("prefers email"));
        assert!(text.contains("lives in Berlin"));
    }

    #[test]
    fn test_patch_metadata_overwrites_keys() {
        let mut episode = Episode::builder()
            .owner("u1")
            .content("hi")
            .build()
            .unwrap();
        let mut patch = Map::new();
        patch.insert("tags".into(), json!(["a"]));
        episode.patch_metadata(patch);
        let mut patch = Map::new();
        patch.insert("tags".into(), json!(["b"]));
        episode.patch_metadata(patch);
        assert_eq!(episode.metadata["tags"], json!(["b"]));
    }

    #[test]
    fn test_fact_episode_dedup_and_other_end() {
        let a = EntityId::new();
        let b = EntityId::new();
        let ep = EpisodeId::new();
        let mut fact = Fact::new("u1", a, b, Relation::new("knows"), "A knows B").with_episode(ep);
        fact.add_episode(ep);
        assert_eq!(fact.episodes.len(), 1);
        assert_eq!(fact.other_end(a), Some(b));
        assert_eq!(fact.other_end(EntityId::new()), None);
    }

    #[test]
    fn test_entity_record_mention() {
        let mut entity = Entity::new("u1", "Alice", EntityType::Person);
        entity.record_mention();
        assert_eq!(entity.mention_count, 2);
        assert_eq!(
            Entity::embedding_text(&entity.name, &entity.entity_type),
            "Alice (person)"
        );
    }
}
