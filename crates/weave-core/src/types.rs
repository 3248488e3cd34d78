use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Type alias for episode identifiers
pub type EpisodeId = Uuid;

/// Type alias for entity identifiers
pub type EntityId = Uuid;

/// Type alias for relation edge identifiers
pub type EdgeId = Uuid;

/// Type alias for mention identifiers
pub type MentionId = Uuid;

/// Type alias for embedding vectors
pub type Embedding = Vec<f32>;

/// How an episode's body should be interpreted
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeKind {
    /// Free-form prose. The default.
    Text,

    /// A structured record (JSON or similar) rendered as text.
    Structured,

    /// One or more turns of a conversation, speaker-prefixed.
    Conversation,
}

impl EpisodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EpisodeKind::Text => "text",
            EpisodeKind::Structured => "structured",
            EpisodeKind::Conversation => "conversation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(EpisodeKind::Text),
            "structured" => Some(EpisodeKind::Structured),
            "conversation" => Some(EpisodeKind::Conversation),
            _ => None,
        }
    }
}

/// A unit of ingested information. The sole source of truth for all
/// derived graph content: entities and edges always point back at the
/// episodes that asserted them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Episode {
    /// Unique identifier. UUIDv7 for time-sortability.
    pub id: EpisodeId,

    /// Human-readable name. Unique within a group in practice, used by
    /// `(group_id, name)` lookups.
    pub name: String,

    /// The raw ingested content. Immutable after creation.
    pub body: String,

    /// How the body should be read.
    pub kind: EpisodeKind,

    /// Free-form description of where this came from. May carry an
    /// embedded `source_url: <url>` marker (kept in-band for wire
    /// compatibility with previously persisted data).
    pub source_description: String,

    /// Namespace. Episodes are strictly ordered within a group.
    pub group_id: String,

    /// System time: when the episode entered the graph.
    pub ingested_at: DateTime<Utc>,

    /// Valid time: when the described events occurred.
    /// Defaults to `ingested_at` when the caller doesn't know better.
    pub reference_time: DateTime<Utc>,

    /// Set when extraction ultimately failed for this episode.
    /// The episode stays persisted; it is never silently reprocessed.
    pub status_note: Option<String>,
}

impl Episode {
    pub fn new(
        name: String,
        body: String,
        kind: EpisodeKind,
        source_description: String,
        group_id: String,
    ) -> Self {
        let now = Utc::now();
        Episode {
            id: Uuid::now_v7(),
            name,
            body,
            kind,
            source_description,
            group_id,
            ingested_at: now,
            reference_time: now,
            status_note: None,
        }
    }

    pub fn with_id(mut self, id: EpisodeId) -> Self {
        self.id = id;
        self
    }

    pub fn with_reference_time(mut self, at: DateTime<Utc>) -> Self {
        self.reference_time = at;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Episode name must not be empty".to_string());
        }
        if self.body.is_empty() {
            return Err("Episode body must not be empty".to_string());
        }
        if self.group_id.trim().is_empty() {
            return Err("Episode group_id must not be empty".to_string());
        }
        Ok(())
    }
}

/// A deduplicated noun-like concept extracted from one or more episodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    /// Unique identifier. UUIDv7.
    pub id: EntityId,

    /// The resolved display name. `(normalized name, primary label)` is
    /// the deduplication key within a group.
    pub canonical_name: String,

    /// Model-authored running summary of what is known about the entity.
    pub summary: String,

    /// Ontology tags. The first entry is the primary label.
    pub labels: Vec<String>,

    /// Typed key/value bag, validated against the primary label's
    /// attribute schema.
    pub attributes: HashMap<String, Value>,

    /// Embedding of the canonical name, used for dedup and node search.
    pub embedding: Embedding,

    /// System time the entity was first created.
    pub created_at: DateTime<Utc>,

    /// Namespace. Resolution never crosses group boundaries.
    pub group_id: String,
}

impl Entity {
    pub fn new(
        canonical_name: String,
        labels: Vec<String>,
        group_id: String,
        embedding: Embedding,
    ) -> Self {
        Entity {
            id: Uuid::now_v7(),
            canonical_name,
            summary: String::new(),
            labels,
            attributes: HashMap::new(),
            embedding,
            created_at: Utc::now(),
            group_id,
        }
    }

    /// The primary ontology label. Entities always carry at least one.
    pub fn primary_label(&self) -> &str {
        self.labels.first().map(String::as_str).unwrap_or("Entity")
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.canonical_name.trim().is_empty() {
            return Err("Entity name must not be empty".to_string());
        }
        if self.labels.is_empty() {
            return Err("Entity must carry at least one label".to_string());
        }
        Ok(())
    }
}

/// A directed, named relation between two entities, with the
/// bi-temporal interval that makes contradiction handling and
/// time-travel queries possible.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelationEdge {
    /// Unique identifier. UUIDv7.
    pub id: EdgeId,

    /// Namespace, copied from the asserting episode.
    pub group_id: String,

    /// Source entity.
    pub source_entity_id: EntityId,

    /// Target entity.
    pub target_entity_id: EntityId,

    /// Relation name, e.g. `works_at`.
    pub relation_name: String,

    /// Natural-language rendering of the relation.
    pub fact: String,

    /// Embedding of `fact`, used for edge search.
    pub fact_embedding: Embedding,

    /// System time: when this edge was added to the graph.
    pub created_at: DateTime<Utc>,

    /// Valid time: when the stated relation began to hold. Optional;
    /// many facts arrive without a date.
    pub valid_at: Option<DateTime<Utc>>,

    /// Valid time: when a later episode asserted the relation ceased.
    pub invalid_at: Option<DateTime<Utc>>,

    /// System time: when this edge was superseded via soft-update.
    /// A set `expired_at` always has a successor edge.
    pub expired_at: Option<DateTime<Utc>>,

    /// The episodes that assert or updated this edge, in assertion
    /// order. Never empty: deleting the last episode deletes the edge.
    pub episode_ids: Vec<EpisodeId>,

    /// Free-form attributes attached by the update path.
    pub attributes: HashMap<String, Value>,

    /// Previous rendering of the fact, populated by soft-update.
    pub original_fact: Option<String>,

    /// Caller-provided reason for the last soft-update.
    pub update_reason: Option<String>,
}

impl RelationEdge {
    pub fn new(
        group_id: String,
        source_entity_id: EntityId,
        target_entity_id: EntityId,
        relation_name: String,
        fact: String,
        fact_embedding: Embedding,
    ) -> Self {
        RelationEdge {
            id: Uuid::now_v7(),
            group_id,
            source_entity_id,
            target_entity_id,
            relation_name,
            fact,
            fact_embedding,
            created_at: Utc::now(),
            valid_at: None,
            invalid_at: None,
            expired_at: None,
            episode_ids: Vec::new(),
            attributes: HashMap::new(),
            original_fact: None,
            update_reason: None,
        }
    }

    /// An edge is currently asserted iff it has not been superseded and
    /// its valid interval has not closed in the past.
    pub fn is_currently_asserted(&self, now: DateTime<Utc>) -> bool {
        self.expired_at.is_none() && self.invalid_at.map(|t| t > now).unwrap_or(true)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.relation_name.trim().is_empty() {
            return Err("Edge relation_name must not be empty".to_string());
        }
        if self.episode_ids.is_empty() {
            return Err("Edge must cite at least one episode".to_string());
        }
        if let (Some(valid), Some(invalid)) = (self.valid_at, self.invalid_at) {
            if valid > invalid {
                return Err(format!(
                    "Edge valid_at {} is after invalid_at {}",
                    valid, invalid
                ));
            }
        }
        Ok(())
    }
}

/// The operation an episode performed on an entity, recorded at
/// mention time so node citations need no reconstruction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MentionOp {
    /// The episode caused the entity to be created.
    Created,

    /// Processing the episode changed the entity's attributes or summary.
    Updated,

    /// The episode merely referenced the entity.
    Referenced,
}

impl MentionOp {
    pub fn as_str(self) -> &'static str {
        match self {
            MentionOp::Created => "created",
            MentionOp::Updated => "updated",
            MentionOp::Referenced => "referenced",
        }
    }
}

/// A provenance link from an episode to an entity it references.
/// Carries no time interval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mention {
    pub id: MentionId,
    pub group_id: String,
    pub episode_id: EpisodeId,
    pub entity_id: EntityId,
    pub op: MentionOp,
    pub created_at: DateTime<Utc>,
}

impl Mention {
    pub fn new(group_id: String, episode_id: EpisodeId, entity_id: EntityId, op: MentionOp) -> Self {
        Mention {
            id: Uuid::now_v7(),
            group_id,
            episode_id,
            entity_id,
            op,
            created_at: Utc::now(),
        }
    }
}

/// Normalize an entity name for exact-match deduplication:
/// lowercase, whitespace collapsed to single spaces, trimmed.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn normalize_collapses_case_and_whitespace() {
        assert_eq!(normalize_name("  Alice   SMITH "), "alice smith");
        assert_eq!(normalize_name("Acme"), "acme");
    }

    #[test]
    fn edge_asserted_predicate() {
        let now = Utc::now();
        let mut edge = RelationEdge::new(
            "g".into(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            "works_at".into(),
            "Alice works at Acme".into(),
            vec![0.0; 4],
        );
        edge.episode_ids.push(Uuid::now_v7());
        assert!(edge.is_currently_asserted(now));

        // Future invalidation leaves it asserted today.
        edge.invalid_at = Some(now + Duration::days(30));
        assert!(edge.is_currently_asserted(now));

        // Past invalidation closes it.
        edge.invalid_at = Some(now - Duration::days(1));
        assert!(!edge.is_currently_asserted(now));

        // Expiry always closes it.
        edge.invalid_at = None;
        edge.expired_at = Some(now);
        assert!(!edge.is_currently_asserted(now));
    }

    #[test]
    fn edge_interval_ordering_enforced() {
        let now = Utc::now();
        let mut edge = RelationEdge::new(
            "g".into(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            "works_at".into(),
            "fact".into(),
            vec![],
        );
        edge.episode_ids.push(Uuid::now_v7());
        edge.valid_at = Some(now);
        edge.invalid_at = Some(now - Duration::days(1));
        assert!(edge.validate().is_err());

        edge.invalid_at = Some(now + Duration::days(1));
        assert!(edge.validate().is_ok());
    }

    #[test]
    fn edge_requires_citation() {
        let edge = RelationEdge::new(
            "g".into(),
            Uuid::now_v7(),
            Uuid::now_v7(),
            "works_at".into(),
            "fact".into(),
            vec![],
        );
        assert!(edge.validate().is_err());
    }

    #[test]
    fn episode_kind_round_trip() {
        for kind in [
            EpisodeKind::Text,
            EpisodeKind::Structured,
            EpisodeKind::Conversation,
        ] {
            assert_eq!(EpisodeKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EpisodeKind::parse("video"), None);
    }
}
