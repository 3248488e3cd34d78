//! Entity deduplication and edge contradiction resolution.
//!
//! Candidates from the extraction pass are matched against the graph
//! one group at a time; resolution never crosses group boundaries.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::embedding::EmbeddingClient;
use crate::error::Result;
use crate::llm::{CandidateEntity, CandidateFact};
use crate::storage::GraphStore;
use crate::types::{normalize_name, Entity, Episode, RelationEdge};

/// Cosine similarity at or above which an existing entity is a dedup
/// candidate.
const SIMILARITY_FLOOR: f32 = 0.85;

/// How many nearest entities to consider per candidate.
const CANDIDATE_K: usize = 5;

/// Outcome of resolving one candidate entity.
#[derive(Debug, Clone)]
pub enum EntityResolution {
    /// No match: a fresh entity was built (not yet persisted).
    Created(Entity),

    /// Matched an existing entity. `updated` is set when the merge
    /// changed attributes or labels.
    Matched { entity: Entity, updated: bool },
}

impl EntityResolution {
    pub fn entity(&self) -> &Entity {
        match self {
            EntityResolution::Created(e) => e,
            EntityResolution::Matched { entity, .. } => entity,
        }
    }
}

/// Outcome of resolving one candidate fact against existing edges.
#[derive(Debug)]
pub enum EdgeResolution {
    /// A new edge (not yet persisted).
    Created(RelationEdge),

    /// Same assertion already present; the citing episode has been
    /// appended to the existing edge.
    Duplicate { edge: RelationEdge },

    /// The fact contradicts existing current edges: they carry a fresh
    /// `invalid_at`, and a new edge was built.
    Contradiction {
        invalidated: Vec<RelationEdge>,
        created: RelationEdge,
    },
}

/// Shallow, deliberately conservative attribute merge: existing keys
/// win unless the incoming value is a longer string containing the
/// existing one. Returns whether anything changed.
pub fn merge_attributes(
    existing: &mut HashMap<String, Value>,
    incoming: &HashMap<String, Value>,
) -> bool {
    let mut changed = false;
    for (key, value) in incoming {
        match existing.get(key) {
            None => {
                existing.insert(key.clone(), value.clone());
                changed = true;
            }
            Some(current) => {
                if let (Some(cur), Some(new)) = (current.as_str(), value.as_str()) {
                    if new.len() > cur.len() && new.contains(cur) {
                        existing.insert(key.clone(), value.clone());
                        changed = true;
                    }
                }
            }
        }
    }
    changed
}

pub struct Resolver {
    store: Arc<dyn GraphStore>,
    embedder: Arc<dyn EmbeddingClient>,
}

impl Resolver {
    pub fn new(store: Arc<dyn GraphStore>, embedder: Arc<dyn EmbeddingClient>) -> Self {
        Resolver { store, embedder }
    }

    /// Resolve a candidate entity within its group: reuse an existing
    /// entity when the name matches exactly or embeds close enough,
    /// otherwise build a new one.
    pub async fn resolve_entity(
        &self,
        group_id: &str,
        candidate: &CandidateEntity,
    ) -> Result<EntityResolution> {
        let embedding = self.embedder.embed(&candidate.name).await?;
        let normalized = normalize_name(&candidate.name);

        // Gather candidates: exact normalized-name matches plus kNN
        // above the similarity floor, same group only.
        let mut matches: Vec<(Entity, f32, bool)> = Vec::new();
        for entity in self.store.entities_by_name(group_id, &normalized).await? {
            matches.push((entity, 1.0, true));
        }
        let groups = [group_id.to_string()];
        for (id, score) in self
            .store
            .entity_knn(&groups, &embedding, CANDIDATE_K)
            .await?
        {
            if score < SIMILARITY_FLOOR {
                continue;
            }
            if matches.iter().any(|(e, _, _)| e.id == id) {
                continue;
            }
            if let Some(entity) = self.store.get_entity(id).await? {
                let exact = normalize_name(&entity.canonical_name) == normalized;
                matches.push((entity, score, exact));
            }
        }

        if matches.is_empty() {
            let mut entity = Entity::new(
                candidate.name.clone(),
                vec![candidate.label.clone()],
                group_id.to_string(),
                embedding,
            );
            entity.attributes = candidate.attributes.clone();
            return Ok(EntityResolution::Created(entity));
        }

        // Exact name beats similarity; similarity ties break toward
        // the oldest entity.
        matches.sort_by(|a, b| {
            b.2.cmp(&a.2)
                .then(b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
                .then(a.0.created_at.cmp(&b.0.created_at))
        });
        let (mut entity, _, _) = matches.into_iter().next().unwrap();

        let mut updated = merge_attributes(&mut entity.attributes, &candidate.attributes);
        if !entity.labels.contains(&candidate.label) {
            entity.labels.push(candidate.label.clone());
            updated = true;
        }
        Ok(EntityResolution::Matched { entity, updated })
    }

    /// Resolve a candidate fact against the edges already connecting
    /// its endpoints. Precedence: contradiction > duplicate > create.
    pub async fn resolve_edge(
        &self,
        episode: &Episode,
        fact: &CandidateFact,
        source: &Entity,
        target: &Entity,
    ) -> Result<EdgeResolution> {
        let now = Utc::now();
        let existing = self.store.edges_between(source.id, target.id).await?;
        let current: Vec<&RelationEdge> = existing
            .iter()
            .filter(|e| e.is_currently_asserted(now))
            .collect();
        let same_relation: Vec<&RelationEdge> = current
            .iter()
            .copied()
            .filter(|e| e.relation_name == fact.relation_name)
            .collect();

        // Contradiction: an explicit negation, or a same-relation fact
        // whose valid time starts strictly later.
        let mut contradicted: Vec<RelationEdge> = Vec::new();
        if fact.negates {
            let targets = if same_relation.is_empty() {
                &current
            } else {
                &same_relation
            };
            contradicted = targets.iter().map(|e| (*e).clone()).collect();
        } else if let Some(valid_at) = fact.valid_at {
            contradicted = same_relation
                .iter()
                .filter(|e| e.valid_at.map(|v| valid_at > v).unwrap_or(false))
                .map(|e| (*e).clone())
                .collect();
        }

        if !contradicted.is_empty() {
            let cutoff = fact.valid_at.unwrap_or(episode.reference_time);
            for edge in &mut contradicted {
                edge.invalid_at = Some(cutoff.max(edge.valid_at.unwrap_or(cutoff)));
            }
            let created = self.build_edge(episode, fact, source, target).await?;
            return Ok(EdgeResolution::Contradiction {
                invalidated: contradicted,
                created,
            });
        }

        // Duplicate: same assertion with no time change. The citing
        // episode joins the edge; a date the edge lacked gets filled.
        if let Some(existing) = same_relation
            .iter()
            .find(|e| fact.valid_at.is_none() || e.valid_at.is_none() || e.valid_at == fact.valid_at)
        {
            let mut edge = (*existing).clone();
            if !edge.episode_ids.contains(&episode.id) {
                edge.episode_ids.push(episode.id);
            }
            if edge.valid_at.is_none() {
                edge.valid_at = fact.valid_at;
            }
            return Ok(EdgeResolution::Duplicate { edge });
        }

        let created = self.build_edge(episode, fact, source, target).await?;
        Ok(EdgeResolution::Created(created))
    }

    async fn build_edge(
        &self,
        episode: &Episode,
        fact: &CandidateFact,
        source: &Entity,
        target: &Entity,
    ) -> Result<RelationEdge> {
        let fact_embedding = self.embedder.embed(&fact.fact).await?;
        let mut edge = RelationEdge::new(
            episode.group_id.clone(),
            source.id,
            target.id,
            fact.relation_name.clone(),
            fact.fact.clone(),
            fact_embedding,
        );
        edge.valid_at = fact.valid_at;
        edge.invalid_at = fact.invalid_at;
        edge.episode_ids.push(episode.id);
        Ok(edge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_keeps_existing_by_default() {
        let mut existing = HashMap::from([("role".to_string(), json!("engineer"))]);
        let incoming = HashMap::from([("role".to_string(), json!("manager"))]);
        assert!(!merge_attributes(&mut existing, &incoming));
        assert_eq!(existing["role"], json!("engineer"));
    }

    #[test]
    fn merge_accepts_longer_superstring() {
        let mut existing = HashMap::from([("role".to_string(), json!("engineer"))]);
        let incoming = HashMap::from([("role".to_string(), json!("senior engineer"))]);
        assert!(merge_attributes(&mut existing, &incoming));
        assert_eq!(existing["role"], json!("senior engineer"));
    }

    #[test]
    fn merge_adds_new_keys() {
        let mut existing = HashMap::new();
        let incoming = HashMap::from([("location".to_string(), json!("Berlin"))]);
        assert!(merge_attributes(&mut existing, &incoming));
        assert_eq!(existing["location"], json!("Berlin"));
    }

    #[test]
    fn merge_ignores_unrelated_longer_value() {
        let mut existing = HashMap::from([("role".to_string(), json!("engineer"))]);
        let incoming = HashMap::from([("role".to_string(), json!("chief data wrangler"))]);
        assert!(!merge_attributes(&mut existing, &incoming));
        assert_eq!(existing["role"], json!("engineer"));
    }

    #[test]
    fn merge_leaves_non_string_values_alone() {
        let mut existing = HashMap::from([("count".to_string(), json!(2))]);
        let incoming = HashMap::from([("count".to_string(), json!(5))]);
        assert!(!merge_attributes(&mut existing, &incoming));
        assert_eq!(existing["count"], json!(2));
    }
}
