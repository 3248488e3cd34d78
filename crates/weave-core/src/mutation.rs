//! Fact updates and cascading deletes.
//!
//! Edge updates are soft: the old edge is expired, a successor edge
//! takes over, and a synthesis episode records the edit so the
//! citation chain stays complete. The service serializes both
//! operations behind the owning group's queue lane.

use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::embedding::EmbeddingClient;
use crate::error::{Result, WeaveError};
use crate::resolver::merge_attributes;
use crate::storage::{CascadeReport, GraphStore};
use crate::types::{EdgeId, EntityId, Episode, EpisodeId, EpisodeKind, Mention, MentionOp};

/// Caller-supplied changes for a soft edge update.
#[derive(Debug, Clone, Default)]
pub struct EdgeUpdate {
    pub fact: String,
    pub source_entity_id: Option<EntityId>,
    pub target_entity_id: Option<EntityId>,
    pub attributes: Option<HashMap<String, Value>>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct EdgeUpdateOutcome {
    pub old_id: EdgeId,
    pub new_id: EdgeId,
}

pub struct MutationService {
    store: Arc<dyn GraphStore>,
    embedder: Arc<dyn EmbeddingClient>,
}

impl MutationService {
    pub fn new(store: Arc<dyn GraphStore>, embedder: Arc<dyn EmbeddingClient>) -> Self {
        MutationService { store, embedder }
    }

    /// Expire `edge_id` and create its successor. The successor keeps
    /// the old edge's valid time, since valid time belongs to the relation
    /// rather than the edit, and cites every original episode plus the
    /// synthesis episode describing the change.
    pub async fn update_edge(
        &self,
        edge_id: EdgeId,
        update: EdgeUpdate,
    ) -> Result<EdgeUpdateOutcome> {
        if update.fact.trim().is_empty() {
            return Err(WeaveError::Validation(
                "Updated fact must not be empty".to_string(),
            ));
        }
        let mut old = self
            .store
            .get_edge(edge_id)
            .await?
            .ok_or(WeaveError::EdgeNotFound(edge_id))?;
        if old.expired_at.is_some() {
            return Err(WeaveError::Validation(format!(
                "Edge {} was already superseded",
                edge_id
            )));
        }

        let source_id = update.source_entity_id.unwrap_or(old.source_entity_id);
        let target_id = update.target_entity_id.unwrap_or(old.target_entity_id);
        for id in [source_id, target_id] {
            if self.store.get_entity(id).await?.is_none() {
                return Err(WeaveError::EntityNotFound(id));
            }
        }

        let now = Utc::now();
        let synthesis = self.synthesis_episode(&old.group_id, &old.fact, &update, edge_id);

        let mut successor = old.clone();
        successor.id = Uuid::now_v7();
        successor.source_entity_id = source_id;
        successor.target_entity_id = target_id;
        successor.fact = update.fact.clone();
        successor.fact_embedding = self.embedder.embed(&update.fact).await?;
        successor.created_at = now;
        successor.expired_at = None;
        successor.episode_ids.push(synthesis.id);
        successor.original_fact = Some(old.fact.clone());
        successor.update_reason = update.reason.clone();
        if let Some(attributes) = &update.attributes {
            merge_attributes(&mut successor.attributes, attributes);
        }

        old.expired_at = Some(now);

        self.store.put_episode(&synthesis).await?;
        for entity_id in [source_id, target_id] {
            self.store
                .put_mention(&Mention::new(
                    old.group_id.clone(),
                    synthesis.id,
                    entity_id,
                    MentionOp::Referenced,
                ))
                .await?;
        }
        self.store.supersede_edge(&old, &successor).await?;

        log::info!(
            "edge {} superseded by {} (synthesis episode {})",
            old.id,
            successor.id,
            synthesis.id
        );
        Ok(EdgeUpdateOutcome {
            old_id: old.id,
            new_id: successor.id,
        })
    }

    /// Cascading episode delete, per the driver contract.
    pub async fn delete_episode(&self, episode_id: EpisodeId) -> Result<CascadeReport> {
        let report = self.store.delete_episode(episode_id).await?;
        log::info!(
            "episode {} deleted: {} mentions, {} edges deleted, {} edges updated, {} entities collected",
            episode_id,
            report.mentions_removed,
            report.edges_deleted,
            report.edges_updated,
            report.entities_deleted,
        );
        Ok(report)
    }

    fn synthesis_episode(
        &self,
        group_id: &str,
        old_fact: &str,
        update: &EdgeUpdate,
        edge_id: EdgeId,
    ) -> Episode {
        let body = json!({
            "operation": "edge_update",
            "edge_id": edge_id,
            "previous_fact": old_fact,
            "new_fact": update.fact,
            "reason": update.reason,
        })
        .to_string();
        Episode::new(
            format!("edge-update-{}", edge_id),
            body,
            EpisodeKind::Structured,
            "weave mutation service".to_string(),
            group_id.to_string(),
        )
    }
}
