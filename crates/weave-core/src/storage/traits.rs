use async_trait::async_trait;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{
    EdgeId, Embedding, Entity, EntityId, Episode, EpisodeId, Mention, RelationEdge,
};

/// Entities reachable from a center node within a hop limit, plus the
/// edges connecting them. Hops are shortest-path distances.
#[derive(Debug, Clone, Default)]
pub struct Neighborhood {
    pub hops: HashMap<EntityId, u32>,
    pub edges: Vec<RelationEdge>,
}

/// What a cascading episode delete removed.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CascadeReport {
    pub episode_id: Uuid,
    pub mentions_removed: usize,
    pub edges_updated: usize,
    pub edges_deleted: usize,
    pub entities_deleted: usize,
}

/// Store-wide counts for the stats surface.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StoreStats {
    pub episode_count: u64,
    pub entity_count: u64,
    pub edge_count: u64,
    pub mention_count: u64,
    pub expired_edge_count: u64,
}

/// The graph store driver contract. An opaque adapter over whatever
/// holds the graph; the default backend is embedded redb.
///
/// The driver guarantees read-after-write consistency within a single
/// logical request. It is not transactional across requests; that
/// serialization belongs to the episode queue.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Create tables/indices and verify the schema version. Run once at
    /// startup.
    async fn bootstrap(&self) -> Result<()>;

    // === Episodes ===

    /// Atomic create-or-replace by id.
    async fn put_episode(&self, episode: &Episode) -> Result<()>;

    async fn get_episode(&self, id: EpisodeId) -> Result<Option<Episode>>;

    async fn episode_by_name(&self, group_id: &str, name: &str) -> Result<Option<Episode>>;

    /// Most recent episodes of a group by `ingested_at` descending.
    async fn recent_episodes(&self, group_ids: &[String], limit: usize) -> Result<Vec<Episode>>;

    /// Lexical ranking over episode names and bodies.
    async fn episode_lexical(
        &self,
        group_ids: &[String],
        query: &str,
        k: usize,
    ) -> Result<Vec<(EpisodeId, f32)>>;

    /// Cascading delete: the episode, its mentions, edges left with no
    /// citing episode, and entities left with no incident edge or
    /// mention.
    async fn delete_episode(&self, id: EpisodeId) -> Result<CascadeReport>;

    // === Entities ===

    /// Atomic create-or-replace by id.
    async fn put_entity(&self, entity: &Entity) -> Result<()>;

    async fn get_entity(&self, id: EntityId) -> Result<Option<Entity>>;

    /// Exact match on normalized name within a group. Used by dedup.
    async fn entities_by_name(&self, group_id: &str, normalized: &str) -> Result<Vec<Entity>>;

    /// Vector kNN over entity embeddings within a group.
    async fn entity_knn(
        &self,
        group_ids: &[String],
        query: &Embedding,
        k: usize,
    ) -> Result<Vec<(EntityId, f32)>>;

    /// Lexical ranking over entity names and summaries.
    async fn entity_lexical(
        &self,
        group_ids: &[String],
        query: &str,
        k: usize,
    ) -> Result<Vec<(EntityId, f32)>>;

    async fn delete_entity(&self, id: EntityId) -> Result<()>;

    // === Relation edges ===

    /// Atomic create-or-replace by id.
    async fn put_edge(&self, edge: &RelationEdge) -> Result<()>;

    /// Expire one edge and create its successor in a single atomic
    /// step, so searches never observe the half-applied update.
    async fn supersede_edge(&self, expired: &RelationEdge, successor: &RelationEdge) -> Result<()>;

    async fn get_edge(&self, id: EdgeId) -> Result<Option<RelationEdge>>;

    /// All edges between an ordered endpoint pair.
    async fn edges_between(&self, source: EntityId, target: EntityId)
        -> Result<Vec<RelationEdge>>;

    /// All edges incident to an entity, either direction.
    async fn edges_for_entity(&self, id: EntityId) -> Result<Vec<RelationEdge>>;

    /// Vector kNN over edge fact embeddings.
    async fn edge_knn(
        &self,
        group_ids: &[String],
        query: &Embedding,
        k: usize,
    ) -> Result<Vec<(EdgeId, f32)>>;

    /// Lexical ranking over edge facts.
    async fn edge_lexical(
        &self,
        group_ids: &[String],
        query: &str,
        k: usize,
    ) -> Result<Vec<(EdgeId, f32)>>;

    async fn delete_edge(&self, id: EdgeId) -> Result<()>;

    // === Mentions ===

    async fn put_mention(&self, mention: &Mention) -> Result<()>;

    async fn mentions_of_entity(&self, id: EntityId) -> Result<Vec<Mention>>;

    async fn mentions_in_episode(&self, id: EpisodeId) -> Result<Vec<Mention>>;

    // === Traversal ===

    /// Entities within `max_hops` of `center` and the edges connecting
    /// them. Expired edges do not contribute to reachability.
    async fn neighborhood(&self, center: EntityId, max_hops: u32) -> Result<Neighborhood>;

    // === Maintenance ===

    async fn stats(&self) -> Result<StoreStats>;
}
