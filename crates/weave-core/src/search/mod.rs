//! Hybrid search over edges, nodes, and episodes.
//!
//! Edges and nodes fuse a vector candidate list and a lexical
//! candidate list with RRF, optionally re-ranked by graph proximity to
//! a center node. Episodes are lexical only.

pub mod rrf;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::citations::{Citation, CitationService};
use crate::embedding::{is_degenerate, EmbeddingClient};
use crate::error::Result;
use crate::storage::GraphStore;
use crate::types::{Entity, EntityId, Episode, RelationEdge};

use rrf::{rrf_fuse, RRF_K};

/// Beyond this many hops from the center node a candidate is dropped.
const MAX_CENTER_HOPS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchKind {
    Edges,
    Nodes,
    Episodes,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub kind: SearchKind,
    pub max_results: usize,
    pub group_ids: Vec<String>,
    /// Nodes only: keep results carrying at least one of these labels.
    pub labels: Vec<String>,
    /// Edges only: re-rank by proximity to this entity.
    pub center_entity_id: Option<EntityId>,
    /// Include soft-updated (expired) edges.
    pub include_expired: bool,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, kind: SearchKind) -> Self {
        SearchRequest {
            query: query.into(),
            kind,
            max_results: 10,
            group_ids: Vec::new(),
            labels: Vec::new(),
            center_entity_id: None,
            include_expired: false,
        }
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    pub fn with_groups(mut self, group_ids: Vec<String>) -> Self {
        self.group_ids = group_ids;
        self
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_center(mut self, center: EntityId) -> Self {
        self.center_entity_id = Some(center);
        self
    }

    pub fn with_expired(mut self) -> Self {
        self.include_expired = true;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeHit {
    #[serde(flatten)]
    pub edge: RelationEdge,
    pub score: f64,
    pub citations: Vec<Citation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeHit {
    #[serde(flatten)]
    pub entity: Entity,
    pub score: f64,
    pub citations: Vec<Citation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EpisodeHit {
    #[serde(flatten)]
    pub episode: Episode,
    pub score: f64,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum SearchResults {
    Edges(Vec<EdgeHit>),
    Nodes(Vec<NodeHit>),
    Episodes(Vec<EpisodeHit>),
}

impl SearchResults {
    pub fn len(&self) -> usize {
        match self {
            SearchResults::Edges(v) => v.len(),
            SearchResults::Nodes(v) => v.len(),
            SearchResults::Episodes(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct SearchEngine {
    store: Arc<dyn GraphStore>,
    embedder: Arc<dyn EmbeddingClient>,
    citations: CitationService,
}

impl SearchEngine {
    pub fn new(store: Arc<dyn GraphStore>, embedder: Arc<dyn EmbeddingClient>) -> Self {
        let citations = CitationService::new(store.clone());
        SearchEngine {
            store,
            embedder,
            citations,
        }
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResults> {
        match request.kind {
            SearchKind::Edges => Ok(SearchResults::Edges(self.search_edges(request).await?)),
            SearchKind::Nodes => Ok(SearchResults::Nodes(self.search_nodes(request).await?)),
            SearchKind::Episodes => {
                Ok(SearchResults::Episodes(self.search_episodes(request).await?))
            }
        }
    }

    /// Vector + lexical candidates for the query, each ranked best
    /// first. A degenerate query embedding yields no vector list, so
    /// fusion degrades to lexical ordering alone.
    async fn candidate_lists(
        &self,
        request: &SearchRequest,
        edges: bool,
    ) -> Result<(Vec<Uuid>, Vec<Uuid>, HashMap<Uuid, f32>)> {
        let fetch = request.max_results * 2;
        let mut vector_scores = HashMap::new();

        let vector_list = if request.query.trim().is_empty() {
            Vec::new()
        } else {
            let query_embedding = self.embedder.embed(&request.query).await?;
            if is_degenerate(&query_embedding) {
                Vec::new()
            } else {
                let hits = if edges {
                    self.store
                        .edge_knn(&request.group_ids, &query_embedding, fetch)
                        .await?
                } else {
                    self.store
                        .entity_knn(&request.group_ids, &query_embedding, fetch)
                        .await?
                };
                hits.into_iter()
                    .map(|(id, score)| {
                        vector_scores.insert(id, score);
                        id
                    })
                    .collect()
            }
        };

        let lexical_list: Vec<Uuid> = if edges {
            self.store
                .edge_lexical(&request.group_ids, &request.query, fetch)
                .await?
        } else {
            self.store
                .entity_lexical(&request.group_ids, &request.query, fetch)
                .await?
        }
        .into_iter()
        .map(|(id, _)| id)
        .collect();

        Ok((vector_list, lexical_list, vector_scores))
    }

    /// Order fused candidates: score descending, ties by vector score
    /// then recency.
    fn order_fused(
        scores: &HashMap<Uuid, f64>,
        vector_scores: &HashMap<Uuid, f32>,
        created_at: impl Fn(&Uuid) -> chrono::DateTime<chrono::Utc>,
    ) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = scores.keys().copied().collect();
        ids.sort_by(|a, b| {
            scores[b]
                .partial_cmp(&scores[a])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let va = vector_scores.get(a).copied().unwrap_or(0.0);
                    let vb = vector_scores.get(b).copied().unwrap_or(0.0);
                    vb.partial_cmp(&va).unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| created_at(b).cmp(&created_at(a)))
        });
        ids
    }

    pub async fn search_edges(&self, request: &SearchRequest) -> Result<Vec<EdgeHit>> {
        if request.max_results == 0 {
            return Ok(Vec::new());
        }
        let (vector_list, lexical_list, vector_scores) =
            self.candidate_lists(request, true).await?;

        let mut scores = rrf_fuse(&[vector_list, lexical_list], RRF_K);

        // Load candidates; drop expired edges unless asked for history.
        let mut edges: HashMap<Uuid, RelationEdge> = HashMap::new();
        for id in scores.keys().copied().collect::<Vec<_>>() {
            match self.store.get_edge(id).await? {
                Some(edge) if request.include_expired || edge.expired_at.is_none() => {
                    edges.insert(id, edge);
                }
                _ => {
                    scores.remove(&id);
                }
            }
        }

        // Proximity re-rank around the center node: factor 1/(1+hops),
        // candidates beyond the hop cap are dropped.
        if let Some(center) = request.center_entity_id {
            let hood = self.store.neighborhood(center, MAX_CENTER_HOPS).await?;
            scores.retain(|id, score| {
                let Some(edge) = edges.get(id) else {
                    return false;
                };
                let hops = [edge.source_entity_id, edge.target_entity_id]
                    .iter()
                    .filter_map(|e| hood.hops.get(e))
                    .min()
                    .copied();
                match hops {
                    Some(h) => {
                        *score *= 1.0 / (1.0 + h as f64);
                        true
                    }
                    None => false,
                }
            });
        }

        let ordered = Self::order_fused(&scores, &vector_scores, |id| edges[id].created_at);

        let mut out = Vec::new();
        for id in ordered.into_iter().take(request.max_results) {
            let Some(edge) = edges.remove(&id) else {
                continue;
            };
            let citations = self.citations.edge_citations(&edge).await?;
            out.push(EdgeHit {
                score: scores[&id],
                edge,
                citations,
            });
        }
        Ok(out)
    }

    pub async fn search_nodes(&self, request: &SearchRequest) -> Result<Vec<NodeHit>> {
        if request.max_results == 0 {
            return Ok(Vec::new());
        }
        let (vector_list, lexical_list, vector_scores) =
            self.candidate_lists(request, false).await?;

        let mut scores = rrf_fuse(&[vector_list, lexical_list], RRF_K);

        let mut entities: HashMap<Uuid, Entity> = HashMap::new();
        for id in scores.keys().copied().collect::<Vec<_>>() {
            match self.store.get_entity(id).await? {
                Some(entity) => {
                    entities.insert(id, entity);
                }
                None => {
                    scores.remove(&id);
                }
            }
        }

        // Label filter applies after fusion.
        if !request.labels.is_empty() {
            scores.retain(|id, _| {
                entities
                    .get(id)
                    .map(|e| e.labels.iter().any(|l| request.labels.contains(l)))
                    .unwrap_or(false)
            });
        }

        let ordered = Self::order_fused(&scores, &vector_scores, |id| entities[id].created_at);

        let mut out = Vec::new();
        for id in ordered.into_iter().take(request.max_results) {
            let Some(entity) = entities.remove(&id) else {
                continue;
            };
            let citations = self.citations.entity_citations(entity.id).await?;
            out.push(NodeHit {
                score: scores[&id],
                entity,
                citations,
            });
        }
        Ok(out)
    }

    /// Lexical only. An empty query lists the group's most recent
    /// episodes instead.
    pub async fn search_episodes(&self, request: &SearchRequest) -> Result<Vec<EpisodeHit>> {
        if request.max_results == 0 {
            return Ok(Vec::new());
        }
        if request.query.trim().is_empty() {
            let episodes = self
                .store
                .recent_episodes(&request.group_ids, request.max_results)
                .await?;
            return Ok(episodes
                .into_iter()
                .map(|episode| EpisodeHit {
                    episode,
                    score: 0.0,
                })
                .collect());
        }

        let ranked = self
            .store
            .episode_lexical(&request.group_ids, &request.query, request.max_results)
            .await?;
        let mut out = Vec::new();
        for (id, score) in ranked {
            if let Some(episode) = self.store.get_episode(id).await? {
                out.push(EpisodeHit {
                    episode,
                    score: score as f64,
                });
            }
        }
        Ok(out)
    }
}
