//! Provenance resolution: which episodes created, updated, or merely
//! referenced a fact or entity.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;

use crate::error::Result;
use crate::storage::GraphStore;
use crate::types::{EntityId, Episode, EpisodeId, EpisodeKind, MentionOp, RelationEdge};

/// One entry in a citation chain.
#[derive(Debug, Clone, Serialize)]
pub struct Citation {
    pub episode_id: EpisodeId,
    pub name: String,
    pub kind: EpisodeKind,
    pub source_description: String,
    pub ingested_at: DateTime<Utc>,
    pub source_url: Option<String>,
    /// Present for entity citations only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<MentionOp>,
}

fn source_url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"source_url:\s*(https?://[^\s,]+)").expect("source_url pattern is valid")
    })
}

/// Pull the first embedded `source_url: <url>` out of a source
/// description. The marker stays in-band for wire compatibility with
/// previously persisted episodes.
pub fn extract_source_url(source_description: &str) -> Option<String> {
    source_url_pattern()
        .captures(source_description)
        .map(|c| c[1].to_string())
}

fn to_citation(episode: &Episode, operation: Option<MentionOp>) -> Citation {
    Citation {
        episode_id: episode.id,
        name: episode.name.clone(),
        kind: episode.kind,
        source_description: episode.source_description.clone(),
        ingested_at: episode.ingested_at,
        source_url: extract_source_url(&episode.source_description),
        operation,
    }
}

pub struct CitationService {
    store: Arc<dyn GraphStore>,
}

impl CitationService {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        CitationService { store }
    }

    /// Citations for an edge: its citing episodes in assertion order.
    pub async fn edge_citations(&self, edge: &RelationEdge) -> Result<Vec<Citation>> {
        let mut out = Vec::with_capacity(edge.episode_ids.len());
        for episode_id in &edge.episode_ids {
            if let Some(episode) = self.store.get_episode(*episode_id).await? {
                out.push(to_citation(&episode, None));
            }
        }
        Ok(out)
    }

    /// Citations for an entity: the episodes that mention it,
    /// deduplicated, tagged with what each did, chronological.
    pub async fn entity_citations(&self, entity_id: EntityId) -> Result<Vec<Citation>> {
        let mentions = self.store.mentions_of_entity(entity_id).await?;

        // One citation per episode; `created` outranks `updated`
        // outranks `referenced` when an episode holds several mentions.
        let mut best: HashMap<EpisodeId, MentionOp> = HashMap::new();
        for mention in mentions {
            best.entry(mention.episode_id)
                .and_modify(|op| {
                    let rank = |o: MentionOp| match o {
                        MentionOp::Created => 0,
                        MentionOp::Updated => 1,
                        MentionOp::Referenced => 2,
                    };
                    if rank(mention.op) < rank(*op) {
                        *op = mention.op;
                    }
                })
                .or_insert(mention.op);
        }

        let mut out = Vec::with_capacity(best.len());
        for (episode_id, op) in best {
            if let Some(episode) = self.store.get_episode(episode_id).await? {
                out.push(to_citation(&episode, Some(op)));
            }
        }
        out.sort_by(|a, b| a.ingested_at.cmp(&b.ingested_at));
        Ok(out)
    }
}
