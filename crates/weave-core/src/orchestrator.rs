//! The per-episode ingestion transaction:
//! extract → resolve → merge → persist, with cancellation observed at
//! phase boundaries until persistence begins.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::embedding::EmbeddingClient;
use crate::error::Result;
use crate::llm::{EntityExtractionRequest, FactExtractionRequest, LlmClient};
use crate::ontology::Ontology;
use crate::queue::{EpisodeState, JobContext};
use crate::resolver::{EdgeResolution, EntityResolution, Resolver};
use crate::storage::GraphStore;
use crate::types::{normalize_name, Entity, Episode, EpisodeId, Mention, MentionOp};

/// How many existing entities to hand the model as reuse context.
const CANDIDATE_CONTEXT_LIMIT: usize = 20;

/// How many recent episodes of the group ride along as context.
const PREVIOUS_EPISODE_CONTEXT: usize = 4;

/// How much of the body feeds the candidate-prefetch embedding.
const PREFETCH_SNIPPET_CHARS: usize = 1024;

/// Counts reported when an episode finishes processing.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub episode_id: EpisodeId,
    pub entities_created: usize,
    pub entities_matched: usize,
    pub mentions_added: usize,
    pub edges_created: usize,
    pub edges_duplicated: usize,
    pub edges_invalidated: usize,
    pub dropped_entities: usize,
    pub dropped_facts: usize,
}

pub struct IngestionOrchestrator {
    store: Arc<dyn GraphStore>,
    llm: Arc<dyn LlmClient>,
    embedder: Arc<dyn EmbeddingClient>,
    ontology: Ontology,
    resolver: Resolver,
}

impl IngestionOrchestrator {
    pub fn new(
        store: Arc<dyn GraphStore>,
        llm: Arc<dyn LlmClient>,
        embedder: Arc<dyn EmbeddingClient>,
        ontology: Ontology,
    ) -> Self {
        let resolver = Resolver::new(store.clone(), embedder.clone());
        IngestionOrchestrator {
            store,
            llm,
            embedder,
            ontology,
            resolver,
        }
    }

    pub async fn process_episode(
        &self,
        episode: &Episode,
        ctx: &JobContext,
    ) -> Result<IngestReport> {
        let mut report = IngestReport {
            episode_id: episode.id,
            ..IngestReport::default()
        };
        ctx.check_cancelled()?;

        // 1. The episode node itself, idempotent on id.
        self.store.put_episode(episode).await?;

        // 2. Prefetch likely-related entities so extraction reuses
        //    existing names instead of minting near-duplicates.
        ctx.progress(EpisodeState::Extracting);
        let snippet: String = episode.body.chars().take(PREFETCH_SNIPPET_CHARS).collect();
        let prefetch_embedding = self.embedder.embed(&snippet).await?;
        let groups = [episode.group_id.clone()];
        let mut known_entities = Vec::new();
        for (id, _) in self
            .store
            .entity_knn(&groups, &prefetch_embedding, CANDIDATE_CONTEXT_LIMIT)
            .await?
        {
            if let Some(entity) = self.store.get_entity(id).await? {
                known_entities.push(entity.canonical_name);
            }
        }

        let previous_episodes: Vec<Episode> = self
            .store
            .recent_episodes(&groups, PREVIOUS_EPISODE_CONTEXT + 1)
            .await?
            .into_iter()
            .filter(|e| e.id != episode.id)
            .take(PREVIOUS_EPISODE_CONTEXT)
            .collect();

        // 3. Entity extraction, then resolution against the group.
        ctx.check_cancelled()?;
        let extraction = self
            .llm
            .extract_entities(EntityExtractionRequest {
                episode,
                known_entities: &known_entities,
                previous_episodes: &previous_episodes,
                ontology: &self.ontology,
            })
            .await?;
        report.dropped_entities = extraction.dropped;

        // Last safe bail-out: nothing derived has been persisted yet.
        ctx.check_cancelled()?;
        ctx.progress(EpisodeState::Resolving);

        let already_mentioned: HashSet<_> = self
            .store
            .mentions_in_episode(episode.id)
            .await?
            .into_iter()
            .map(|m| m.entity_id)
            .collect();

        let mut resolved: HashMap<String, Entity> = HashMap::new();
        for candidate in &extraction.entities {
            let resolution = self
                .resolver
                .resolve_entity(&episode.group_id, candidate)
                .await?;
            let (entity, op) = match resolution {
                EntityResolution::Created(entity) => {
                    report.entities_created += 1;
                    self.store.put_entity(&entity).await?;
                    (entity, MentionOp::Created)
                }
                EntityResolution::Matched { entity, updated } => {
                    report.entities_matched += 1;
                    if updated {
                        self.store.put_entity(&entity).await?;
                    }
                    (
                        entity,
                        if updated {
                            MentionOp::Updated
                        } else {
                            MentionOp::Referenced
                        },
                    )
                }
            };
            if !already_mentioned.contains(&entity.id) {
                self.store
                    .put_mention(&Mention::new(
                        episode.group_id.clone(),
                        episode.id,
                        entity.id,
                        op,
                    ))
                    .await?;
                report.mentions_added += 1;
            }
            resolved.insert(normalize_name(&candidate.name), entity.clone());
            resolved.insert(normalize_name(&entity.canonical_name), entity);
        }

        // 4. Fact extraction over the resolved entity set.
        let entities: Vec<Entity> = {
            let mut seen = HashSet::new();
            resolved
                .values()
                .filter(|e| seen.insert(e.id))
                .cloned()
                .collect()
        };
        let facts = self
            .llm
            .extract_facts(FactExtractionRequest {
                episode,
                entities: &entities,
                previous_episodes: &previous_episodes,
            })
            .await?;
        report.dropped_facts = facts.dropped;

        // 5. Edge resolution and persistence. From here the episode
        //    runs to completion even under cancellation.
        ctx.progress(EpisodeState::Persisting);
        for fact in &facts.facts {
            let (Some(source), Some(target)) = (
                resolved.get(&normalize_name(&fact.source_name)),
                resolved.get(&normalize_name(&fact.target_name)),
            ) else {
                report.dropped_facts += 1;
                continue;
            };
            match self
                .resolver
                .resolve_edge(episode, fact, source, target)
                .await?
            {
                EdgeResolution::Created(edge) => {
                    self.store.put_edge(&edge).await?;
                    report.edges_created += 1;
                }
                EdgeResolution::Duplicate { edge } => {
                    self.store.put_edge(&edge).await?;
                    report.edges_duplicated += 1;
                }
                EdgeResolution::Contradiction {
                    invalidated,
                    created,
                } => {
                    for edge in &invalidated {
                        self.store.put_edge(edge).await?;
                        report.edges_invalidated += 1;
                    }
                    self.store.put_edge(&created).await?;
                    report.edges_created += 1;
                }
            }
        }

        // 6. Completion record.
        log::info!(
            "episode {} ({}) processed: {} entities created, {} matched, {} mentions, \
             {} edges created, {} duplicated, {} invalidated, {} entity items dropped, \
             {} fact items dropped",
            episode.id,
            episode.name,
            report.entities_created,
            report.entities_matched,
            report.mentions_added,
            report.edges_created,
            report.edges_duplicated,
            report.edges_invalidated,
            report.dropped_entities,
            report.dropped_facts,
        );
        Ok(report)
    }
}
