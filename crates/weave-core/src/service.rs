//! The high-level service facade: wires the store, the gated provider
//! clients, the queue, and the read paths together behind one handle.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::config::WeaveConfig;
use crate::embedding::{EmbeddingClient, GatedEmbeddingClient, OpenAiEmbeddingClient};
use crate::error::{Result, WeaveError};
use crate::llm::{GatedLlmClient, LlmClient, OpenAiLlmClient};
use crate::mutation::{EdgeUpdate, EdgeUpdateOutcome, MutationService};
use crate::orchestrator::{IngestReport, IngestionOrchestrator};
use crate::queue::{
    EpisodeQueue, EpisodeState, FailureHook, JobHandle, JobStatus, JobWork, QueueConfig,
};
use crate::search::{SearchEngine, SearchRequest, SearchResults};
use crate::storage::{CascadeReport, GraphStore, RedbGraphStore, StoreStats};
use crate::types::{EdgeId, Episode, EpisodeId, EpisodeKind};

/// Terminal value of a queued job.
#[derive(Debug)]
pub enum JobValue {
    Ingest(IngestReport),
    EdgeUpdated(EdgeUpdateOutcome),
    EpisodeDeleted(CascadeReport),
}

/// Ingest request as accepted from callers.
#[derive(Debug, Clone, Default)]
pub struct EpisodeInput {
    pub name: String,
    pub content: String,
    pub group_id: Option<String>,
    pub kind: Option<EpisodeKind>,
    pub source_description: Option<String>,
    pub source_url: Option<String>,
    pub id: Option<EpisodeId>,
    pub reference_time: Option<DateTime<Utc>>,
}

/// Immediate acknowledgement of an accepted episode. The handle, when
/// present, resolves once processing reaches a terminal state;
/// dropping it detaches the job.
#[derive(Debug)]
pub struct IngestAck {
    pub episode_id: EpisodeId,
    pub name: String,
    pub group_id: String,
    pub handle: Option<JobHandle<JobValue>>,
}

pub struct Weave {
    config: WeaveConfig,
    store: Arc<dyn GraphStore>,
    orchestrator: Arc<IngestionOrchestrator>,
    search: SearchEngine,
    mutation: Arc<MutationService>,
    queue: EpisodeQueue<JobValue>,
}

impl Weave {
    /// Open the embedded store at the configured path and wire the
    /// default OpenAI-compatible provider clients.
    pub async fn open(config: WeaveConfig) -> Result<Self> {
        let llm: Arc<dyn LlmClient> = Arc::new(OpenAiLlmClient::new(&config));
        let embedder: Arc<dyn EmbeddingClient> = Arc::new(OpenAiEmbeddingClient::new(&config));
        Self::open_with_clients(config, llm, embedder).await
    }

    /// Open with caller-supplied provider clients (tests use scripted
    /// ones).
    pub async fn open_with_clients(
        config: WeaveConfig,
        llm: Arc<dyn LlmClient>,
        embedder: Arc<dyn EmbeddingClient>,
    ) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn GraphStore> =
            Arc::new(RedbGraphStore::open(config.db_path(), config.vector_dim)?);
        store.bootstrap().await?;
        Self::with_store(config, store, llm, embedder)
    }

    /// Wire the service around an already-open store.
    pub fn with_store(
        config: WeaveConfig,
        store: Arc<dyn GraphStore>,
        llm: Arc<dyn LlmClient>,
        embedder: Arc<dyn EmbeddingClient>,
    ) -> Result<Self> {
        config.validate()?;

        // Every provider call in the system shares this gate.
        let gate = Arc::new(Semaphore::new(config.llm_semaphore));
        let llm: Arc<dyn LlmClient> = Arc::new(GatedLlmClient::new(
            llm,
            gate.clone(),
            config.llm_timeout,
        ));
        let embedder: Arc<dyn EmbeddingClient> = Arc::new(GatedEmbeddingClient::new(
            embedder,
            gate,
            config.embed_timeout,
        ));

        let orchestrator = Arc::new(IngestionOrchestrator::new(
            store.clone(),
            llm,
            embedder.clone(),
            config.ontology.clone(),
        ));
        let search = SearchEngine::new(store.clone(), embedder.clone());
        let mutation = Arc::new(MutationService::new(store.clone(), embedder));
        let queue = EpisodeQueue::new(QueueConfig {
            max_inflight: config.max_inflight_episodes,
            spacing: config.episode_spacing,
            provider_retry: config.llm_retry,
            store_retry: config.store_retry,
        });

        Ok(Weave {
            config,
            store,
            orchestrator,
            search,
            mutation,
            queue,
        })
    }

    pub fn config(&self) -> &WeaveConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn GraphStore> {
        self.store.clone()
    }

    /// Accept an episode for asynchronous processing. Returns as soon
    /// as the episode is enqueued. Idempotent on a caller-supplied id:
    /// re-submitting an already-stored id acknowledges without
    /// reprocessing.
    pub async fn ingest(&self, input: EpisodeInput) -> Result<IngestAck> {
        if input.name.trim().is_empty() {
            return Err(WeaveError::Validation(
                "Episode name must not be empty".to_string(),
            ));
        }
        if input.content.is_empty() {
            return Err(WeaveError::Validation(
                "Episode content must not be empty".to_string(),
            ));
        }

        let group_id = input
            .group_id
            .filter(|g| !g.trim().is_empty())
            .unwrap_or_else(|| self.config.default_group_id.clone());

        // The source URL stays embedded in the description; the
        // citation service extracts it back out.
        let mut source_description = input.source_description.unwrap_or_default();
        if let Some(url) = &input.source_url {
            source_description = if source_description.is_empty() {
                format!("source_url: {}", url)
            } else {
                format!("{}, source_url: {}", source_description, url)
            };
        }

        if let Some(id) = input.id {
            if let Some(existing) = self.store.get_episode(id).await? {
                return Ok(IngestAck {
                    episode_id: id,
                    name: existing.name,
                    group_id: existing.group_id,
                    handle: None,
                });
            }
        }

        let mut episode = Episode::new(
            input.name,
            input.content,
            input.kind.unwrap_or(EpisodeKind::Text),
            source_description,
            group_id.clone(),
        );
        if let Some(id) = input.id {
            episode = episode.with_id(id);
        }
        if let Some(reference_time) = input.reference_time {
            episode = episode.with_reference_time(reference_time);
        }
        episode.validate().map_err(WeaveError::Validation)?;

        let work: JobWork<JobValue> = {
            let orchestrator = self.orchestrator.clone();
            let episode = episode.clone();
            Arc::new(move |ctx| {
                let orchestrator = orchestrator.clone();
                let episode = episode.clone();
                Box::pin(async move {
                    orchestrator
                        .process_episode(&episode, &ctx)
                        .await
                        .map(JobValue::Ingest)
                })
            })
        };
        // Exhausted episodes stay persisted, flagged, and are never
        // silently reprocessed.
        let on_failure: FailureHook = {
            let store = self.store.clone();
            let episode = episode.clone();
            Arc::new(move |reason| {
                let store = store.clone();
                let mut episode = episode.clone();
                Box::pin(async move {
                    episode.status_note = Some(reason);
                    if let Err(e) = store.put_episode(&episode).await {
                        log::warn!("failed to flag episode {}: {}", episode.id, e);
                    }
                })
            })
        };

        let handle = self
            .queue
            .submit(episode.id, &group_id, work, Some(on_failure));
        Ok(IngestAck {
            episode_id: episode.id,
            name: episode.name,
            group_id,
            handle: Some(handle),
        })
    }

    /// Read-only hybrid search; runs outside the queue.
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResults> {
        self.search.search(request).await
    }

    /// Soft-update an edge's fact, serialized behind the owning
    /// group's lane.
    pub async fn update_edge(
        &self,
        edge_id: EdgeId,
        update: EdgeUpdate,
    ) -> Result<EdgeUpdateOutcome> {
        let edge = self
            .store
            .get_edge(edge_id)
            .await?
            .ok_or(WeaveError::EdgeNotFound(edge_id))?;

        let work: JobWork<JobValue> = {
            let mutation = self.mutation.clone();
            Arc::new(move |_ctx| {
                let mutation = mutation.clone();
                let update = update.clone();
                Box::pin(async move {
                    mutation
                        .update_edge(edge_id, update)
                        .await
                        .map(JobValue::EdgeUpdated)
                })
            })
        };
        match self
            .queue
            .submit(Uuid::now_v7(), &edge.group_id, work, None)
            .wait()
            .await?
        {
            JobValue::EdgeUpdated(outcome) => Ok(outcome),
            _ => Err(WeaveError::Internal(
                "edge update produced a foreign job value".to_string(),
            )),
        }
    }

    /// Cascading episode delete, serialized behind the owning group's
    /// lane.
    pub async fn delete_episode(&self, episode_id: EpisodeId) -> Result<CascadeReport> {
        let episode = self
            .store
            .get_episode(episode_id)
            .await?
            .ok_or(WeaveError::EpisodeNotFound(episode_id))?;

        let work: JobWork<JobValue> = {
            let mutation = self.mutation.clone();
            Arc::new(move |_ctx| {
                let mutation = mutation.clone();
                Box::pin(async move {
                    mutation
                        .delete_episode(episode_id)
                        .await
                        .map(JobValue::EpisodeDeleted)
                })
            })
        };
        match self
            .queue
            .submit(Uuid::now_v7(), &episode.group_id, work, None)
            .wait()
            .await?
        {
            JobValue::EpisodeDeleted(report) => Ok(report),
            _ => Err(WeaveError::Internal(
                "episode delete produced a foreign job value".to_string(),
            )),
        }
    }

    /// Processing state of an episode. Falls back to the store for
    /// episodes whose queue entry predates this process.
    pub async fn episode_status(&self, episode_id: EpisodeId) -> Result<Option<JobStatus>> {
        if let Some(status) = self.queue.status(episode_id) {
            return Ok(Some(status));
        }
        Ok(self.store.get_episode(episode_id).await?.map(|episode| {
            let failed = episode.status_note.is_some();
            JobStatus {
                state: if failed {
                    EpisodeState::Failed
                } else {
                    EpisodeState::Done
                },
                attempts: 0,
                error: episode.status_note,
                updated_at: episode.ingested_at,
            }
        }))
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.store.stats().await
    }

    /// Stop dispatching queued work. Running jobs finish.
    pub fn close(&self) {
        self.queue.close();
    }
}
