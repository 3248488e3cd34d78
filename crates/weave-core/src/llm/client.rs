use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::error::{Result, WeaveError};
use crate::ontology::Ontology;
use crate::types::{Entity, Episode};

/// A candidate entity emitted by the extraction pass, validated
/// against the ontology and ready for resolution.
#[derive(Debug, Clone)]
pub struct CandidateEntity {
    pub name: String,
    pub label: String,
    pub attributes: HashMap<String, Value>,
}

/// A candidate fact emitted by the extraction pass.
#[derive(Debug, Clone)]
pub struct CandidateFact {
    pub source_name: String,
    pub target_name: String,
    pub relation_name: String,
    pub fact: String,
    pub valid_at: Option<DateTime<Utc>>,
    pub invalid_at: Option<DateTime<Utc>>,
    /// The model judged this fact to negate an existing relation
    /// between the same entities.
    pub negates: bool,
}

/// Validated extraction results plus the number of malformed items
/// that were dropped on the way. Dropped items never fail the episode.
#[derive(Debug, Clone, Default)]
pub struct EntityExtractionOutcome {
    pub entities: Vec<CandidateEntity>,
    pub dropped: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FactExtractionOutcome {
    pub facts: Vec<CandidateFact>,
    pub dropped: usize,
}

/// Context handed to entity extraction: the episode, names the graph
/// already knows (so the model reuses them), recent episodes of the
/// group, and the ontology.
pub struct EntityExtractionRequest<'a> {
    pub episode: &'a Episode,
    pub known_entities: &'a [String],
    pub previous_episodes: &'a [Episode],
    pub ontology: &'a Ontology,
}

/// Context handed to fact extraction: the episode and the entities
/// resolved from it.
pub struct FactExtractionRequest<'a> {
    pub episode: &'a Episode,
    pub entities: &'a [Entity],
    pub previous_episodes: &'a [Episode],
}

/// Extracts entities and facts from episode text. Rate-limited
/// collaborator: implementations surface `RateLimited` / `Transient` /
/// `BadLlmOutput` and the queue decides what to do about it.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn extract_entities(
        &self,
        request: EntityExtractionRequest<'_>,
    ) -> Result<EntityExtractionOutcome>;

    async fn extract_facts(
        &self,
        request: FactExtractionRequest<'_>,
    ) -> Result<FactExtractionOutcome>;
}

/// Wraps an LLM client with the shared provider-call semaphore and the
/// per-call timeout.
pub struct GatedLlmClient {
    inner: Arc<dyn LlmClient>,
    gate: Arc<Semaphore>,
    timeout: Duration,
}

impl GatedLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, gate: Arc<Semaphore>, timeout: Duration) -> Self {
        GatedLlmClient {
            inner,
            gate,
            timeout,
        }
    }
}

#[async_trait]
impl LlmClient for GatedLlmClient {
    async fn extract_entities(
        &self,
        request: EntityExtractionRequest<'_>,
    ) -> Result<EntityExtractionOutcome> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| WeaveError::Cancelled)?;
        tokio::time::timeout(self.timeout, self.inner.extract_entities(request))
            .await
            .map_err(|_| WeaveError::Transient("entity extraction timed out".to_string()))?
    }

    async fn extract_facts(
        &self,
        request: FactExtractionRequest<'_>,
    ) -> Result<FactExtractionOutcome> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| WeaveError::Cancelled)?;
        tokio::time::timeout(self.timeout, self.inner.extract_facts(request))
            .await
            .map_err(|_| WeaveError::Transient("fact extraction timed out".to_string()))?
    }
}
