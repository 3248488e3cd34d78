//! Deterministic stand-ins for the LLM and embedding providers.
//!
//! Used by the crate's own tests and by downstream integration tests
//! that need ingestion to run without a live provider.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::embedding::EmbeddingClient;
use crate::error::{Result, WeaveError};
use crate::llm::{
    CandidateEntity, CandidateFact, EntityExtractionOutcome, EntityExtractionRequest,
    FactExtractionOutcome, FactExtractionRequest, LlmClient,
};
use crate::types::Embedding;

/// Deterministic embeddings: each token hashes into a handful of
/// buckets, the result is L2-normalized. Equal strings embed equally,
/// so exact-name dedup and kNN behave predictably in tests.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        HashEmbedder { dimension }
    }

    fn embed_sync(&self, text: &str) -> Embedding {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text.to_lowercase().split_whitespace() {
            // Four projections per token: distinct tokens would need to
            // collide in every one to look identical.
            for salt in 0u64..4 {
                let mut hasher = DefaultHasher::new();
                token.hash(&mut hasher);
                salt.hash(&mut hasher);
                let h = hasher.finish();
                let bucket = (h % self.dimension as u64) as usize;
                let sign = if h & (1 << 63) == 0 { 1.0 } else { -1.0 };
                vector[bucket] += sign;
            }
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingClient for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        Ok(self.embed_sync(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// What the scripted model "extracts" for one episode, keyed by
/// episode name.
#[derive(Debug, Clone, Default)]
pub struct EpisodeScript {
    pub entities: Vec<CandidateEntity>,
    pub facts: Vec<CandidateFact>,
}

#[derive(Default)]
struct ScriptState {
    scripts: HashMap<String, EpisodeScript>,
    /// Errors handed out before any extraction succeeds; consumed
    /// front-to-back by entity extraction.
    failures: VecDeque<WeaveError>,
    /// Episode names in the order entity extraction saw them.
    order: Vec<String>,
}

/// A scripted LLM with concurrency accounting, so tests can assert
/// both extraction results and scheduling behavior.
#[derive(Default)]
pub struct ScriptedLlm {
    state: Mutex<ScriptState>,
    running: AtomicUsize,
    max_concurrent: AtomicUsize,
    entity_calls: AtomicUsize,
    fact_calls: AtomicUsize,
    /// Artificial latency per call; gives overlap a window to show up.
    pub latency: Duration,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        ScriptedLlm {
            latency: Duration::from_millis(10),
            ..ScriptedLlm::default()
        }
    }

    pub fn script(&self, episode_name: &str, script: EpisodeScript) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(episode_name.to_string(), script);
    }

    /// Queue an error to be returned by the next entity extraction.
    pub fn push_failure(&self, error: WeaveError) {
        self.state.lock().unwrap().failures.push_back(error);
    }

    pub fn entity_calls(&self) -> usize {
        self.entity_calls.load(Ordering::SeqCst)
    }

    pub fn fact_calls(&self) -> usize {
        self.fact_calls.load(Ordering::SeqCst)
    }

    /// Highest number of extractions observed in flight at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    /// Episode names in the order entity extraction processed them.
    pub fn extraction_order(&self) -> Vec<String> {
        self.state.lock().unwrap().order.clone()
    }

    async fn track<T>(&self, value: T) -> T {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        value
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn extract_entities(
        &self,
        request: EntityExtractionRequest<'_>,
    ) -> Result<EntityExtractionOutcome> {
        self.entity_calls.fetch_add(1, Ordering::SeqCst);
        let failure = {
            let mut state = self.state.lock().unwrap();
            state.order.push(request.episode.name.clone());
            state.failures.pop_front()
        };
        if let Some(error) = failure {
            return self.track(Err(error)).await;
        }
        let entities = self
            .state
            .lock()
            .unwrap()
            .scripts
            .get(&request.episode.name)
            .map(|s| s.entities.clone())
            .unwrap_or_default();
        self.track(Ok(EntityExtractionOutcome {
            entities,
            dropped: 0,
        }))
        .await
    }

    async fn extract_facts(
        &self,
        request: FactExtractionRequest<'_>,
    ) -> Result<FactExtractionOutcome> {
        self.fact_calls.fetch_add(1, Ordering::SeqCst);
        let facts = self
            .state
            .lock()
            .unwrap()
            .scripts
            .get(&request.episode.name)
            .map(|s| s.facts.clone())
            .unwrap_or_default();
        self.track(Ok(FactExtractionOutcome { facts, dropped: 0 }))
            .await
    }
}

/// Script-building shorthand.
pub fn candidate(name: &str, label: &str) -> CandidateEntity {
    CandidateEntity {
        name: name.to_string(),
        label: label.to_string(),
        attributes: HashMap::new(),
    }
}

pub fn fact_between(source: &str, target: &str, relation: &str, text: &str) -> CandidateFact {
    CandidateFact {
        source_name: source.to_string(),
        target_name: target.to_string(),
        relation_name: relation.to_string(),
        fact: text.to_string(),
        valid_at: None,
        invalid_at: None,
        negates: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    #[tokio::test]
    async fn hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::new(32);
        let a = embedder.embed("Alice Smith").await.unwrap();
        let b = embedder.embed("Alice Smith").await.unwrap();
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);

        let c = embedder.embed("completely different words").await.unwrap();
        assert!(cosine_similarity(&a, &c) < 0.9);
    }

    #[tokio::test]
    async fn scripted_llm_replays_and_fails_on_cue() {
        let llm = ScriptedLlm::new();
        llm.script(
            "e1",
            EpisodeScript {
                entities: vec![candidate("Alice", "Person")],
                facts: vec![],
            },
        );
        llm.push_failure(WeaveError::RateLimited("slow".into()));

        let episode = crate::types::Episode::new(
            "e1".into(),
            "body".into(),
            crate::types::EpisodeKind::Text,
            "test".into(),
            "g1".into(),
        );
        let ontology = crate::ontology::Ontology::builtin();
        let request = EntityExtractionRequest {
            episode: &episode,
            known_entities: &[],
            previous_episodes: &[],
            ontology: &ontology,
        };
        assert!(llm.extract_entities(request).await.is_err());

        let request = EntityExtractionRequest {
            episode: &episode,
            known_entities: &[],
            previous_episodes: &[],
            ontology: &ontology,
        };
        let outcome = llm.extract_entities(request).await.unwrap();
        assert_eq!(outcome.entities.len(), 1);
        assert_eq!(llm.entity_calls(), 2);
    }
}
