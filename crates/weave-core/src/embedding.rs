use async_openai::{
    config::OpenAIConfig, error::OpenAIError, types::embeddings::CreateEmbeddingRequestArgs,
    Client,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::config::WeaveConfig;
use crate::error::{Result, WeaveError};
use crate::types::Embedding;

/// Produces fixed-dimension vectors for strings.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Embedding>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>>;

    /// Embedding dimensionality. Must match the store's vector indexes.
    fn dimension(&self) -> usize;
}

#[async_trait]
impl<E: EmbeddingClient> EmbeddingClient for Arc<E> {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        (**self).embed(text).await
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        (**self).embed_batch(texts).await
    }
    fn dimension(&self) -> usize {
        (**self).dimension()
    }
}

/// Cosine similarity of two vectors. Zero when either is degenerate.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// An all-zero embedding carries no direction; vector ranking falls
/// back to lexical ordering when a query embeds to this.
pub fn is_degenerate(embedding: &[f32]) -> bool {
    embedding.iter().all(|v| *v == 0.0)
}

/// Map a provider error onto the retry classification.
pub(crate) fn classify_openai_error(err: OpenAIError) -> WeaveError {
    match err {
        OpenAIError::ApiError(api) => {
            let code = api.code.clone().unwrap_or_default();
            let kind = api.r#type.clone().unwrap_or_default();
            if code.contains("rate_limit") || kind.contains("rate_limit") || code == "429" {
                WeaveError::RateLimited(api.message)
            } else if kind.contains("invalid_request") {
                WeaveError::BadLlmOutput(api.message)
            } else {
                WeaveError::Transient(api.message)
            }
        }
        OpenAIError::Reqwest(e) => WeaveError::Transient(e.to_string()),
        OpenAIError::JSONDeserialize(e, _) => WeaveError::BadLlmOutput(e.to_string()),
        other => WeaveError::Transient(other.to_string()),
    }
}

/// Embedding client for any OpenAI-compatible provider.
pub struct OpenAiEmbeddingClient {
    client: Client<OpenAIConfig>,
    model: String,
    dimension: usize,
}

impl OpenAiEmbeddingClient {
    pub fn new(config: &WeaveConfig) -> Self {
        let provider = OpenAIConfig::new()
            .with_api_key(&config.llm_api_key)
            .with_api_base(&config.llm_provider_base_url);
        OpenAiEmbeddingClient {
            client: Client::with_config(provider),
            model: config.embedding_model.clone(),
            dimension: config.vector_dim,
        }
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(text)
            .dimensions(self.dimension as u32)
            .build()
            .map_err(classify_openai_error)?;

        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(classify_openai_error)?;

        response
            .data
            .into_iter()
            .next()
            .map(|e| e.embedding)
            .ok_or_else(|| WeaveError::BadLlmOutput("empty embedding response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(texts.to_vec())
            .dimensions(self.dimension as u32)
            .build()
            .map_err(classify_openai_error)?;

        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(classify_openai_error)?;

        let mut out: Vec<(u32, Embedding)> = response
            .data
            .into_iter()
            .map(|e| (e.index, e.embedding))
            .collect();
        out.sort_by_key(|(index, _)| *index);
        Ok(out.into_iter().map(|(_, e)| e).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Wraps an embedding client with the shared provider-call semaphore
/// and the per-call timeout. Every embedding call in the system goes
/// through one of these.
pub struct GatedEmbeddingClient {
    inner: Arc<dyn EmbeddingClient>,
    gate: Arc<Semaphore>,
    timeout: Duration,
}

impl GatedEmbeddingClient {
    pub fn new(inner: Arc<dyn EmbeddingClient>, gate: Arc<Semaphore>, timeout: Duration) -> Self {
        GatedEmbeddingClient {
            inner,
            gate,
            timeout,
        }
    }
}

#[async_trait]
impl EmbeddingClient for GatedEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| WeaveError::Cancelled)?;
        tokio::time::timeout(self.timeout, self.inner.embed(text))
            .await
            .map_err(|_| WeaveError::Transient("embedding call timed out".to_string()))?
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| WeaveError::Cancelled)?;
        tokio::time::timeout(self.timeout, self.inner.embed_batch(texts))
            .await
            .map_err(|_| WeaveError::Transient("embedding call timed out".to_string()))?
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}
