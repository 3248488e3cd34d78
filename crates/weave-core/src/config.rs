use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, WeaveError};
use crate::ontology::Ontology;

/// Backoff schedule for one class of retryable error.
/// Delay for attempt `k` is `min(base * 2^k, cap)` with jitter applied
/// by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Provider defaults: 2s base, 120s cap, 5 attempts.
    pub fn provider() -> Self {
        RetryPolicy {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(120),
            max_attempts: 5,
        }
    }

    /// Store defaults: same shape, much shorter base.
    pub fn store() -> Self {
        RetryPolicy {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(120),
            max_attempts: 5,
        }
    }

    /// Undithered delay before attempt `k` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
            .unwrap_or(self.cap);
        exp.min(self.cap)
    }
}

/// Explicit configuration record threaded through the service.
/// No process-wide singletons: every component receives what it needs
/// through its constructor.
#[derive(Debug, Clone)]
pub struct WeaveConfig {
    /// Directory holding the graph store file.
    pub data_dir: PathBuf,

    /// Group used when a caller omits one.
    pub default_group_id: String,

    /// Embedding dimensionality. Must match the embedding provider.
    pub vector_dim: usize,

    /// Cross-group concurrency cap (N).
    pub max_inflight_episodes: usize,

    /// Global LLM/embedding call parallelism (S).
    pub llm_semaphore: usize,

    /// Minimum gap between dispatches within a group.
    pub episode_spacing: Duration,

    /// Backoff schedule for provider errors (rate limits, outages).
    pub llm_retry: RetryPolicy,

    /// Backoff schedule for transient store errors.
    pub store_retry: RetryPolicy,

    /// Per-call timeouts. Timeouts classify as transient.
    pub llm_timeout: Duration,
    pub embed_timeout: Duration,
    pub graph_timeout: Duration,

    /// Chat model used for extraction.
    pub llm_model: String,

    /// Embedding model.
    pub embedding_model: String,

    /// OpenAI-compatible provider endpoint.
    pub llm_provider_base_url: String,
    pub llm_api_key: String,

    /// Entity labels and their attribute schemas.
    pub ontology: Ontology,
}

impl Default for WeaveConfig {
    fn default() -> Self {
        WeaveConfig {
            data_dir: PathBuf::from("./data"),
            default_group_id: "default".to_string(),
            vector_dim: 1536,
            max_inflight_episodes: 10,
            llm_semaphore: 4,
            episode_spacing: Duration::ZERO,
            llm_retry: RetryPolicy::provider(),
            store_retry: RetryPolicy::store(),
            llm_timeout: Duration::from_secs(120),
            embed_timeout: Duration::from_secs(30),
            graph_timeout: Duration::from_secs(30),
            llm_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            llm_provider_base_url: "https://api.openai.com/v1".to_string(),
            llm_api_key: String::new(),
            ontology: Ontology::builtin(),
        }
    }
}

impl WeaveConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("weave.redb")
    }

    pub fn validate(&self) -> Result<()> {
        if self.vector_dim == 0 {
            return Err(WeaveError::Validation(
                "vector_dim must be non-zero".to_string(),
            ));
        }
        if self.max_inflight_episodes == 0 {
            return Err(WeaveError::Validation(
                "max_inflight_episodes must be at least 1".to_string(),
            ));
        }
        if self.llm_semaphore == 0 {
            return Err(WeaveError::Validation(
                "llm_semaphore must be at least 1".to_string(),
            ));
        }
        if self.default_group_id.trim().is_empty() {
            return Err(WeaveError::Validation(
                "default_group_id must not be empty".to_string(),
            ));
        }
        if self.llm_retry.max_attempts == 0 || self.store_retry.max_attempts == 0 {
            return Err(WeaveError::Validation(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
