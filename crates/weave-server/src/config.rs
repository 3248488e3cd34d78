use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use weave_core::{RetryPolicy, WeaveConfig};

#[derive(Parser, Debug, Clone)]
#[command(name = "weave")]
#[command(about = "Weave temporal knowledge graph service")]
pub struct ServerConfig {
    /// HTTP listen address
    #[arg(long, env = "WEAVE_HTTP_ADDR", default_value = "0.0.0.0:8090")]
    pub http_addr: SocketAddr,

    /// Data directory
    #[arg(long, env = "WEAVE_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Group used when a caller omits one
    #[arg(long, env = "WEAVE_DEFAULT_GROUP_ID", default_value = "default")]
    pub default_group_id: String,

    /// Embedding dimensionality; must match the embedding provider
    #[arg(long, env = "WEAVE_VECTOR_DIM", default_value = "1536")]
    pub vector_dim: usize,

    /// Cross-group concurrency cap (N)
    #[arg(long, env = "WEAVE_MAX_INFLIGHT_EPISODES", default_value = "10")]
    pub max_inflight_episodes: usize,

    /// Global LLM/embedding call parallelism (S)
    #[arg(long, env = "WEAVE_LLM_SEMAPHORE", default_value = "4")]
    pub llm_semaphore: usize,

    /// Minimum gap between dispatches within a group (ms)
    #[arg(long, env = "WEAVE_EPISODE_SPACING_MS", default_value = "0")]
    pub episode_spacing_ms: u64,

    /// Provider retry backoff base (ms)
    #[arg(long, env = "WEAVE_LLM_RETRY_BASE_MS", default_value = "2000")]
    pub llm_retry_base_ms: u64,

    /// Provider retry backoff cap (ms)
    #[arg(long, env = "WEAVE_LLM_RETRY_CAP_MS", default_value = "120000")]
    pub llm_retry_cap_ms: u64,

    /// Provider retry attempts before an episode fails
    #[arg(long, env = "WEAVE_LLM_RETRY_MAX_ATTEMPTS", default_value = "5")]
    pub llm_retry_max_attempts: u32,

    /// Chat model used for extraction
    #[arg(long, env = "WEAVE_LLM_MODEL", default_value = "gpt-4o-mini")]
    pub llm_model: String,

    /// Embedding model
    #[arg(long, env = "WEAVE_EMBEDDING_MODEL", default_value = "text-embedding-3-small")]
    pub embedding_model: String,

    /// OpenAI-compatible provider endpoint
    #[arg(
        long,
        env = "WEAVE_LLM_BASE_URL",
        default_value = "https://api.openai.com/v1"
    )]
    pub llm_provider_base_url: String,

    /// Provider API key
    #[arg(long, env = "WEAVE_LLM_API_KEY", default_value = "", hide_env_values = true)]
    pub llm_api_key: String,
}

impl ServerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)?;
        }
        Ok(())
    }

    pub fn core_config(&self) -> WeaveConfig {
        WeaveConfig {
            data_dir: self.data_dir.clone(),
            default_group_id: self.default_group_id.clone(),
            vector_dim: self.vector_dim,
            max_inflight_episodes: self.max_inflight_episodes,
            llm_semaphore: self.llm_semaphore,
            episode_spacing: Duration::from_millis(self.episode_spacing_ms),
            llm_retry: RetryPolicy {
                base: Duration::from_millis(self.llm_retry_base_ms),
                cap: Duration::from_millis(self.llm_retry_cap_ms),
                max_attempts: self.llm_retry_max_attempts,
            },
            llm_model: self.llm_model.clone(),
            embedding_model: self.embedding_model.clone(),
            llm_provider_base_url: self.llm_provider_base_url.clone(),
            llm_api_key: self.llm_api_key.clone(),
            ..WeaveConfig::default()
        }
    }
}
