pub mod citations;
pub mod config;
pub mod embedding;
pub mod error;
pub mod llm;
pub mod mutation;
pub mod ontology;
pub mod orchestrator;
pub mod queue;
pub mod resolver;
pub mod search;
pub mod service;
pub mod storage;
pub mod testing;
pub mod types;

pub use citations::{extract_source_url, Citation, CitationService};
pub use config::{RetryPolicy, WeaveConfig};
pub use embedding::{
    cosine_similarity, is_degenerate, EmbeddingClient, GatedEmbeddingClient, OpenAiEmbeddingClient,
};
pub use error::{ErrorKind, RetryClass, Result, WeaveError};
pub use llm::{
    CandidateEntity, CandidateFact, EntityExtractionOutcome, EntityExtractionRequest,
    FactExtractionOutcome, FactExtractionRequest, GatedLlmClient, LlmClient, OpenAiLlmClient,
};
pub use mutation::{EdgeUpdate, EdgeUpdateOutcome, MutationService};
pub use ontology::{AttrKind, AttributeSpec, LabelSchema, Ontology};
pub use orchestrator::{IngestReport, IngestionOrchestrator};
pub use queue::{
    EpisodeQueue, EpisodeState, JobContext, JobHandle, JobStatus, QueueConfig, StatusBoard,
};
pub use resolver::{merge_attributes, EdgeResolution, EntityResolution, Resolver};
pub use search::{
    EdgeHit, EpisodeHit, NodeHit, SearchEngine, SearchKind, SearchRequest, SearchResults,
};
pub use service::{EpisodeInput, IngestAck, JobValue, Weave};
pub use storage::{
    CascadeReport, GraphStore, Neighborhood, RedbGraphStore, StoreStats, CURRENT_SCHEMA_VERSION,
};
pub use types::*;

#[cfg(test)]
mod tests;
