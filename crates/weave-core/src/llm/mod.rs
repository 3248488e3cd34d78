pub mod client;
pub mod openai;
pub mod prompts;

pub use client::{
    CandidateEntity, CandidateFact, EntityExtractionOutcome, EntityExtractionRequest,
    FactExtractionOutcome, FactExtractionRequest, GatedLlmClient, LlmClient,
};
pub use openai::OpenAiLlmClient;
