//! Resilience and short-term state for a stateless RAG request handler.
//!
//! Everything here is process-local: an LRU cache of query embeddings, a
//! session store of recent conversation turns, and the policy that wraps every
//! call to an embedding provider, vector store, LLM or summarizer.

pub mod config;
pub mod services;
pub mod state;
pub mod utils;

pub use config::Settings;
pub use services::conversation::{
    ConversationContext, ConversationManager, ConversationSession, ConversationTurn, Summarizer,
    TruncatingSummarizer,
};
pub use services::embedding::{EmbeddingCache, EmbeddingProvider};
pub use services::providers::{LlmProvider, ScoredDocument, SearchFilters, VectorStore};
pub use services::rag_service::{RagAnswer, RagService};
pub use services::resilience::{PolicyConfig, ResiliencePolicy};
pub use state::{CoreContext, HealthSnapshot};
pub use utils::error::{ClassifiedError, ErrorKind, ErrorResponse};
