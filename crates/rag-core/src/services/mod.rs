pub mod conversation;
pub mod embedding;
pub mod providers;
pub mod rag_service;
pub mod resilience;

pub use conversation::ConversationManager;
pub use embedding::EmbeddingCache;
pub use rag_service::{RagAnswer, RagService};
pub use resilience::ResiliencePolicy;
