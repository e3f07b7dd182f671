//! Bounded, process-local embedding cache in front of the embedding provider.

mod cache;
mod provider;

pub use cache::{CacheEntry, CacheStats, EmbeddingCache};
pub use provider::EmbeddingProvider;

#[cfg(test)]
pub use provider::MockEmbeddingProvider;
