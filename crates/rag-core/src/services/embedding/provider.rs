use anyhow::Result;

/// Turns text into a fixed-length vector.
///
/// Implementations may fail with dependency, rate-limit or timeout errors;
/// returning a [`ClassifiedError`](crate::utils::error::ClassifiedError) inside
/// the `anyhow::Error` keeps its kind intact through the resilience layer.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}
