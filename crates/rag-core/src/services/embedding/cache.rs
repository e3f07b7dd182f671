use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::provider::EmbeddingProvider;
use crate::services::resilience::ResiliencePolicy;
use crate::utils::error::ClassifiedError;
use crate::utils::fingerprint::{fingerprint, normalize_text};

/// One cached embedding.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub vector: Vec<f32>,
    pub last_access_time: Instant,
    /// Observability only; eviction ignores it.
    pub access_count: u64,
    recency: u64,
}

/// Cache statistics for health endpoints
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub capacity: usize,
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

/// Map plus recency index, guarded together by one lock.
#[derive(Default)]
struct LruState {
    entries: HashMap<String, CacheEntry>,
    /// recency tick -> key; the first entry is the eviction victim.
    recency: BTreeMap<u64, String>,
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl LruState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, key: &str) -> Option<Vec<f32>> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.recency);
        entry.recency = tick;
        entry.last_access_time = Instant::now();
        entry.access_count += 1;
        self.recency.insert(tick, key.to_string());
        Some(entry.vector.clone())
    }

    fn evict_oldest(&mut self) -> Option<String> {
        let (_, key) = self.recency.pop_first()?;
        self.entries.remove(&key);
        self.evictions += 1;
        Some(key)
    }
}

/// Bounded fingerprint -> vector store with least-recently-used eviction.
///
/// Misses go to the [`EmbeddingProvider`] through a [`ResiliencePolicy`]; only
/// a call that the policy reports as successful is ever written back, so a
/// timed-out or failed computation leaves no trace.
pub struct EmbeddingCache {
    capacity: usize,
    dimension: Option<usize>,
    state: Mutex<LruState>,
    provider: Arc<dyn EmbeddingProvider>,
    policy: ResiliencePolicy,
}

impl EmbeddingCache {
    pub fn new(
        capacity: usize,
        provider: Arc<dyn EmbeddingProvider>,
        policy: ResiliencePolicy,
    ) -> Self {
        info!("Initializing embedding cache (capacity: {})", capacity.max(1));
        Self {
            capacity: capacity.max(1),
            dimension: None,
            state: Mutex::new(LruState::default()),
            provider,
            policy,
        }
    }

    /// Reject provider vectors whose length differs from `dimension`.
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = Some(dimension);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the cached vector for `text`, computing it on a miss.
    pub async fn get_or_compute(&self, text: &str) -> Result<Vec<f32>, ClassifiedError> {
        let normalized = normalize_text(text);
        if normalized.is_empty() {
            return Err(ClassifiedError::invalid_input("cannot embed empty text"));
        }
        let key = fingerprint(&normalized);

        {
            let mut state = self.state.lock();
            if let Some(vector) = state.touch(&key) {
                state.hits += 1;
                debug!("Embedding cache hit for {}", &key[..12]);
                return Ok(vector);
            }
            state.misses += 1;
        }

        debug!("Embedding cache miss for {}, calling provider", &key[..12]);

        let provider = &self.provider;
        let vector = self
            .policy
            .run("embedding", || provider.embed(&normalized))
            .await?;

        if let Some(expected) = self.dimension {
            if vector.len() != expected {
                return Err(ClassifiedError::dependency(format!(
                    "embedding dimension mismatch: expected {}, got {}",
                    expected,
                    vector.len()
                )));
            }
        }

        Ok(self.insert(key, vector))
    }

    /// Resolve several texts in order; stops at the first failure.
    pub async fn get_or_compute_many(
        &self,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, ClassifiedError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.get_or_compute(text).await?);
        }
        Ok(vectors)
    }

    /// Compute embeddings for `texts` ahead of traffic. Failures are logged and
    /// skipped; returns how many texts are now cached.
    pub async fn warmup(&self, texts: &[String]) -> usize {
        let mut warmed = 0;
        for text in texts {
            match self.get_or_compute(text).await {
                Ok(_) => warmed += 1,
                Err(e) => warn!("Embedding warmup skipped a text: {}", e),
            }
        }
        info!("Embedding warmup finished ({}/{} cached)", warmed, texts.len());
        warmed
    }

    /// Drop every cached vector. Hit, miss and eviction counters are kept.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let dropped = state.entries.len();
        state.entries.clear();
        state.recency.clear();
        info!("Cleared embedding cache ({} entries)", dropped);
    }

    /// Access count for a cached text, without touching its recency.
    pub fn access_count(&self, text: &str) -> Option<u64> {
        let key = fingerprint(&normalize_text(text));
        self.state.lock().entries.get(&key).map(|e| e.access_count)
    }

    pub fn contains(&self, text: &str) -> bool {
        let key = fingerprint(&normalize_text(text));
        self.state.lock().entries.contains_key(&key)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            capacity: self.capacity,
            size: state.entries.len(),
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }

    fn insert(&self, key: String, vector: Vec<f32>) -> Vec<f32> {
        let mut state = self.state.lock();

        // A concurrent miss for the same key got here first.
        if let Some(existing) = state.touch(&key) {
            return existing;
        }

        if state.entries.len() >= self.capacity {
            if let Some(victim) = state.evict_oldest() {
                debug!("Evicted least recently used embedding {}", &victim[..12]);
            }
        }

        let tick = state.next_tick();
        state.recency.insert(tick, key.clone());
        state.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                vector: vector.clone(),
                last_access_time: Instant::now(),
                access_count: 0,
                recency: tick,
            },
        );

        vector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::embedding::MockEmbeddingProvider;
    use crate::services::resilience::{InitCache, PolicyConfig};
    use crate::utils::error::ErrorKind;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn policy(max_retries: u32) -> ResiliencePolicy {
        ResiliencePolicy::new(PolicyConfig::new(2.0, max_retries).with_backoff(0.01, 0.05))
            .with_init_cache(Arc::new(InitCache::new()))
    }

    fn counting_provider() -> MockEmbeddingProvider {
        let mut provider = MockEmbeddingProvider::new();
        provider
            .expect_embed()
            .returning(|text| Ok(vec![text.len() as f32, 1.0]));
        provider
    }

    #[tokio::test]
    async fn test_hit_does_not_call_provider() {
        let mut provider = MockEmbeddingProvider::new();
        provider
            .expect_embed()
            .times(1)
            .returning(|_| Ok(vec![0.5, 0.5]));
        let cache = EmbeddingCache::new(4, Arc::new(provider), policy(0));

        let first = cache.get_or_compute("What is RAG?").await.unwrap();
        let second = cache.get_or_compute("  what is rag?  ").await.unwrap();

        assert_eq!(first, second);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (1, 1, 1));
        assert_eq!(cache.access_count("what is rag?"), Some(1));
    }

    #[tokio::test]
    async fn test_lru_eviction_protects_recent_hit() {
        let cache = EmbeddingCache::new(2, Arc::new(counting_provider()), policy(0));

        cache.get_or_compute("a").await.unwrap();
        cache.get_or_compute("b").await.unwrap();
        cache.get_or_compute("a").await.unwrap();
        cache.get_or_compute("c").await.unwrap();

        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));

        let stats = cache.stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 3);
        assert_eq!(stats.evictions, 1);
    }

    #[tokio::test]
    async fn test_capacity_plus_one_evicts_exactly_one() {
        let capacity = 5;
        let cache = EmbeddingCache::new(capacity, Arc::new(counting_provider()), policy(0));

        for i in 0..=capacity {
            cache.get_or_compute(&format!("query {}", i)).await.unwrap();
        }

        assert_eq!(cache.len(), capacity);
        assert_eq!(cache.stats().evictions, 1);
        assert!(!cache.contains("query 0"));
        assert!((1..=capacity).all(|i| cache.contains(&format!("query {}", i))));
    }

    #[tokio::test]
    async fn test_access_count_does_not_influence_eviction() {
        let cache = EmbeddingCache::new(2, Arc::new(counting_provider()), policy(0));

        for _ in 0..5 {
            cache.get_or_compute("popular").await.unwrap();
        }
        cache.get_or_compute("recent").await.unwrap();
        cache.get_or_compute("newest").await.unwrap();

        assert!(!cache.contains("popular"));
        assert!(cache.contains("recent"));
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let mut provider = MockEmbeddingProvider::new();
        let mut seq = mockall::Sequence::new();
        provider
            .expect_embed()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(ClassifiedError::auth("bad key").into()));
        provider
            .expect_embed()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![1.0]));
        let cache = EmbeddingCache::new(2, Arc::new(provider), policy(3));

        let err = cache.get_or_compute("hello").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthFailure);
        assert!(cache.is_empty());

        assert_eq!(cache.get_or_compute("hello").await.unwrap(), vec![1.0]);
        assert_eq!(cache.stats().misses, 2);
    }

    #[tokio::test]
    async fn test_empty_text_is_invalid_input() {
        let mut provider = MockEmbeddingProvider::new();
        provider.expect_embed().never();
        let cache = EmbeddingCache::new(2, Arc::new(provider), policy(0));

        let err = cache.get_or_compute("   ").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(cache.stats().misses, 0);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_not_cached() {
        let cache = EmbeddingCache::new(2, Arc::new(counting_provider()), policy(0)).with_dimension(3);

        let err = cache.get_or_compute("abc").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DependencyFailure);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_many_in_order() {
        let cache = EmbeddingCache::new(8, Arc::new(counting_provider()), policy(0));
        let texts = vec!["a".to_string(), "bb".to_string(), "a".to_string()];

        let vectors = cache.get_or_compute_many(&texts).await.unwrap();
        assert_eq!(vectors[0], vec![1.0, 1.0]);
        assert_eq!(vectors[1], vec![2.0, 1.0]);
        assert_eq!(cache.stats().hits, 1);
    }

    struct SlowProvider {
        finished: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl EmbeddingProvider for SlowProvider {
        async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(vec![1.0, 2.0])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_leaves_cache_untouched() {
        let finished = Arc::new(AtomicBool::new(false));
        let provider = SlowProvider {
            finished: finished.clone(),
        };
        let cache = EmbeddingCache::new(4, Arc::new(provider), policy(0));
        let started = tokio::time::Instant::now();

        let err = cache.get_or_compute("slow question").await.unwrap_err();
        let waited = started.elapsed();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(3));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!finished.load(Ordering::SeqCst));
        assert!(cache.is_empty());
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_warmup_skips_failures() {
        let mut provider = MockEmbeddingProvider::new();
        provider
            .expect_embed()
            .withf(|text| text.contains("broken"))
            .returning(|_| Err(ClassifiedError::auth("bad key").into()));
        provider
            .expect_embed()
            .withf(|text| !text.contains("broken"))
            .returning(|text| Ok(vec![text.len() as f32]));
        let cache = EmbeddingCache::new(8, Arc::new(provider), policy(0));

        let texts = vec![
            "what programs exist".to_string(),
            "broken text".to_string(),
            "   ".to_string(),
            "how do i join".to_string(),
        ];
        let warmed = cache.warmup(&texts).await;

        assert_eq!(warmed, 2);
        assert_eq!(cache.len(), 2);
        assert!(cache.contains("what programs exist"));
        assert!(!cache.contains("broken text"));
    }

    #[tokio::test]
    async fn test_clear_empties_cache_but_keeps_counters() {
        let mut provider = MockEmbeddingProvider::new();
        provider
            .expect_embed()
            .times(3)
            .returning(|_| Ok(vec![0.5]));
        let cache = EmbeddingCache::new(4, Arc::new(provider), policy(0));

        cache.get_or_compute("a").await.unwrap();
        cache.get_or_compute("b").await.unwrap();
        cache.clear();

        assert!(cache.is_empty());
        assert!(!cache.contains("a"));
        assert_eq!(cache.stats().misses, 2);

        // Recomputed after a clear, and still evictable
        cache.get_or_compute("a").await.unwrap();
        assert_eq!(cache.len(), 1);
    }
}
