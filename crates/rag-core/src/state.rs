use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Settings;
use crate::services::conversation::{ConversationManager, ConversationStats, Summarizer};
use crate::services::embedding::{CacheStats, EmbeddingCache, EmbeddingProvider};
use crate::services::providers::{LlmProvider, VectorStore};
use crate::services::resilience::{
    InitCache, MemoryGuard, MemoryProbe, MemorySample, MemoryStatus, PolicyConfig,
    ResiliencePolicy, SystemMemoryProbe,
};
use crate::services::RagService;

/// Process-wide state for one warm instance.
///
/// Built once per cold start and shared by every request handled by that
/// instance; nothing in it is persisted.
#[derive(Clone)]
pub struct CoreContext {
    pub settings: Settings,
    pub embedding_cache: Arc<EmbeddingCache>,
    pub conversations: Arc<ConversationManager>,
    pub memory_guard: Option<Arc<MemoryGuard>>,
    pub init_cache: Arc<InitCache>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: MemoryStatus,
    pub version: String,
    pub cache: CacheStats,
    pub conversations: ConversationStats,
    pub memory: Option<MemorySample>,
}

impl CoreContext {
    pub fn new(
        settings: Settings,
        embedder: Arc<dyn EmbeddingProvider>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self::with_memory_probe(
            settings,
            embedder,
            summarizer,
            Arc::new(SystemMemoryProbe::new()),
        )
    }

    pub fn with_memory_probe(
        settings: Settings,
        embedder: Arc<dyn EmbeddingProvider>,
        summarizer: Arc<dyn Summarizer>,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        let memory_guard = settings.memory.enabled.then(|| {
            Arc::new(MemoryGuard::new(
                probe,
                settings.memory.warning_threshold,
                settings.memory.critical_threshold,
            ))
        });

        let init_cache = InitCache::global();
        let embedding_policy = build_policy(
            &settings.resilience.embedding,
            &memory_guard,
            &init_cache,
        );
        let summarizer_policy = build_policy(
            &settings.resilience.summarizer,
            &memory_guard,
            &init_cache,
        );

        let mut cache = EmbeddingCache::new(settings.cache.capacity, embedder, embedding_policy);
        if let Some(dimension) = settings.cache.dimension {
            cache = cache.with_dimension(dimension);
        }
        let conversations = ConversationManager::new(
            settings.conversation.clone(),
            summarizer,
            summarizer_policy,
        );

        info!(
            "Core context ready (cache capacity: {}, session ttl: {}s, memory guard: {})",
            settings.cache.capacity,
            settings.conversation.session_ttl_seconds,
            memory_guard.is_some()
        );

        Self {
            settings,
            embedding_cache: Arc::new(cache),
            conversations: Arc::new(conversations),
            memory_guard,
            init_cache,
        }
    }

    /// Policy for one call site, sharing this instance's guard and init cache.
    pub fn policy(&self, config: &PolicyConfig) -> ResiliencePolicy {
        build_policy(config, &self.memory_guard, &self.init_cache)
    }

    /// Orchestrator wired to this context's cache and conversation store.
    pub fn rag_service(
        &self,
        store: Arc<dyn VectorStore>,
        llm: Arc<dyn LlmProvider>,
    ) -> RagService {
        RagService::new(
            self.embedding_cache.clone(),
            self.conversations.clone(),
            store,
            llm,
            self.policy(&self.settings.resilience.vector_search),
            self.policy(&self.settings.resilience.llm),
            self.settings.rag.clone(),
        )
    }

    /// Start the idle-session sweeper if an interval is configured.
    pub fn start_sweeper(&self) -> Option<JoinHandle<()>> {
        match self.settings.conversation.sweep_interval_seconds {
            0 => None,
            seconds => Some(
                self.conversations
                    .spawn_sweeper(Duration::from_secs(seconds)),
            ),
        }
    }

    /// Prefetch embeddings for expected queries during a cold start. Never fails.
    pub async fn warmup(&self, texts: &[String]) -> usize {
        self.embedding_cache.warmup(texts).await
    }

    pub fn clear_embedding_cache(&self) {
        self.embedding_cache.clear();
    }

    pub fn health(&self) -> HealthSnapshot {
        let memory = self.memory_guard.as_ref().map(|guard| guard.sample());
        let status = match (&self.memory_guard, &memory) {
            (Some(guard), Some(sample)) => guard.status(sample),
            _ => MemoryStatus::Ok,
        };

        HealthSnapshot {
            status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            cache: self.embedding_cache.stats(),
            conversations: self.conversations.stats(),
            memory,
        }
    }
}

fn build_policy(
    config: &PolicyConfig,
    memory_guard: &Option<Arc<MemoryGuard>>,
    init_cache: &Arc<InitCache>,
) -> ResiliencePolicy {
    let policy = ResiliencePolicy::new(config.clone()).with_init_cache(init_cache.clone());
    match memory_guard {
        Some(guard) => policy.with_memory_guard(guard.clone()),
        None => policy,
    }
}
