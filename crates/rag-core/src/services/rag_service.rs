use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::RagSettings;
use crate::services::conversation::{ConversationContext, ConversationManager};
use crate::services::embedding::EmbeddingCache;
use crate::services::providers::{LlmProvider, ScoredDocument, SearchFilters, VectorStore};
use crate::services::resilience::ResiliencePolicy;
use crate::utils::error::ClassifiedError;

const FALLBACK_PASSAGES: usize = 3;
const FALLBACK_PASSAGE_CHARS: usize = 240;

/// Result of one question/answer round.
#[derive(Debug, Clone, Serialize)]
pub struct RagAnswer {
    pub answer: String,
    pub turn_number: u64,
    pub evidence_count: usize,
    /// Whether earlier turns or a summary were fed into the prompt.
    pub context_used: bool,
    /// Set when retrieval or generation fell back instead of failing.
    pub degraded: bool,
}

/// Reference orchestrator for one chat request.
///
/// conversation context → cached query embedding → vector search → prompt →
/// generation → turn append. Each external call goes through its own policy.
pub struct RagService {
    cache: Arc<EmbeddingCache>,
    conversations: Arc<ConversationManager>,
    store: Arc<dyn VectorStore>,
    llm: Arc<dyn LlmProvider>,
    search_policy: ResiliencePolicy,
    llm_policy: ResiliencePolicy,
    settings: RagSettings,
}

impl RagService {
    pub fn new(
        cache: Arc<EmbeddingCache>,
        conversations: Arc<ConversationManager>,
        store: Arc<dyn VectorStore>,
        llm: Arc<dyn LlmProvider>,
        search_policy: ResiliencePolicy,
        llm_policy: ResiliencePolicy,
        settings: RagSettings,
    ) -> Self {
        Self {
            cache,
            conversations,
            store,
            llm,
            search_policy,
            llm_policy,
            settings,
        }
    }

    pub async fn answer(
        &self,
        session_id: &str,
        question: &str,
    ) -> Result<RagAnswer, ClassifiedError> {
        self.answer_with_filters(session_id, question, &SearchFilters::default())
            .await
    }

    pub async fn answer_with_filters(
        &self,
        session_id: &str,
        question: &str,
        filters: &SearchFilters,
    ) -> Result<RagAnswer, ClassifiedError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(ClassifiedError::invalid_input("question must not be empty"));
        }

        info!("Answering question for session {}", session_id);

        let context = self
            .conversations
            .get_context(session_id, self.settings.context_turns)
            .await?;

        let vector = self.cache.get_or_compute(question).await?;

        let mut search_degraded = false;
        let store = &self.store;
        let top_k = self.settings.retrieval_top_k;
        let documents = self
            .search_policy
            .run_with_fallback(
                "vector_search",
                || store.search(&vector, top_k, filters),
                |_| {
                    search_degraded = true;
                    Vec::new()
                },
            )
            .await?;
        let documents = apply_min_score(documents, filters);
        debug!("Retrieved {} passages", documents.len());

        let prompt = self.build_prompt(&context, &self.build_context(&documents), question);

        let mut llm_degraded = false;
        let llm = &self.llm;
        let answer = self
            .llm_policy
            .run_with_fallback(
                "llm",
                || llm.generate(&prompt),
                |_| {
                    llm_degraded = true;
                    fallback_answer(&documents)
                },
            )
            .await?;

        let degraded = search_degraded || llm_degraded;
        if degraded {
            warn!("Session {} answered in degraded mode", session_id);
        }

        let evidence = json!({
            "sources": documents.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
            "degraded": degraded,
        });

        let session = self
            .conversations
            .append_turn(session_id, question, answer.clone(), Some(evidence))
            .await?;
        let turn_number = session
            .latest_turn()
            .map(|turn| turn.turn_number)
            .unwrap_or_default();

        Ok(RagAnswer {
            answer,
            turn_number,
            evidence_count: documents.len(),
            context_used: !context.is_empty(),
            degraded,
        })
    }

    /// Numbered evidence block, cut once it passes `max_context_chars`.
    pub fn build_context(&self, documents: &[ScoredDocument]) -> String {
        if documents.is_empty() {
            return String::from("No relevant passages were found.");
        }

        let mut context = String::from("Relevant passages:\n\n");
        for (i, doc) in documents.iter().enumerate() {
            context.push_str(&format!(
                "[{}] ({}, score {:.2})\n{}\n\n",
                i + 1,
                doc.id,
                doc.score,
                doc.content.trim()
            ));

            if context.len() > self.settings.max_context_chars {
                debug!(
                    "Context truncated at {} passages (max length: {})",
                    i + 1,
                    self.settings.max_context_chars
                );
                break;
            }
        }

        context
    }

    pub fn build_prompt(
        &self,
        conversation: &ConversationContext,
        evidence: &str,
        question: &str,
    ) -> String {
        let mut prompt = String::from(
            "You are an assistant answering questions from the passages provided. \
             Answer accurately from the passages; if they do not contain the answer, say so.\n\n",
        );

        let history = conversation.render();
        if !history.is_empty() {
            prompt.push_str(&history);
            prompt.push_str("\n\n");
        }

        prompt.push_str(evidence.trim_end());
        prompt.push_str("\n\nQuestion: ");
        prompt.push_str(question);
        prompt
    }
}

fn apply_min_score(documents: Vec<ScoredDocument>, filters: &SearchFilters) -> Vec<ScoredDocument> {
    match filters.min_score {
        Some(min) => documents.into_iter().filter(|d| d.score >= min).collect(),
        None => documents,
    }
}

/// Answer built from retrieved passages alone, used when generation is unavailable.
fn fallback_answer(documents: &[ScoredDocument]) -> String {
    if documents.is_empty() {
        return String::from(
            "I'm having trouble generating a response right now. Please try again in a moment.",
        );
    }

    let mut answer = String::from(
        "I couldn't generate a full answer right now, but these passages look relevant:",
    );
    for doc in documents.iter().take(FALLBACK_PASSAGES) {
        let content = doc.content.trim();
        let excerpt: String = content.chars().take(FALLBACK_PASSAGE_CHARS).collect();
        let ellipsis = if content.chars().count() > FALLBACK_PASSAGE_CHARS {
            "…"
        } else {
            ""
        };
        answer.push_str(&format!("\n- {}{}", excerpt, ellipsis));
    }
    answer
}
