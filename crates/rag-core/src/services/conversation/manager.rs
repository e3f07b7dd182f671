use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::summarizer::{Summarizer, TruncatingSummarizer};
use super::types::{
    ConversationContext, ConversationSession, ConversationStats, ConversationTurn, SessionStats,
};
use crate::config::ConversationSettings;
use crate::services::resilience::ResiliencePolicy;
use crate::utils::error::ClassifiedError;

type SessionSlot = Arc<Mutex<ConversationSession>>;

/// Process-local conversation memory.
///
/// Sessions live in a sharded map; each one sits behind its own async lock so
/// appends to one conversation are serialized while different conversations
/// never contend. Nothing here survives a cold start.
pub struct ConversationManager {
    sessions: DashMap<String, SessionSlot>,
    settings: ConversationSettings,
    summarizer: Arc<dyn Summarizer>,
    local_summarizer: TruncatingSummarizer,
    policy: ResiliencePolicy,
    sessions_created: AtomicU64,
    sessions_expired: AtomicU64,
}

impl ConversationManager {
    pub fn new(
        settings: ConversationSettings,
        summarizer: Arc<dyn Summarizer>,
        policy: ResiliencePolicy,
    ) -> Self {
        info!(
            "Initializing conversation manager (max_turns: {}, ttl: {}s)",
            settings.max_turns_per_session, settings.session_ttl_seconds
        );
        Self {
            sessions: DashMap::new(),
            local_summarizer: TruncatingSummarizer::new(settings.summary_max_chars),
            settings,
            summarizer,
            policy,
            sessions_created: AtomicU64::new(0),
            sessions_expired: AtomicU64::new(0),
        }
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.settings.session_ttl_seconds)
    }

    fn max_turns(&self) -> usize {
        self.settings.max_turns_per_session.max(1)
    }

    /// Record a finished turn and return a snapshot of the session after it.
    ///
    /// Creates the session on first use. When the retained window is full the
    /// oldest turns are folded into the summary first.
    pub async fn append_turn(
        &self,
        session_id: &str,
        user_message: impl Into<String>,
        assistant_response: impl Into<String>,
        evidence_ref: Option<serde_json::Value>,
    ) -> Result<ConversationSession, ClassifiedError> {
        let session_id = validate_session_id(session_id)?;
        let user_message = user_message.into();
        let assistant_response = assistant_response.into();

        loop {
            let slot = self.slot_for(session_id);
            let mut session = slot.lock().await;

            // The sweeper may have dropped this slot while we waited.
            if !self.is_current(session_id, &slot) {
                continue;
            }

            if session.is_expired(Instant::now(), self.ttl()) {
                info!("Session {} expired, starting fresh", session_id);
                *session = ConversationSession::new(session_id);
                self.sessions_expired.fetch_add(1, Ordering::Relaxed);
                self.sessions_created.fetch_add(1, Ordering::Relaxed);
            }

            if session.turns.len() >= self.max_turns() {
                self.fold_oldest(&mut session).await;
            }

            let turn_number = session.push_turn(user_message, assistant_response, evidence_ref);
            debug!(
                "Appended turn {} to session {} ({} retained)",
                turn_number,
                session_id,
                session.turns.len()
            );

            return Ok(session.clone());
        }
    }

    /// Summary plus the last `max_turns_for_context` retained turns.
    ///
    /// Unknown or expired sessions yield an empty context; nothing is created.
    pub async fn get_context(
        &self,
        session_id: &str,
        max_turns_for_context: usize,
    ) -> Result<ConversationContext, ClassifiedError> {
        let session_id = validate_session_id(session_id)?;

        let Some(slot) = self.live_slot(session_id) else {
            return Ok(ConversationContext::default());
        };

        let mut session = slot.lock().await;
        if session.is_expired(Instant::now(), self.ttl()) {
            drop(session);
            self.remove_slot(session_id, &slot);
            return Ok(ConversationContext::default());
        }

        session.touch();
        Ok(session.context(max_turns_for_context))
    }

    /// Snapshot of a live session without refreshing its activity time.
    pub async fn get_session(&self, session_id: &str) -> Option<ConversationSession> {
        let slot = self.live_slot(session_id.trim())?;
        let session = slot.lock().await;
        if session.is_expired(Instant::now(), self.ttl()) {
            drop(session);
            self.remove_slot(session_id.trim(), &slot);
            return None;
        }
        Some(session.clone())
    }

    /// Refresh the activity time of a live session. Returns `false` if the
    /// session is absent or already expired.
    pub async fn touch(&self, session_id: &str) -> bool {
        let Some(slot) = self.live_slot(session_id.trim()) else {
            return false;
        };
        let mut session = slot.lock().await;
        if session.is_expired(Instant::now(), self.ttl()) {
            drop(session);
            self.remove_slot(session_id.trim(), &slot);
            return false;
        }
        session.touch();
        true
    }

    /// Remove every session idle for longer than the ttl as of `now`.
    /// Sessions locked by an in-flight append are left for the next pass.
    pub fn expire_idle(&self, now: Instant) -> usize {
        let ttl = self.ttl();
        let before = self.sessions.len();

        self.sessions.retain(|_, slot| match slot.try_lock() {
            Ok(session) => !session.is_expired(now, ttl),
            Err(_) => true,
        });

        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            self.sessions_expired.fetch_add(removed as u64, Ordering::Relaxed);
            info!("Expired {} idle sessions", removed);
        }
        removed
    }

    /// Periodically run [`expire_idle`](Self::expire_idle) until the manager is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = manager.upgrade() else {
                    debug!("Conversation manager dropped, stopping sweeper");
                    return;
                };
                manager.expire_idle(Instant::now());
            }
        })
    }

    pub async fn session_stats(&self, session_id: &str) -> Option<SessionStats> {
        let session = self.get_session(session_id).await?;
        Some(SessionStats {
            session_id: session.session_id.clone(),
            turns_retained: session.turns.len(),
            total_turns: session.total_turns(),
            summarized: session.summary.is_some(),
            age_seconds: (chrono::Utc::now() - session.created_at).num_seconds(),
            idle_seconds: session.last_active.elapsed().as_secs(),
        })
    }

    /// Store-wide counters. Sessions busy with an append are counted as
    /// active but their turns are skipped.
    pub fn stats(&self) -> ConversationStats {
        let retained_turns = self
            .sessions
            .iter()
            .filter_map(|entry| entry.value().try_lock().ok().map(|s| s.turns.len()))
            .sum();

        ConversationStats {
            active_sessions: self.sessions.len(),
            retained_turns,
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_expired: self.sessions_expired.load(Ordering::Relaxed),
        }
    }

    fn slot_for(&self, session_id: &str) -> SessionSlot {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                info!("Creating session {}", session_id);
                self.sessions_created.fetch_add(1, Ordering::Relaxed);
                Arc::new(Mutex::new(ConversationSession::new(session_id)))
            })
            .value()
            .clone()
    }

    fn live_slot(&self, session_id: &str) -> Option<SessionSlot> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    fn is_current(&self, session_id: &str, slot: &SessionSlot) -> bool {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::ptr_eq(entry.value(), slot))
            .unwrap_or(false)
    }

    fn remove_slot(&self, session_id: &str, slot: &SessionSlot) {
        if self
            .sessions
            .remove_if(session_id, |_, current| Arc::ptr_eq(current, slot))
            .is_some()
        {
            self.sessions_expired.fetch_add(1, Ordering::Relaxed);
            debug!("Session {} expired, removed", session_id);
        }
    }

    /// Fold the oldest turns into the summary. Never fails: a summarizer that
    /// errors, times out or returns nothing is replaced by the local one.
    async fn fold_oldest(&self, session: &mut ConversationSession) {
        let count = self
            .settings
            .summary_fold_count
            .clamp(1, session.turns.len());
        let folded: Vec<ConversationTurn> = session.turns[..count].to_vec();
        let existing = session.summary.clone();

        let summarizer = &self.summarizer;
        let local = &self.local_summarizer;
        let result = self
            .policy
            .run_with_fallback(
                "summarize",
                || summarizer.summarize(existing.as_deref(), &folded),
                |_| local.condense(existing.as_deref(), &folded),
            )
            .await;

        let summary = match result {
            Ok(summary) if !summary.trim().is_empty() => local.fit(summary.trim()),
            Ok(_) => local.condense(existing.as_deref(), &folded),
            Err(err) => {
                warn!(
                    "Summarizer unavailable for session {} ({}), using local summary",
                    session.session_id, err
                );
                local.condense(existing.as_deref(), &folded)
            }
        };

        session.turns.drain(..count);
        session.summary = Some(summary);
        debug!(
            "Folded {} turn(s) into summary for session {}",
            count, session.session_id
        );
    }
}

fn validate_session_id(session_id: &str) -> Result<&str, ClassifiedError> {
    let trimmed = session_id.trim();
    if trimmed.is_empty() {
        return Err(ClassifiedError::invalid_input("session_id must not be empty"));
    }
    Ok(trimmed)
}
