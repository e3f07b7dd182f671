use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Externally supplied conversation identifier.
pub type SessionId = String;

/// One user message and the assistant's answer to it.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationTurn {
    /// 1-based, strictly increasing within a session, never reused.
    pub turn_number: u64,
    pub user_message: String,
    pub assistant_response: String,
    pub created_at: DateTime<Utc>,
    /// Opaque metadata from the orchestrator (sources, flags); not interpreted.
    pub evidence_ref: Option<serde_json::Value>,
}

/// Retained window of a conversation plus the summary of what fell out of it.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSession {
    pub session_id: SessionId,
    pub turns: Vec<ConversationTurn>,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,

    /// Monotonic twin of `last_active_at`, used for expiry.
    #[serde(skip)]
    pub(crate) last_active: Instant,
    #[serde(skip)]
    next_turn_number: u64,
}

impl ConversationSession {
    pub(crate) fn new(session_id: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            turns: Vec::new(),
            summary: None,
            created_at: now,
            last_active_at: now,
            last_active: Instant::now(),
            next_turn_number: 1,
        }
    }

    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_active) > ttl
    }

    pub(crate) fn touch(&mut self) {
        self.last_active = Instant::now();
        self.last_active_at = Utc::now();
    }

    /// Number of turns ever appended, including those folded into the summary.
    pub fn total_turns(&self) -> u64 {
        self.next_turn_number - 1
    }

    pub fn latest_turn(&self) -> Option<&ConversationTurn> {
        self.turns.last()
    }

    pub(crate) fn push_turn(
        &mut self,
        user_message: String,
        assistant_response: String,
        evidence_ref: Option<serde_json::Value>,
    ) -> u64 {
        let turn_number = self.next_turn_number;
        self.next_turn_number += 1;
        self.turns.push(ConversationTurn {
            turn_number,
            user_message,
            assistant_response,
            created_at: Utc::now(),
            evidence_ref,
        });
        self.touch();
        turn_number
    }

    pub(crate) fn context(&self, max_turns: usize) -> ConversationContext {
        let start = self.turns.len().saturating_sub(max_turns);
        ConversationContext {
            summary: self.summary.clone(),
            recent_turns: self.turns[start..].to_vec(),
        }
    }
}

/// What the orchestrator feeds into a prompt for a follow-up question.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversationContext {
    pub summary: Option<String>,
    pub recent_turns: Vec<ConversationTurn>,
}

impl ConversationContext {
    pub fn is_empty(&self) -> bool {
        self.summary.is_none() && self.recent_turns.is_empty()
    }

    /// Prompt block for the LLM; empty when there is no history.
    pub fn render(&self) -> String {
        let mut parts = Vec::new();

        if let Some(summary) = &self.summary {
            parts.push(format!("Conversation summary:\n{}", summary));
        }

        if !self.recent_turns.is_empty() {
            let mut recent = String::from("Recent conversation:");
            for turn in &self.recent_turns {
                recent.push_str(&format!(
                    "\nUser: {}\nAssistant: {}",
                    turn.user_message, turn.assistant_response
                ));
            }
            parts.push(recent);
        }

        parts.join("\n\n")
    }
}

/// Per-session numbers for stats endpoints
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: SessionId,
    pub turns_retained: usize,
    pub total_turns: u64,
    pub summarized: bool,
    pub age_seconds: i64,
    pub idle_seconds: u64,
}

/// Store-wide numbers
#[derive(Debug, Clone, Serialize)]
pub struct ConversationStats {
    pub active_sessions: usize,
    pub retained_turns: usize,
    pub sessions_created: u64,
    pub sessions_expired: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_numbers_and_context_window() {
        let mut session = ConversationSession::new("s1");
        for i in 0..4 {
            session.push_turn(format!("q{}", i), format!("a{}", i), None);
        }

        assert_eq!(session.total_turns(), 4);
        let context = session.context(2);
        assert_eq!(context.recent_turns.len(), 2);
        assert_eq!(context.recent_turns[0].turn_number, 3);
        assert_eq!(session.context(10).recent_turns.len(), 4);
    }

    #[test]
    fn test_render() {
        assert_eq!(ConversationContext::default().render(), "");

        let mut session = ConversationSession::new("s1");
        session.push_turn("How do programs help?".into(), "By building confidence.".into(), None);
        session.summary = Some("Earlier: onboarding".into());

        let rendered = session.context(3).render();
        assert!(rendered.starts_with("Conversation summary:\nEarlier: onboarding"));
        assert!(rendered.contains("Recent conversation:"));
        assert!(rendered.contains("User: How do programs help?"));
        assert!(rendered.contains("Assistant: By building confidence."));
    }
}
