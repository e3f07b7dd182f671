use anyhow::Result;

use super::types::ConversationTurn;

/// Condenses turns that leave the retained window.
///
/// `existing_summary` is the summary built so far; the returned text replaces
/// it and must cover both.
#[async_trait::async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        existing_summary: Option<&str>,
        turns: &[ConversationTurn],
    ) -> Result<String>;
}

/// Deterministic local summarizer: clipped concatenation of the folded turns.
/// Never fails, so it doubles as the fallback for any remote summarizer.
#[derive(Debug, Clone)]
pub struct TruncatingSummarizer {
    max_message_chars: usize,
    max_summary_chars: usize,
}

impl Default for TruncatingSummarizer {
    fn default() -> Self {
        Self::new(2000)
    }
}

impl TruncatingSummarizer {
    pub fn new(max_summary_chars: usize) -> Self {
        Self {
            max_message_chars: 160,
            max_summary_chars: max_summary_chars.max(1),
        }
    }

    pub fn condense(&self, existing_summary: Option<&str>, turns: &[ConversationTurn]) -> String {
        let mut summary = match existing_summary {
            Some(existing) if !existing.trim().is_empty() => existing.trim_end().to_string(),
            _ => String::from("Earlier discussion:"),
        };

        for turn in turns {
            summary.push_str(&format!(
                "\n- Turn {}: asked \"{}\", answered \"{}\"",
                turn.turn_number,
                clip(&turn.user_message, self.max_message_chars),
                clip(&turn.assistant_response, self.max_message_chars)
            ));
        }

        self.fit(&summary)
    }

    /// Keep the most recent `max_summary_chars` characters.
    pub fn fit(&self, summary: &str) -> String {
        let count = summary.chars().count();
        if count <= self.max_summary_chars {
            return summary.to_string();
        }
        let tail: String = summary
            .chars()
            .skip(count - self.max_summary_chars + 1)
            .collect();
        format!("…{}", tail)
    }
}

#[async_trait::async_trait]
impl Summarizer for TruncatingSummarizer {
    async fn summarize(
        &self,
        existing_summary: Option<&str>,
        turns: &[ConversationTurn],
    ) -> Result<String> {
        Ok(self.condense(existing_summary, turns))
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{}…", head)
}
