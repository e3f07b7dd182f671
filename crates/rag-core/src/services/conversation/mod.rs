//! Short-term conversation memory.
//!
//! Sessions keep a bounded window of recent turns plus a running summary of
//! older ones, and expire after a period of inactivity.

pub mod manager;
mod summarizer;
pub mod types;

pub use manager::ConversationManager;
pub use summarizer::{Summarizer, TruncatingSummarizer};
pub use types::{
    ConversationContext, ConversationSession, ConversationStats, ConversationTurn, SessionId,
    SessionStats,
};
