//! Conversation model: the persistent record containing an ordered
//! sequence of turns under a single `SessionKey` (spec.md §3, §GLOSSARY).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted conversation, looked up by session key for recovery (C5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Store-assigned identifier.
    pub id: String,
    /// The stable session key this conversation belongs to.
    pub session_key: String,
    /// When the conversation was first created.
    pub created_at: DateTime<Utc>,
    /// When the conversation was last appended to.
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Whether `updated_at` falls within `max_age` of now — the
    /// recoverability test C5 applies before reusing a conversation
    /// across an orchestrator or agent restart.
    #[must_use]
    pub fn is_recent(&self, max_age: std::time::Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.updated_at);
        match age.to_std() {
            Ok(age) => age <= max_age,
            Err(_) => true, // negative duration: updated_at is in the future, treat as recent
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn conversation(age: ChronoDuration) -> Conversation {
        Conversation {
            id: "c1".into(),
            session_key: "k1".into(),
            created_at: Utc::now() - age,
            updated_at: Utc::now() - age,
        }
    }

    #[test]
    fn recent_conversation_within_window() {
        let conv = conversation(ChronoDuration::minutes(5));
        assert!(conv.is_recent(std::time::Duration::from_secs(30 * 60)));
    }

    #[test]
    fn stale_conversation_outside_window() {
        let conv = conversation(ChronoDuration::minutes(45));
        assert!(!conv.is_recent(std::time::Duration::from_secs(30 * 60)));
    }
}
