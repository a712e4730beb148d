//! Turn model: one logical user or assistant utterance, persisted as a
//! pointer to a contiguous range of events in the session event log
//! (spec.md §3, invariant I5).

use serde::{Deserialize, Serialize};

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The human (or platform) side of the conversation.
    User,
    /// The agent's response.
    Assistant,
}

/// A closed, contiguous range of event sequence numbers within one
/// session (I5: must point at existing events in the same session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRange {
    /// First sequence number in the range, inclusive.
    pub start_seq: i64,
    /// Last sequence number in the range, inclusive.
    pub end_seq: i64,
}

impl EventRange {
    /// A range covering exactly one event.
    #[must_use]
    pub fn single(seq: i64) -> Self {
        Self { start_seq: seq, end_seq: seq }
    }
}

/// One turn appended to a [`super::conversation::Conversation`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// Who produced this turn.
    pub role: Role,
    /// The ACP session whose event log `event_range` indexes into.
    pub session_id: String,
    /// The contiguous event range that reconstructs this turn's content.
    pub event_range: EventRange,
    /// The platform message id this turn corresponds to, if any.
    pub message_id: Option<String>,
}
