//! Session event log model: the monotonic, per-session append-only log of
//! `prompt.sent` and `session.update` records that a [`super::turn::Turn`]'s
//! `event_range` points into (spec.md §3 "Conversation / Turn / Event").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Discriminates the two event kinds the orchestrator appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A prompt was sent to the agent (user- or system-sourced).
    PromptSent,
    /// A `session/update` notification was forwarded from the agent.
    SessionUpdate,
}

impl EventType {
    /// Wire name matching the event store's `type` column values.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PromptSent => "prompt.sent",
            Self::SessionUpdate => "session.update",
        }
    }

    /// Parse a stored event type name back into its variant.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "prompt.sent" => Some(Self::PromptSent),
            "session.update" => Some(Self::SessionUpdate),
            _ => None,
        }
    }
}

/// One record in a session's event log, as read back from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    /// The session this event belongs to.
    pub session_id: String,
    /// Monotonic per-session sequence number assigned at append time.
    pub seq: i64,
    /// Which kind of event this is.
    pub event_type: EventType,
    /// The event payload: prompt content blocks or a raw ACP update.
    pub data: Value,
    /// When the store recorded this event.
    pub ts: DateTime<Utc>,
}

/// Append-time metadata the store hands back to the caller.
#[derive(Debug, Clone, Copy)]
pub struct AppendedEvent {
    /// When the append was recorded.
    pub ts: DateTime<Utc>,
    /// The sequence number assigned to the new event.
    pub seq: i64,
}

/// Extract the plain-text content from an event payload, for turn
/// reconstruction. Handles both shapes the orchestrator persists: a bare
/// array of content blocks (outgoing prompts) and a `session/update`
/// payload carrying a single `content` block under `update.content`.
#[must_use]
pub fn extract_text(value: &Value) -> String {
    fn block_text(block: &Value) -> Option<String> {
        if block.get("type").and_then(Value::as_str) == Some("text") {
            block.get("text").and_then(Value::as_str).map(str::to_owned)
        } else {
            None
        }
    }

    if let Some(blocks) = value.as_array() {
        return blocks.iter().filter_map(block_text).collect::<Vec<_>>().join("");
    }

    match value.get("content") {
        Some(content) if content.is_array() => content
            .as_array()
            .unwrap()
            .iter()
            .filter_map(block_text)
            .collect::<Vec<_>>()
            .join(""),
        Some(content) => block_text(content).unwrap_or_default(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_type_round_trips_through_wire_name() {
        assert_eq!(EventType::parse(EventType::PromptSent.as_str()), Some(EventType::PromptSent));
        assert_eq!(EventType::parse(EventType::SessionUpdate.as_str()), Some(EventType::SessionUpdate));
        assert_eq!(EventType::parse("bogus"), None);
    }

    #[test]
    fn extracts_text_from_prompt_content_array() {
        let value = json!([{ "type": "text", "text": "hi", "_meta": { "source": "user" } }]);
        assert_eq!(extract_text(&value), "hi");
    }

    #[test]
    fn extracts_text_from_update_content_block() {
        let value = json!({ "sessionUpdate": "agent_message_chunk", "content": { "type": "text", "text": "chunk" } });
        assert_eq!(extract_text(&value), "chunk");
    }

    #[test]
    fn empty_payload_extracts_to_empty_string() {
        assert_eq!(extract_text(&json!({"sessionUpdate": "agent_message_chunk", "content": ""})), "");
    }
}
