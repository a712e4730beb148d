//! Normalized inbound message, produced by platform adapters and consumed
//! by the orchestrator (C7).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifies the human or bot that sent a [`NormalizedMessage`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sender {
    /// Platform-scoped sender identifier.
    pub id: String,
    /// Platform name (`"discord"`, ...). Free-form; the orchestrator core
    /// does not special-case any value.
    pub platform: String,
    /// Human-readable display name, if the platform provides one.
    pub display_name: Option<String>,
}

/// A platform message translated into the orchestrator's internal shape.
///
/// Immutable after construction — platform adapters build one of these per
/// inbound event and hand it to [`crate::orchestrator::Orchestrator::handle_message`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedMessage {
    /// Platform-unique message id, used for at-least-once idempotency by
    /// the caller (the core does not itself deduplicate — see spec P7).
    pub id: String,
    /// Message body. May be empty (e.g. an attachment-only message).
    pub text: String,
    /// Who sent the message.
    pub sender: Sender,
    /// Opaque platform routing token (channel id, DM id, ...).
    pub channel: String,
    /// When the platform received the message.
    pub timestamp: DateTime<Utc>,
    /// Free-form metadata: thread markers, DM markers, referenced message
    /// id, embeds, attachments. The core passes this through untouched.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl NormalizedMessage {
    /// Whether `metadata` marks this message as a direct message to the
    /// bot, per the `"is_dm"` convention platform adapters are expected to
    /// populate.
    #[must_use]
    pub fn is_direct_message(&self) -> bool {
        self.metadata
            .get("is_dm")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}
