//! Session-key and session-state types (C4/C5 data model).

use serde::{Deserialize, Serialize};

use crate::acp::client::PromptStatus;

/// Opaque, deterministic identifier for a conversation.
///
/// Two messages that produce the same key share a conversation regardless
/// of how many times the underlying ACP session is rotated or recovered.
/// Constructed only by [`crate::router::resolve_session_key`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey(String);

impl SessionKey {
    /// Wrap an already-formed key string. Internal to the router; kept
    /// `pub(crate)` so callers cannot fabricate keys outside the
    /// deterministic derivation function.
    pub(crate) fn from_raw(raw: String) -> Self {
        Self(raw)
    }

    /// Borrow the underlying string, e.g. for use as a mutex/map key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The agent's self-reported context-window usage, sampled from stderr by
/// the context-usage tracker (C5 subordinate helper).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContextUsage {
    /// Fraction of the context window consumed, in `[0.0, 1.0]`.
    pub percentage: f64,
    /// Model identifier reported alongside the usage figure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

/// One conversation's live state, one-to-one with an ACP session.
///
/// Created by C5; mutated by C5 under the session key's lock and by C2
/// (prompt status transitions); destroyed when the agent is torn down or
/// the session is explicitly ended.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// The stable conversation identifier.
    pub session_key: SessionKey,
    /// The current ACP-side session id. Changes across rotation/recovery.
    pub acp_session_id: String,
    /// External conversation-store identifier, once bound.
    pub conversation_id: Option<String>,
    /// Current prompt status, mirrored from the ACP client.
    pub status: PromptStatus,
    /// Last-sampled context usage, if any.
    pub context_usage: Option<ContextUsage>,
}

impl SessionState {
    /// Construct a freshly created session state with no context-usage
    /// sample yet and `status = Idle`.
    #[must_use]
    pub fn new(session_key: SessionKey, acp_session_id: String, conversation_id: Option<String>) -> Self {
        Self {
            session_key,
            acp_session_id,
            conversation_id,
            status: PromptStatus::Idle,
            context_usage: None,
        }
    }
}
