//! Session-key router (C4): derives a stable [`SessionKey`] from a message
//! plus a target agent name, and owns the in-memory existence map C5
//! consults.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::models::message::NormalizedMessage;
use crate::models::session::{SessionKey, SessionState};
use crate::{AppError, Result};

/// Whether the peer a message came from is a direct-message user or a
/// shared channel. Adapter-dependent; Discord maps DMs to `User` and
/// everything else to `Channel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    /// A one-to-one conversation with a single user.
    User,
    /// A shared channel, thread, or other multi-party surface.
    Channel,
}

/// Derive the deterministic [`SessionKey`] for `message` against `agent`.
///
/// # Errors
///
/// Returns [`AppError::Routing`] if `agent` is not in `known_agents`.
pub fn resolve_session_key(
    message: &NormalizedMessage,
    agent: &str,
    known_agents: &[String],
) -> Result<SessionKey> {
    if !known_agents.iter().any(|known| known == agent) {
        return Err(AppError::Routing(format!("unknown agent: {agent}")));
    }

    let peer_kind = if message.is_direct_message() { PeerKind::User } else { PeerKind::Channel };
    let peer_kind_str = match peer_kind {
        PeerKind::User => "user",
        PeerKind::Channel => "channel",
    };
    let peer_id = if peer_kind == PeerKind::User { &message.sender.id } else { &message.channel };

    let raw = format!("{agent}:{}:{peer_kind_str}:{peer_id}", message.sender.platform);
    Ok(SessionKey::from_raw(raw))
}

/// In-memory map from [`SessionKey`] to live [`SessionState`], consulted
/// (but not directly mutated) by C5 for existence tests. The router does
/// not talk to ACP; it only tracks what C5 tells it.
#[derive(Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<SessionKey, SessionState>>,
}

impl SessionTable {
    /// Construct an empty session table, ready to be shared via `Arc`.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Look up the live state for `key`, if any.
    pub async fn get(&self, key: &SessionKey) -> Option<SessionState> {
        self.sessions.lock().await.get(key).cloned()
    }

    /// Insert or replace the state for `key`.
    pub async fn put(&self, key: SessionKey, state: SessionState) {
        self.sessions.lock().await.insert(key, state);
    }

    /// Remove the state for `key` entirely (agent torn down or session
    /// explicitly ended).
    pub async fn remove(&self, key: &SessionKey) {
        self.sessions.lock().await.remove(key);
    }

    /// The ACP session id of an arbitrary currently tracked session, used
    /// to stamp a restart checkpoint with *a* live session rather than
    /// none when more than one is in flight.
    pub async fn any_acp_session_id(&self) -> Option<String> {
        self.sessions.lock().await.values().next().map(|state| state.acp_session_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::message::Sender;
    use chrono::Utc;
    use std::collections::HashMap as StdHashMap;

    fn msg(is_dm: bool, sender_id: &str, channel: &str) -> NormalizedMessage {
        let mut metadata = StdHashMap::new();
        metadata.insert("is_dm".to_owned(), serde_json::Value::Bool(is_dm));
        NormalizedMessage {
            id: "m1".into(),
            text: "hi".into(),
            sender: Sender { id: sender_id.into(), platform: "discord".into(), display_name: None },
            channel: channel.into(),
            timestamp: Utc::now(),
            metadata,
        }
    }

    #[test]
    fn unknown_agent_is_routing_error() {
        let message = msg(false, "u1", "c1");
        let err = resolve_session_key(&message, "ghost", &["real".into()]).unwrap_err();
        assert!(matches!(err, AppError::Routing(_)));
    }

    #[test]
    fn same_inputs_produce_same_key() {
        let known = vec!["agentA".to_owned()];
        let a = resolve_session_key(&msg(false, "u1", "c1"), "agentA", &known).expect("ok");
        let b = resolve_session_key(&msg(false, "u1", "c1"), "agentA", &known).expect("ok");
        assert_eq!(a, b);
    }

    #[test]
    fn dm_and_channel_peer_kind_differ() {
        let known = vec!["agentA".to_owned()];
        let dm = resolve_session_key(&msg(true, "u1", "c1"), "agentA", &known).expect("ok");
        let channel = resolve_session_key(&msg(false, "u1", "c1"), "agentA", &known).expect("ok");
        assert_ne!(dm, channel);
    }
}
