//! Session Lifecycle Manager (C5): per-`SessionKey` locking and the
//! create/rotate/recover decision (spec.md §4.5).

pub mod context_usage;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::acp::client::AcpClient;
use crate::models::session::{SessionKey, SessionState};
use crate::persistence::store::ConversationStore;
use crate::router::SessionTable;
use crate::Result;

/// Result of [`SessionLifecycleManager::get_or_create_session`]: the
/// resolved session state plus which of the three paths produced it.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    /// The session state now tracked for the key.
    pub state: SessionState,
    /// A brand new conversation: no prior conversation was found or reused.
    pub is_new: bool,
    /// An existing live session was rotated due to high context usage.
    pub was_rotated: bool,
    /// A recent persisted conversation was reattached to a fresh ACP
    /// session after the live one was lost (restart/crash recovery).
    pub was_recovered: bool,
}

/// Tunables for [`SessionLifecycleManager`], defaulted to the §5 values.
#[derive(Debug, Clone, Copy)]
pub struct SessionManagerConfig {
    /// Context-usage fraction at or above which a live session is rotated.
    pub rotation_threshold: f64,
    /// How recently a persisted conversation must have been updated to be
    /// eligible for recovery rather than starting fresh.
    pub recent_conversation_max_age: Duration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self { rotation_threshold: 0.70, recent_conversation_max_age: Duration::from_secs(30 * 60) }
    }
}

/// Owns the per-session-key locks guarding create/rotate/recover decisions
/// (I3: at most one `SessionState` per key at a time, transitions
/// serialized under the key's lock).
pub struct SessionLifecycleManager {
    config: SessionManagerConfig,
    table: Arc<SessionTable>,
    key_locks: Mutex<HashMap<SessionKey, Arc<Mutex<()>>>>,
}

impl SessionLifecycleManager {
    /// Build a manager sharing `table` with the router (C4).
    #[must_use]
    pub fn new(config: SessionManagerConfig, table: Arc<SessionTable>) -> Self {
        Self { config, table, key_locks: Mutex::new(HashMap::new()) }
    }

    async fn lock_for(&self, key: &SessionKey) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        locks.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Resolve the session to use for `key`: reuse, rotate, recover, or
    /// create fresh, per §4.5's three-branch decision. `new_session_params`
    /// is passed through verbatim to `session/new` whenever a fresh ACP
    /// session is required.
    ///
    /// # Errors
    ///
    /// Returns whatever [`AcpClient::new_session`] or the conversation
    /// store returns on failure.
    pub async fn get_or_create_session(
        &self,
        key: SessionKey,
        client: &AcpClient,
        conversations: &dyn ConversationStore,
        new_session_params: Value,
    ) -> Result<SessionOutcome> {
        let lock = self.lock_for(&key).await;
        let _guard = lock.lock().await;

        if let Some(existing) = self.table.get(&key).await {
            let should_rotate = existing
                .context_usage
                .as_ref()
                .is_some_and(|usage| usage.percentage >= self.config.rotation_threshold);

            if should_rotate {
                let acp_session_id = client.new_session(new_session_params).await?;
                let state = SessionState::new(key.clone(), acp_session_id, existing.conversation_id.clone());
                self.table.put(key, state.clone()).await;
                return Ok(SessionOutcome { state, is_new: false, was_rotated: true, was_recovered: false });
            }

            return Ok(SessionOutcome { state: existing, is_new: false, was_rotated: false, was_recovered: false });
        }

        let recent = conversations
            .find_latest(key.as_str())
            .await?
            .filter(|conversation| conversation.is_recent(self.config.recent_conversation_max_age));

        let acp_session_id = client.new_session(new_session_params).await?;

        match recent {
            Some(conversation) => {
                let state = SessionState::new(key.clone(), acp_session_id, Some(conversation.id));
                self.table.put(key, state.clone()).await;
                Ok(SessionOutcome { state, is_new: false, was_rotated: false, was_recovered: true })
            }
            None => {
                let state = SessionState::new(key.clone(), acp_session_id, None);
                self.table.put(key, state.clone()).await;
                Ok(SessionOutcome { state, is_new: true, was_rotated: false, was_recovered: false })
            }
        }
    }

    /// Bind a conversation id to the currently tracked state for `key`,
    /// once the orchestrator has created or resolved it (§4.7 step 4-5).
    pub async fn bind_conversation(&self, key: &SessionKey, conversation_id: String) {
        if let Some(mut state) = self.table.get(key).await {
            state.conversation_id = Some(conversation_id);
            self.table.put(key.clone(), state).await;
        }
    }

    /// Record a freshly sampled context-usage reading against `key`'s
    /// tracked state.
    pub async fn record_context_usage(&self, key: &SessionKey, usage: crate::models::session::ContextUsage) {
        if let Some(mut state) = self.table.get(key).await {
            state.context_usage = Some(usage);
            self.table.put(key.clone(), state).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acp::client::AcpClient;
    use crate::acp::jsonrpc::JsonRpcConnection;
    use crate::models::conversation::Conversation;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use tokio::io::duplex;
    use tokio_util::sync::CancellationToken;

    struct StubConversations {
        latest: Mutex<Option<Conversation>>,
    }

    #[async_trait]
    impl ConversationStore for StubConversations {
        async fn find_latest(&self, _session_key: &str) -> Result<Option<Conversation>> {
            Ok(self.latest.lock().await.clone())
        }

        async fn create(&self, session_key: &str) -> Result<Conversation> {
            let now = Utc::now();
            Ok(Conversation { id: "c1".into(), session_key: session_key.to_owned(), created_at: now, updated_at: now })
        }

        async fn touch(&self, _conversation_id: &str) -> Result<()> {
            Ok(())
        }

        async fn append_turn(&self, _conversation_id: &str, _turn: &crate::models::turn::Turn) -> Result<()> {
            Ok(())
        }

        async fn list_turns(&self, _conversation_id: &str) -> Result<Vec<crate::models::turn::Turn>> {
            Ok(vec![])
        }
    }

    async fn echoing_client() -> Arc<AcpClient> {
        let (a, b) = duplex(8192);
        let (read_a, write_a) = tokio::io::split(a);
        let (read_b, write_b) = tokio::io::split(b);
        let cancel = CancellationToken::new();

        // Peer side: answers every `session/new` with a fresh session id.
        let (peer_conn, mut peer_inbound) = JsonRpcConnection::spawn(read_b, write_b, cancel.clone());
        tokio::spawn(async move {
            let mut n = 0;
            while let Some(event) = peer_inbound.recv().await {
                if let crate::acp::jsonrpc::Inbound::Request { id, method, .. } = event {
                    if method == "session/new" {
                        n += 1;
                        let _ = peer_conn.send_response(id, json!({ "sessionId": format!("acp-{n}") })).await;
                    }
                }
            }
        });

        let (conn, inbound) = JsonRpcConnection::spawn(read_a, write_a, cancel);
        let (client, _events) = AcpClient::new(conn, inbound);
        client.initialize(json!({}), json!({})).await.expect("initialize");
        client
    }

    fn key(raw: &str) -> SessionKey {
        SessionKey::from_raw(raw.to_owned())
    }

    #[tokio::test]
    async fn creates_fresh_session_when_nothing_tracked_or_persisted() {
        let client = echoing_client().await;
        let manager = SessionLifecycleManager::new(SessionManagerConfig::default(), SessionTable::new());
        let conversations = StubConversations { latest: Mutex::new(None) };

        let outcome = manager
            .get_or_create_session(key("k1"), &client, &conversations, json!({}))
            .await
            .expect("ok");

        assert!(outcome.is_new);
        assert!(!outcome.was_rotated);
        assert!(!outcome.was_recovered);
    }

    #[tokio::test]
    async fn recovers_recent_conversation_when_no_live_session() {
        let client = echoing_client().await;
        let manager = SessionLifecycleManager::new(SessionManagerConfig::default(), SessionTable::new());
        let now = Utc::now();
        let conversations = StubConversations {
            latest: Mutex::new(Some(Conversation { id: "conv-1".into(), session_key: "k1".into(), created_at: now, updated_at: now })),
        };

        let outcome = manager
            .get_or_create_session(key("k1"), &client, &conversations, json!({}))
            .await
            .expect("ok");

        assert!(outcome.was_recovered);
        assert_eq!(outcome.state.conversation_id.as_deref(), Some("conv-1"));
    }

    #[tokio::test]
    async fn rotates_when_existing_session_over_threshold() {
        let client = echoing_client().await;
        let table = SessionTable::new();
        let manager = SessionLifecycleManager::new(SessionManagerConfig::default(), table.clone());
        let conversations = StubConversations { latest: Mutex::new(None) };

        let mut hot = SessionState::new(key("k1"), "acp-0".into(), Some("conv-x".into()));
        hot.context_usage = Some(crate::models::session::ContextUsage { percentage: 0.9, model_id: None });
        table.put(key("k1"), hot).await;

        let outcome = manager
            .get_or_create_session(key("k1"), &client, &conversations, json!({}))
            .await
            .expect("ok");

        assert!(outcome.was_rotated);
        assert_eq!(outcome.state.conversation_id.as_deref(), Some("conv-x"));
        assert_ne!(outcome.state.acp_session_id, "acp-0");
    }

    #[tokio::test]
    async fn below_threshold_reuses_existing_session_unchanged() {
        let client = echoing_client().await;
        let table = SessionTable::new();
        let manager = SessionLifecycleManager::new(SessionManagerConfig::default(), table.clone());
        let conversations = StubConversations { latest: Mutex::new(None) };

        let mut warm = SessionState::new(key("k1"), "acp-0".into(), Some("conv-x".into()));
        warm.context_usage = Some(crate::models::session::ContextUsage { percentage: 0.1, model_id: None });
        table.put(key("k1"), warm).await;

        let outcome = manager
            .get_or_create_session(key("k1"), &client, &conversations, json!({}))
            .await
            .expect("ok");

        assert!(!outcome.was_rotated);
        assert!(!outcome.is_new);
        assert_eq!(outcome.state.acp_session_id, "acp-0");
    }
}
