//! Persistent-store contracts (spec.md §6) and a `SQLite` implementation.
//!
//! The orchestrator depends only on the traits here, never on `SqlitePool`
//! directly — grounded in the teacher's `persistence/*_repo.rs` repository
//! idiom (row struct + `FromRow` + `into_*` conversion), generalized from
//! concrete repos into explicit traits so an alternate backing (e.g. an
//! in-memory store for tests) can stand in without touching orchestrator
//! code.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::models::conversation::Conversation;
use crate::models::event::{extract_text, AppendedEvent, EventType, SessionEvent};
use crate::models::turn::{EventRange, Role, Turn};
use crate::{AppError, Result};

use super::db::Database;

/// Append-only per-session event log.
#[async_trait]
pub trait SessionEventStore: Send + Sync {
    /// Append one event, assigning the next monotonic `seq` for
    /// `session_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Storage`] on a persistence failure.
    async fn append_event(&self, session_id: &str, event_type: EventType, data: Value) -> Result<AppendedEvent>;

    /// Read events for `session_id` with `seq` in `[start_seq, end_seq]`,
    /// ordered ascending.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Storage`] on a persistence failure.
    async fn read_range(&self, session_id: &str, range: EventRange) -> Result<Vec<SessionEvent>>;
}

/// Conversation and turn persistence, keyed by session key for recovery.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Return the most recently updated conversation for `session_key`,
    /// regardless of age. Callers apply their own recency test via
    /// [`Conversation::is_recent`].
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Storage`] on a persistence failure.
    async fn find_latest(&self, session_key: &str) -> Result<Option<Conversation>>;

    /// Create a fresh conversation for `session_key`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Storage`] on a persistence failure.
    async fn create(&self, session_key: &str) -> Result<Conversation>;

    /// Update `updated_at` to now.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Storage`] on a persistence failure.
    async fn touch(&self, conversation_id: &str) -> Result<()>;

    /// Append a turn pointer to `conversation_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Storage`] on a persistence failure.
    async fn append_turn(&self, conversation_id: &str, turn: &Turn) -> Result<()>;

    /// List all turns recorded under `conversation_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Storage`] on a persistence failure.
    async fn list_turns(&self, conversation_id: &str) -> Result<Vec<Turn>>;
}

/// Internal row struct for `session_event` deserialization.
#[derive(sqlx::FromRow)]
struct SessionEventRow {
    session_id: String,
    seq: i64,
    event_type: String,
    data: String,
    created_at: String,
}

impl SessionEventRow {
    fn into_event(self) -> Result<SessionEvent> {
        let event_type = EventType::parse(&self.event_type)
            .ok_or_else(|| AppError::Storage(format!("unknown event_type {}", self.event_type)))?;
        let data: Value = serde_json::from_str(&self.data)?;
        let ts = parse_ts(&self.created_at)?;
        Ok(SessionEvent { session_id: self.session_id, seq: self.seq, event_type, data, ts })
    }
}

/// Internal row struct for `conversation` deserialization.
#[derive(sqlx::FromRow)]
struct ConversationRow {
    id: String,
    session_key: String,
    created_at: String,
    updated_at: String,
}

impl ConversationRow {
    fn into_conversation(self) -> Result<Conversation> {
        Ok(Conversation {
            id: self.id,
            session_key: self.session_key,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

/// Internal row struct for `turn` deserialization.
#[derive(sqlx::FromRow)]
struct TurnRow {
    role: String,
    session_id: String,
    start_seq: i64,
    end_seq: i64,
    message_id: Option<String>,
}

impl TurnRow {
    fn into_turn(self) -> Turn {
        let role = if self.role == "user" { Role::User } else { Role::Assistant };
        Turn {
            role,
            session_id: self.session_id,
            event_range: EventRange { start_seq: self.start_seq, end_seq: self.end_seq },
            message_id: self.message_id,
        }
    }
}

fn parse_ts(raw: &str) -> Result<chrono::DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| AppError::Storage(format!("invalid timestamp: {err}")))
}

/// `SQLite`-backed [`SessionEventStore`].
#[derive(Clone)]
pub struct SqliteEventStore {
    db: Arc<Database>,
}

impl SqliteEventStore {
    /// Wrap a connected pool.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionEventStore for SqliteEventStore {
    async fn append_event(&self, session_id: &str, event_type: EventType, data: Value) -> Result<AppendedEvent> {
        let mut tx = self.db.begin().await?;

        let next_seq: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) + 1 FROM session_event WHERE session_id = ?1")
                .bind(session_id)
                .fetch_one(&mut *tx)
                .await?;

        let now = Utc::now();
        let data_text = serde_json::to_string(&data)?;

        sqlx::query(
            "INSERT INTO session_event (session_id, seq, event_type, data, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(session_id)
        .bind(next_seq)
        .bind(event_type.as_str())
        .bind(data_text)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(AppendedEvent { ts: now, seq: next_seq })
    }

    async fn read_range(&self, session_id: &str, range: EventRange) -> Result<Vec<SessionEvent>> {
        let rows: Vec<SessionEventRow> = sqlx::query_as(
            "SELECT session_id, seq, event_type, data, created_at FROM session_event
             WHERE session_id = ?1 AND seq >= ?2 AND seq <= ?3
             ORDER BY seq ASC",
        )
        .bind(session_id)
        .bind(range.start_seq)
        .bind(range.end_seq)
        .fetch_all(&*self.db)
        .await?;

        rows.into_iter().map(SessionEventRow::into_event).collect()
    }
}

/// `SQLite`-backed [`ConversationStore`].
#[derive(Clone)]
pub struct SqliteConversationStore {
    db: Arc<Database>,
}

impl SqliteConversationStore {
    /// Wrap a connected pool.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn find_latest(&self, session_key: &str) -> Result<Option<Conversation>> {
        let row: Option<ConversationRow> = sqlx::query_as(
            "SELECT id, session_key, created_at, updated_at FROM conversation
             WHERE session_key = ?1 ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(session_key)
        .fetch_optional(&*self.db)
        .await?;

        row.map(ConversationRow::into_conversation).transpose()
    }

    async fn create(&self, session_key: &str) -> Result<Conversation> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        sqlx::query("INSERT INTO conversation (id, session_key, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)")
            .bind(&id)
            .bind(session_key)
            .bind(now.to_rfc3339())
            .bind(now.to_rfc3339())
            .execute(&*self.db)
            .await?;

        Ok(Conversation { id, session_key: session_key.to_owned(), created_at: now, updated_at: now })
    }

    async fn touch(&self, conversation_id: &str) -> Result<()> {
        sqlx::query("UPDATE conversation SET updated_at = ?1 WHERE id = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(conversation_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    async fn append_turn(&self, conversation_id: &str, turn: &Turn) -> Result<()> {
        let role = match turn.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };

        sqlx::query(
            "INSERT INTO turn (conversation_id, role, session_id, start_seq, end_seq, message_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(conversation_id)
        .bind(role)
        .bind(&turn.session_id)
        .bind(turn.event_range.start_seq)
        .bind(turn.event_range.end_seq)
        .bind(&turn.message_id)
        .execute(&*self.db)
        .await?;

        self.touch(conversation_id).await
    }

    async fn list_turns(&self, conversation_id: &str) -> Result<Vec<Turn>> {
        let rows: Vec<TurnRow> = sqlx::query_as(
            "SELECT role, session_id, start_seq, end_seq, message_id FROM turn
             WHERE conversation_id = ?1 ORDER BY id ASC",
        )
        .bind(conversation_id)
        .fetch_all(&*self.db)
        .await?;

        Ok(rows.into_iter().map(TurnRow::into_turn).collect())
    }
}

/// Reconstructs a turn's plain text from the event log it points into.
///
/// Thin wrapper over a [`SessionEventStore`] — kept separate from the
/// store trait itself since reconstruction is a read-side convenience,
/// not a persistence concern (spec.md §3 "Turn").
pub struct TurnReconstructor<'a> {
    events: &'a dyn SessionEventStore,
}

impl<'a> TurnReconstructor<'a> {
    /// Borrow an event store to reconstruct turns from.
    #[must_use]
    pub fn new(events: &'a dyn SessionEventStore) -> Self {
        Self { events }
    }

    /// Concatenate the text of every event in `turn`'s range.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Storage`] if the underlying read fails.
    pub async fn reconstruct(&self, turn: &Turn) -> Result<String> {
        let events = self.events.read_range(&turn.session_id, turn.event_range).await?;
        Ok(events.iter().map(|e| extract_text(&e.data)).collect::<Vec<_>>().join(""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn memory_db() -> Arc<Database> {
        Arc::new(crate::persistence::db::connect_memory().await.expect("connect"))
    }

    #[tokio::test]
    async fn append_and_read_range_round_trips() {
        let store = SqliteEventStore::new(memory_db().await);

        let first =
            store.append_event("s1", EventType::PromptSent, json!([{"type":"text","text":"hi"}])).await.unwrap();
        let second = store
            .append_event("s1", EventType::SessionUpdate, json!({"content": {"type":"text","text":"there"}}))
            .await
            .unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);

        let events = store.read_range("s1", EventRange { start_seq: 1, end_seq: 2 }).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::PromptSent);
    }

    #[tokio::test]
    async fn conversation_create_and_find_latest() {
        let store = SqliteConversationStore::new(memory_db().await);

        let created = store.create("agent:discord:channel:c1").await.unwrap();
        let found = store.find_latest("agent:discord:channel:c1").await.unwrap().expect("should exist");
        assert_eq!(found.id, created.id);
    }

    #[tokio::test]
    async fn turn_reconstructor_joins_event_text() {
        let events = SqliteEventStore::new(memory_db().await);

        events
            .append_event("s1", EventType::SessionUpdate, json!({"content": {"type":"text","text":"hello "}}))
            .await
            .unwrap();
        events
            .append_event("s1", EventType::SessionUpdate, json!({"content": {"type":"text","text":"world"}}))
            .await
            .unwrap();

        let turn = Turn {
            role: Role::Assistant,
            session_id: "s1".into(),
            event_range: EventRange { start_seq: 1, end_seq: 2 },
            message_id: None,
        };

        let reconstructor = TurnReconstructor::new(&events);
        let text = reconstructor.reconstruct(&turn).await.unwrap();
        assert_eq!(text, "hello world");
    }
}
