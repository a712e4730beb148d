//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS` — safe to
//! re-run on every server startup and produces a convergent result.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// Creates the `conversation`, `session_event` and `turn` tables
/// idempotently. Safe to call on every startup.
///
/// # Errors
///
/// Returns [`crate::AppError::Storage`] if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS conversation (
    id              TEXT PRIMARY KEY NOT NULL,
    session_key     TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS session_event (
    session_id      TEXT NOT NULL,
    seq             INTEGER NOT NULL,
    event_type      TEXT NOT NULL CHECK(event_type IN ('prompt.sent','session.update')),
    data            TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    PRIMARY KEY (session_id, seq)
);

CREATE TABLE IF NOT EXISTS turn (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL,
    role            TEXT NOT NULL CHECK(role IN ('user','assistant')),
    session_id      TEXT NOT NULL,
    start_seq       INTEGER NOT NULL,
    end_seq         INTEGER NOT NULL,
    message_id      TEXT
);

CREATE INDEX IF NOT EXISTS idx_conversation_session_key ON conversation(session_key);
CREATE INDEX IF NOT EXISTS idx_turn_conversation ON turn(conversation_id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
