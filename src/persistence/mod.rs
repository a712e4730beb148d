//! Persistence layer: the external conversation/event store contracts
//! this orchestrator consumes (spec.md §6 "Persistent-store contracts"),
//! plus a reference `SQLite` implementation grounded in the teacher's
//! `persistence/db.rs` / `persistence/schema.rs` idiom.
//!
//! The spec treats these stores as external collaborators — "we only
//! contract the read/append surface we use" — so the traits in
//! [`store`] are the actual contract; [`store::SqliteEventStore`] and
//! [`store::SqliteConversationStore`] are one conforming implementation,
//! not the contract itself.

pub mod db;
pub mod schema;
pub mod store;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;
