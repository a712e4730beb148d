//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
///
/// Variants follow the taxonomy by *kind*, not by originating crate: each
/// one names the failure mode a caller needs to branch on rather than the
/// library that happened to surface it.
#[derive(Debug, Clone)]
pub enum AppError {
    /// Bad JSON or a JSON-RPC message that doesn't match the envelope
    /// shape. Logged and skipped; never poisons the rest of the stream.
    Protocol(String),
    /// The remote side answered a request with a JSON-RPC error object.
    Remote {
        /// JSON-RPC error code.
        code: i64,
        /// Human-readable error message from the remote.
        message: String,
    },
    /// The underlying stream ended or the child process exited while
    /// requests were still outstanding.
    ConnectionClosed,
    /// The agent subprocess failed to start, or exited during the
    /// initialize handshake.
    Spawn(String),
    /// A health check predicate failed.
    Health(String),
    /// A message could not be routed: unknown agent name or an
    /// unroutable peer.
    Routing(String),
    /// Turn or event persistence failed. Non-fatal to message handling.
    Storage(String),
    /// A platform send/edit failed mid-stream; aborts the coalescer.
    Coalescer(String),
    /// Automatic respawn has reached max backoff or an unrecoverable
    /// agent state; no further auto-respawn will be attempted.
    Escalation(String),
    /// Configuration parsing or validation failure.
    Config(String),
    /// File system path failed validation against the workspace root.
    PathViolation(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Caller is not authorized to perform the requested action.
    Unauthorized(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Remote { code, message } => write!(f, "remote error {code}: {message}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Health(msg) => write!(f, "health: {msg}"),
            Self::Routing(msg) => write!(f, "routing: {msg}"),
            Self::Storage(msg) => write!(f, "storage: {msg}"),
            Self::Coalescer(msg) => write!(f, "coalescer: {msg}"),
            Self::Escalation(msg) => write!(f, "escalation: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::PathViolation(msg) => write!(f, "path violation: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(format!("invalid yaml: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// JSON-RPC reserved error code: method not found.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC reserved error code: invalid request.
pub const INVALID_REQUEST: i64 = -32600;
/// JSON-RPC reserved error code: invalid params.
pub const INVALID_PARAMS: i64 = -32602;
/// JSON-RPC reserved error code: internal error.
pub const INTERNAL_ERROR: i64 = -32603;
