//! Checkpoint file model, consumed exactly once on startup after a planned
//! restart (see [`crate::checkpoint`] for the file-handling logic).

use serde::{Deserialize, Serialize};

/// The one-shot wake prompt a checkpoint carries across a restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WakeContext {
    /// The prompt text to inject as the wake prompt.
    pub prompt: String,
    /// Optional free-form description of work left in progress.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pending_work: Option<String>,
}

/// On-disk checkpoint, written before a planned restart and deleted after
/// its wake context is injected into the first new session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    /// The session id that was active when the checkpoint was written.
    pub session_id: String,
    /// Human-readable reason for the restart (`"planned"`, a crash
    /// description, ...).
    pub restart_reason: String,
    /// The wake prompt to inject once a new session for that key opens.
    pub wake_context: WakeContext,
}
