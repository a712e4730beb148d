//! Checkpoint file handling: write-before-restart, read-once-at-startup,
//! exactly-once consumption (§5 "Checkpoint file" resource policy).

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{info, instrument, warn};

use crate::models::checkpoint::Checkpoint;
use crate::Result;

/// Owns the checkpoint file path and the in-memory reference loaded at
/// startup. The reference is cleared the moment it is consumed; it is
/// never re-read from disk after that.
pub struct CheckpointStore {
    path: PathBuf,
    loaded: Option<Checkpoint>,
}

impl CheckpointStore {
    /// Load the checkpoint at `path`, if present and well-formed.
    ///
    /// Invalid or absent checkpoints are treated as "start cleanly": this
    /// never fails the caller, it only logs a warning on parse failure.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn load(path: PathBuf) -> Self {
        let loaded = match fs::read_to_string(&path).await {
            Ok(contents) => match parse_checkpoint(&contents) {
                Ok(checkpoint) => {
                    info!(session_id = %checkpoint.session_id, "checkpoint: loaded");
                    Some(checkpoint)
                }
                Err(err) => {
                    warn!(%err, "checkpoint: present but invalid, starting cleanly");
                    None
                }
            },
            Err(_) => None,
        };

        Self { path, loaded }
    }

    /// Peek at the loaded checkpoint without consuming it.
    #[must_use]
    pub fn peek(&self) -> Option<&Checkpoint> {
        self.loaded.as_ref()
    }

    /// Consume the loaded checkpoint (if any): takes the in-memory value
    /// and deletes the on-disk file. Safe to call even if nothing was
    /// loaded. Never re-reads the file afterward (P8).
    #[instrument(skip(self))]
    pub async fn consume(&mut self) -> Option<Checkpoint> {
        let checkpoint = self.loaded.take()?;
        if let Err(err) = fs::remove_file(&self.path).await {
            warn!(%err, "checkpoint: consumed in-memory but failed to delete file");
        }
        info!(session_id = %checkpoint.session_id, "checkpoint: consumed");
        Some(checkpoint)
    }

    /// Delete the on-disk checkpoint without consuming the in-memory
    /// value, used when a prompt-injection failure occurs after a
    /// checkpoint was written for a restart that never completed (P8).
    pub async fn delete(path: &Path) {
        if let Err(err) = fs::remove_file(path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(%err, path = %path.display(), "checkpoint: failed to delete");
            }
        }
    }

    /// Write a fresh checkpoint to disk ahead of a planned restart.
    pub async fn write(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
        let serialized = serde_yaml::to_string(checkpoint)?;
        fs::write(path, serialized).await?;
        Ok(())
    }
}

fn parse_checkpoint(contents: &str) -> Result<Checkpoint> {
    let checkpoint: Checkpoint = serde_yaml::from_str(contents)?;
    if checkpoint.session_id.trim().is_empty() {
        return Err(crate::AppError::Config("checkpoint session_id must not be empty".into()));
    }
    if checkpoint.wake_context.prompt.trim().is_empty() {
        return Err(crate::AppError::Config("checkpoint wake_context.prompt must not be empty".into()));
    }
    Ok(checkpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::checkpoint::WakeContext;

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("checkpoint.yaml");
        let store = CheckpointStore::load(path).await;
        assert!(store.peek().is_none());
    }

    #[tokio::test]
    async fn consume_deletes_file_and_clears_reference() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("checkpoint.yaml");
        let checkpoint = Checkpoint {
            session_id: "S".into(),
            restart_reason: "planned".into(),
            wake_context: WakeContext { prompt: "continue task X".into(), pending_work: None },
        };
        CheckpointStore::write(&path, &checkpoint).await.expect("write");

        let mut store = CheckpointStore::load(path.clone()).await;
        assert!(store.peek().is_some());

        let consumed = store.consume().await.expect("should consume");
        assert_eq!(consumed.session_id, "S");
        assert!(store.consume().await.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn invalid_yaml_falls_back_to_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("checkpoint.yaml");
        fs::write(&path, "not: [valid, checkpoint").await.expect("write garbage");
        let store = CheckpointStore::load(path).await;
        assert!(store.peek().is_none());
    }
}
