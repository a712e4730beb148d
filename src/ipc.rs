//! Supervisor IPC: the client half of a restart-signal protocol, dialed
//! out from [`crate::orchestrator::Orchestrator::request_restart`] (§4.7
//! "Restart request", §5 "the supervisor process that can restart us").
//!
//! Grounded in the teacher's `ipc::server` line-delimited JSON envelope
//! and `interprocess` local-socket transport, inverted from server to
//! client since here the supervisor listens and we dial out once.

use async_trait::async_trait;
use interprocess::local_socket::tokio::prelude::*;
use interprocess::local_socket::{GenericNamespaced, ToNsName};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::models::checkpoint::Checkpoint;
use crate::{AppError, Result};

#[derive(Debug, Serialize)]
struct RestartRequest<'a> {
    command: &'static str,
    session_id: &'a str,
    restart_reason: &'a str,
}

#[derive(Debug, Deserialize)]
struct RestartAck {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Signals an external process that manages our restart. Only one call
/// matters in practice: "I am about to exit for this reason, please start
/// me again."
#[async_trait]
pub trait SupervisorIpc: Send + Sync {
    /// Send `checkpoint` to the supervisor and await its acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] if the supervisor is unreachable, or
    /// answers with `ok: false`.
    async fn signal_restart(&self, checkpoint: &Checkpoint) -> Result<()>;
}

/// The bot was not launched under supervision: every restart request
/// fails fast with a distinct error rather than hanging on a dead socket.
pub struct NoSupervisor;

#[async_trait]
impl SupervisorIpc for NoSupervisor {
    async fn signal_restart(&self, _checkpoint: &Checkpoint) -> Result<()> {
        Err(AppError::Protocol("not running under supervision".into()))
    }
}

/// Dials a supervisor's named local socket once per restart request.
pub struct LocalSocketSupervisor {
    socket_name: String,
}

impl LocalSocketSupervisor {
    /// Build a client targeting `socket_name` (the same name the
    /// supervisor's listener was created with).
    #[must_use]
    pub fn new(socket_name: impl Into<String>) -> Self {
        Self { socket_name: socket_name.into() }
    }
}

#[async_trait]
impl SupervisorIpc for LocalSocketSupervisor {
    async fn signal_restart(&self, checkpoint: &Checkpoint) -> Result<()> {
        let name = self
            .socket_name
            .clone()
            .to_ns_name::<GenericNamespaced>()
            .map_err(|err| AppError::Protocol(format!("invalid supervisor socket name: {err}")))?;

        let stream = Stream::connect(name)
            .await
            .map_err(|err| AppError::Protocol(format!("failed to reach supervisor: {err}")))?;
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);

        let request = RestartRequest {
            command: "restart",
            session_id: &checkpoint.session_id,
            restart_reason: &checkpoint.restart_reason,
        };
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;

        let mut response = String::new();
        reader.read_line(&mut response).await?;
        let ack: RestartAck = serde_json::from_str(response.trim())?;

        if ack.ok {
            Ok(())
        } else {
            Err(AppError::Protocol(ack.error.unwrap_or_else(|| "supervisor rejected restart".into())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::checkpoint::WakeContext;

    fn checkpoint() -> Checkpoint {
        Checkpoint {
            session_id: "S".into(),
            restart_reason: "planned".into(),
            wake_context: WakeContext { prompt: "continue task X".into(), pending_work: None },
        }
    }

    #[tokio::test]
    async fn no_supervisor_always_fails() {
        let err = NoSupervisor.signal_restart(&checkpoint()).await.unwrap_err();
        assert!(matches!(err, AppError::Protocol(_)));
    }
}
