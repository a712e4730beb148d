//! Process spawning and child supervision for the Agent Lifecycle (C3).
//!
//! Builds the agent subprocess with an isolated environment, wires its
//! stdio into the ACP client, and runs a small supervisor task that turns
//! `kill`/`terminate` requests and the child's own exit into a single
//! channel of [`ExitNotice`]s the lifecycle state machine reacts to.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{AppError, Result};

/// Reserved environment variable name: always `"true"` in the agent's
/// environment, lets the agent detect it's running under this orchestrator.
pub const ENV_KYNETIC_AGENT: &str = "KYNETIC_AGENT";
/// Reserved environment variable name carrying the current session id, or
/// empty if none is tracked yet.
pub const ENV_KYNETIC_SESSION_ID: &str = "KYNETIC_SESSION_ID";

/// Process environment variables inherited from the orchestrator's own
/// environment before user/config vars are layered on top. Everything else
/// is stripped via `env_clear()` so unrelated secrets never reach the
/// agent process.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "RUST_LOG",
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Everything needed to spawn the agent subprocess.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Host CLI binary to execute (e.g. `claude`, a wrapper script).
    pub host_cli: String,
    /// Arguments passed to the host CLI.
    pub host_cli_args: Vec<String>,
    /// Working directory for the child process.
    pub workspace_root: PathBuf,
    /// User/config-supplied environment variables, layered after the
    /// process-env allowlist and before call-site overrides.
    pub user_env: HashMap<String, String>,
}

/// Build the child's environment following the precedence order: process
/// env allowlist, then reserved `KYNETIC_*` vars, then user env, then
/// call-site overrides. Later entries win, so a user- or override-supplied
/// `KYNETIC_AGENT`/`KYNETIC_SESSION_ID` takes precedence over the reserved
/// default.
#[must_use]
pub fn build_env(
    config: &SpawnConfig,
    session_id: Option<&str>,
    overrides: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env = HashMap::new();

    for &key in ALLOWED_ENV_VARS {
        if let Ok(value) = std::env::var(key) {
            env.insert(key.to_owned(), value);
        }
    }

    env.insert(ENV_KYNETIC_AGENT.to_owned(), "true".to_owned());
    env.insert(ENV_KYNETIC_SESSION_ID.to_owned(), session_id.unwrap_or("").to_owned());

    for (key, value) in &config.user_env {
        env.insert(key.clone(), value.clone());
    }

    for (key, value) in overrides {
        env.insert(key.clone(), value.clone());
    }

    env
}

/// A live, spawned agent process plus handles for its stdio.
pub struct SpawnedChild {
    /// The child itself, already stripped of its stdin/stdout/stderr handles.
    pub child: Child,
    /// Writable handle to the child's stdin (outbound ACP frames).
    pub stdin: tokio::process::ChildStdin,
    /// Readable handle to the child's stdout (inbound ACP frames).
    pub stdout: tokio::process::ChildStdout,
    /// Readable handle to the child's stderr, consumed line-by-line by the
    /// context-usage tracker. Never mixed into the ACP frame stream.
    pub stderr: tokio::process::ChildStderr,
}

/// Spawn the agent subprocess with an isolated environment and piped
/// stdio.
///
/// # Errors
///
/// Returns [`AppError::Spawn`] if the OS spawn call fails or stdio
/// handles cannot be captured.
pub fn spawn_child(config: &SpawnConfig, session_id: Option<&str>, overrides: &HashMap<String, String>) -> Result<SpawnedChild> {
    let env = build_env(config, session_id, overrides);

    let mut cmd = Command::new(&config.host_cli);
    for arg in &config.host_cli_args {
        cmd.arg(arg);
    }

    cmd.env_clear();
    for (key, value) in &env {
        cmd.env(key, value);
    }

    cmd.current_dir(&config.workspace_root)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|err| AppError::Spawn(format!("failed to spawn agent: {err}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture agent stderr".into()))?;

    Ok(SpawnedChild { child, stdin, stdout, stderr })
}

/// A control message sent to the child supervisor task.
#[derive(Debug, Clone, Copy)]
pub enum ChildControl {
    /// Send `SIGTERM` (unix) or request cooperative exit, then wait.
    Terminate,
    /// Kill immediately (`SIGKILL` on unix).
    Kill,
}

/// Why the supervised child's exit was reported.
#[derive(Debug, Clone)]
pub struct ExitNotice {
    /// Process exit code, if available.
    pub exit_code: Option<i32>,
    /// Whether the exit followed an explicit control message from us,
    /// versus the process exiting on its own.
    pub requested: bool,
}

/// Handle for sending control messages to a running supervisor task.
#[derive(Clone)]
pub struct ProcessHandle {
    control_tx: mpsc::Sender<ChildControl>,
}

impl ProcessHandle {
    /// Request graceful termination.
    pub async fn terminate(&self) {
        let _ = self.control_tx.send(ChildControl::Terminate).await;
    }

    /// Request immediate termination.
    pub async fn kill(&self) {
        let _ = self.control_tx.send(ChildControl::Kill).await;
    }
}

/// Spawn the supervisor task that owns `child` for the rest of its life:
/// reacts to [`ChildControl`] messages and reports exit via `exit_tx`.
#[must_use]
pub fn spawn_supervisor(mut child: Child, exit_tx: mpsc::Sender<ExitNotice>) -> ProcessHandle {
    let (control_tx, mut control_rx) = mpsc::channel(4);
    let pid = child.id();

    tokio::spawn(async move {
        let mut requested = false;

        loop {
            tokio::select! {
                biased;
                ctrl = control_rx.recv() => {
                    match ctrl {
                        Some(ChildControl::Kill) => {
                            requested = true;
                            if let Err(err) = child.start_kill() {
                                warn!(%err, "lifecycle: failed to send kill to child");
                            }
                        }
                        Some(ChildControl::Terminate) => {
                            requested = true;
                            terminate_gracefully(pid);
                        }
                        None => {}
                    }
                }
                status = child.wait() => {
                    let exit_code = status.ok().and_then(|s| s.code());
                    info!(exit_code, requested, "lifecycle: child process exited");
                    let _ = exit_tx.send(ExitNotice { exit_code, requested }).await;
                    return;
                }
            }
        }
    });

    ProcessHandle { control_tx }
}

#[cfg(unix)]
fn terminate_gracefully(pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(%err, pid, "lifecycle: failed to send SIGTERM");
        }
    }
}

#[cfg(not(unix))]
fn terminate_gracefully(_pid: Option<u32>) {
    // No portable graceful-terminate outside unix; callers fall back to
    // waiting out the shutdown timeout and then issuing Kill.
}

/// Default wait before a `Terminate` escalates to `Kill` if the caller
/// doesn't hear an exit notice.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SpawnConfig {
        SpawnConfig {
            host_cli: "true".into(),
            host_cli_args: vec![],
            workspace_root: PathBuf::from("."),
            user_env: HashMap::new(),
        }
    }

    #[test]
    fn user_env_overrides_reserved_vars() {
        let mut cfg = config();
        cfg.user_env.insert(ENV_KYNETIC_AGENT.to_owned(), "false".to_owned());
        cfg.user_env.insert(ENV_KYNETIC_SESSION_ID.to_owned(), "user-supplied".to_owned());
        let env = build_env(&cfg, Some("S1"), &HashMap::new());
        assert_eq!(env.get(ENV_KYNETIC_AGENT).map(String::as_str), Some("false"));
        assert_eq!(env.get(ENV_KYNETIC_SESSION_ID).map(String::as_str), Some("user-supplied"));
    }

    #[test]
    fn overrides_win_over_user_env_for_non_reserved_keys() {
        let mut cfg = config();
        cfg.user_env.insert("FOO".to_owned(), "from-user".to_owned());
        let mut overrides = HashMap::new();
        overrides.insert("FOO".to_owned(), "from-call-site".to_owned());
        let env = build_env(&cfg, None, &overrides);
        assert_eq!(env.get("FOO").map(String::as_str), Some("from-call-site"));
        assert_eq!(env.get(ENV_KYNETIC_SESSION_ID).map(String::as_str), Some(""));
    }
}
