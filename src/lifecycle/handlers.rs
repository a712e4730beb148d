//! ACP inbound request handlers mounted by the Agent Lifecycle (C3):
//! file I/O, permission prompts, and the terminal surface.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::warn;

use crate::acp::client::{AcpClient, RequestHandler};
use crate::errors::INVALID_PARAMS;
use crate::fs_safety::validate_path;
use crate::models::terminal::{ExitStatus, TerminalSession};

/// Mount the standard fs/terminal/permission handler set on `client`.
pub async fn install_all(client: &AcpClient, workspace_root: PathBuf) -> Arc<TerminalRegistry> {
    let registry = Arc::new(TerminalRegistry::default());

    client
        .install_handler("fs/read_text_file", Arc::new(ReadFileHandler { workspace_root: workspace_root.clone() }))
        .await;
    client
        .install_handler("fs/write_text_file", Arc::new(WriteFileHandler { workspace_root: workspace_root.clone() }))
        .await;
    client
        .install_handler("session/request_permission", Arc::new(PermissionHandler))
        .await;
    client
        .install_handler(
            "terminal/create",
            Arc::new(TerminalCreateHandler { workspace_root, registry: Arc::clone(&registry) }),
        )
        .await;
    client
        .install_handler("terminal/output", Arc::new(TerminalOutputHandler { registry: Arc::clone(&registry) }))
        .await;
    client
        .install_handler(
            "terminal/wait_for_exit",
            Arc::new(TerminalWaitHandler { registry: Arc::clone(&registry) }),
        )
        .await;
    client
        .install_handler("terminal/kill", Arc::new(TerminalKillHandler { registry: Arc::clone(&registry) }))
        .await;
    client
        .install_handler(
            "terminal/release",
            Arc::new(TerminalReleaseHandler { registry: Arc::clone(&registry) }),
        )
        .await;

    registry
}

/// Shared table of live terminal sessions, keyed by synthetic terminal id.
#[derive(Default)]
pub struct TerminalRegistry {
    terminals: Mutex<HashMap<String, TerminalSession>>,
    next_id: AtomicU64,
}

impl TerminalRegistry {
    fn next_terminal_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("term-{n}")
    }
}

struct ReadFileHandler {
    workspace_root: PathBuf,
}

#[async_trait]
impl RequestHandler for ReadFileHandler {
    async fn handle(&self, params: Value) -> std::result::Result<Value, (i64, String)> {
        let path = params
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| (INVALID_PARAMS, "missing 'path'".to_owned()))?;
        let line = params.get("line").and_then(Value::as_u64).map(|n| n as usize);
        let limit = params.get("limit").and_then(Value::as_u64).map(|n| n as usize);

        let resolved = validate_path(&self.workspace_root, path).map_err(|err| (INVALID_PARAMS, err.to_string()))?;

        let contents = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|err| (INVALID_PARAMS, format!("read failed: {err}")))?;

        let sliced = match line {
            Some(start) if start >= 1 => {
                let lines: Vec<&str> = contents.lines().collect();
                let start_idx = start - 1;
                let end_idx = limit.map_or(lines.len(), |limit| (start_idx + limit).min(lines.len()));
                if start_idx >= lines.len() {
                    String::new()
                } else {
                    lines[start_idx..end_idx].join("\n")
                }
            }
            _ => contents,
        };

        Ok(json!({ "content": sliced }))
    }
}

struct WriteFileHandler {
    workspace_root: PathBuf,
}

#[async_trait]
impl RequestHandler for WriteFileHandler {
    async fn handle(&self, params: Value) -> std::result::Result<Value, (i64, String)> {
        let path = params
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| (INVALID_PARAMS, "missing 'path'".to_owned()))?;
        let content = params
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| (INVALID_PARAMS, "missing 'content'".to_owned()))?;

        let resolved = validate_path(&self.workspace_root, path).map_err(|err| (INVALID_PARAMS, err.to_string()))?;

        tokio::fs::write(&resolved, content)
            .await
            .map_err(|err| (INVALID_PARAMS, format!("write failed: {err}")))?;

        Ok(Value::Null)
    }
}

/// MVP permission policy: auto-select the first option whose `kind` is
/// `allow_once` or `allow_always`; otherwise the first option; otherwise
/// respond `{outcome: "cancelled"}`.
struct PermissionHandler;

#[async_trait]
impl RequestHandler for PermissionHandler {
    async fn handle(&self, params: Value) -> std::result::Result<Value, (i64, String)> {
        let options = params.get("options").and_then(Value::as_array).cloned().unwrap_or_default();

        let chosen = options
            .iter()
            .find(|opt| matches!(opt.get("kind").and_then(Value::as_str), Some("allow_once" | "allow_always")))
            .or_else(|| options.first());

        match chosen {
            Some(option) => Ok(json!({ "outcome": "selected", "optionId": option.get("optionId") })),
            None => Ok(json!({ "outcome": "cancelled" })),
        }
    }
}

struct TerminalCreateHandler {
    workspace_root: PathBuf,
    registry: Arc<TerminalRegistry>,
}

#[async_trait]
impl RequestHandler for TerminalCreateHandler {
    async fn handle(&self, params: Value) -> std::result::Result<Value, (i64, String)> {
        let command = params
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| (INVALID_PARAMS, "missing 'command'".to_owned()))?;
        let args: Vec<String> = params
            .get("args")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect())
            .unwrap_or_default();

        let mut cmd = Command::new(command);
        cmd.args(&args)
            .current_dir(&self.workspace_root)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| (INVALID_PARAMS, format!("spawn failed: {err}")))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let terminal_id = self.registry.next_terminal_id();
        let session = TerminalSession::new(terminal_id.clone(), child);
        self.registry.terminals.lock().await.insert(terminal_id.clone(), session);

        if let Some(stdout) = stdout {
            tokio::spawn(pump_output(Arc::clone(&self.registry), terminal_id.clone(), stdout));
        }
        if let Some(stderr) = stderr {
            tokio::spawn(pump_output(Arc::clone(&self.registry), terminal_id.clone(), stderr));
        }
        tokio::spawn(watch_exit(Arc::clone(&self.registry), terminal_id.clone()));

        Ok(json!({ "terminalId": terminal_id }))
    }
}

/// Copy bytes from a child's stdout/stderr pipe into its terminal's output
/// buffer until the pipe closes or the terminal is released.
async fn pump_output(registry: Arc<TerminalRegistry>, terminal_id: String, mut reader: impl tokio::io::AsyncRead + Unpin) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                let mut terminals = registry.terminals.lock().await;
                match terminals.get_mut(&terminal_id) {
                    Some(session) => session.append_output(&buf[..n]),
                    None => return,
                }
            }
        }
    }
}

/// Poll a terminal's child until it exits, recording its exit status.
/// Stops polling once the terminal is released or already exited.
async fn watch_exit(registry: Arc<TerminalRegistry>, terminal_id: String) {
    loop {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut terminals = registry.terminals.lock().await;
        let Some(session) = terminals.get_mut(&terminal_id) else { return };
        if session.exited {
            return;
        }
        let Some(process) = session.process.as_mut() else { return };
        match process.try_wait() {
            Ok(Some(status)) => {
                session.mark_exited(ExitStatus { exit_code: status.code(), signal: unix_signal(&status) });
                return;
            }
            Ok(None) => {}
            Err(_) => return,
        }
    }
}

#[cfg(unix)]
fn unix_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn unix_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

struct TerminalOutputHandler {
    registry: Arc<TerminalRegistry>,
}

#[async_trait]
impl RequestHandler for TerminalOutputHandler {
    async fn handle(&self, params: Value) -> std::result::Result<Value, (i64, String)> {
        let terminal_id = terminal_id_param(&params)?;
        let mut terminals = self.registry.terminals.lock().await;
        let session = terminals
            .get_mut(&terminal_id)
            .ok_or_else(|| (INVALID_PARAMS, format!("unknown terminal {terminal_id}")))?;

        let output = session.drain_output();
        let output_text = String::from_utf8_lossy(&output).into_owned();

        Ok(json!({
            "output": output_text,
            "truncated": session.truncated,
            "exited": session.exited,
            "exitCode": session.exit_status.exit_code,
            "signal": session.exit_status.signal,
        }))
    }
}

struct TerminalWaitHandler {
    registry: Arc<TerminalRegistry>,
}

#[async_trait]
impl RequestHandler for TerminalWaitHandler {
    async fn handle(&self, params: Value) -> std::result::Result<Value, (i64, String)> {
        let terminal_id = terminal_id_param(&params)?;
        let (tx, rx) = tokio::sync::oneshot::channel();

        {
            let mut terminals = self.registry.terminals.lock().await;
            let session = terminals
                .get_mut(&terminal_id)
                .ok_or_else(|| (INVALID_PARAMS, format!("unknown terminal {terminal_id}")))?;
            session.wait_for_exit(tx);
        }

        let status: ExitStatus = rx.await.map_err(|_| (INVALID_PARAMS, "terminal dropped before exit".to_owned()))?;
        Ok(json!({ "exitCode": status.exit_code, "signal": status.signal }))
    }
}

struct TerminalKillHandler {
    registry: Arc<TerminalRegistry>,
}

#[async_trait]
impl RequestHandler for TerminalKillHandler {
    async fn handle(&self, params: Value) -> std::result::Result<Value, (i64, String)> {
        let terminal_id = terminal_id_param(&params)?;
        let mut terminals = self.registry.terminals.lock().await;
        let session = terminals
            .get_mut(&terminal_id)
            .ok_or_else(|| (INVALID_PARAMS, format!("unknown terminal {terminal_id}")))?;

        if let Some(process) = session.process.as_mut() {
            if let Err(err) = process.kill().await {
                warn!(%err, terminal_id, "lifecycle: terminal kill failed");
            }
        }
        session.mark_exited(ExitStatus { exit_code: None, signal: None });

        Ok(Value::Null)
    }
}

struct TerminalReleaseHandler {
    registry: Arc<TerminalRegistry>,
}

#[async_trait]
impl RequestHandler for TerminalReleaseHandler {
    async fn handle(&self, params: Value) -> std::result::Result<Value, (i64, String)> {
        let terminal_id = terminal_id_param(&params)?;
        let mut terminals = self.registry.terminals.lock().await;
        if let Some(mut session) = terminals.remove(&terminal_id) {
            if !session.exited {
                if let Some(process) = session.process.as_mut() {
                    let _ = process.kill().await;
                }
            }
        }
        Ok(Value::Null)
    }
}

fn terminal_id_param(params: &Value) -> std::result::Result<String, (i64, String)> {
    params
        .get("terminalId")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| (INVALID_PARAMS, "missing 'terminalId'".to_owned()))
}
