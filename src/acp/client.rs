//! Typed ACP client (C2): the stateful session layer over [`super::jsonrpc`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::jsonrpc::{Inbound, JsonRpcConnection};
use crate::{AppError, Result};

/// Status of one ACP session as tracked by the client (distinct from the
/// richer `SessionState` owned by the session lifecycle manager).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptStatus {
    /// No prompt in flight.
    Idle,
    /// A `session/prompt` call is awaiting its response.
    Prompting,
    /// The last prompt ended with `stopReason == "cancelled"`.
    Cancelled,
}

/// Event surfaced to the orchestrator from the ACP client.
#[derive(Debug, Clone)]
pub enum AcpEvent {
    /// A `session/update` notification forwarded from the agent.
    Update {
        /// The ACP session the update belongs to.
        session_id: String,
        /// The raw `update` payload (`sessionUpdate` discriminated union).
        update: Value,
    },
    /// A synthetic update emitted locally for an outgoing prompt's content
    /// blocks, so the orchestrator can persist user turns before the
    /// request is even sent. Tagged with `_meta.source`.
    LocalPromptEcho {
        /// The ACP session the prompt was sent to.
        session_id: String,
        /// The prompt content blocks, each carrying `_meta.source`.
        content: Value,
    },
}

/// Handler for one inbound ACP request method (`fs/read_text_file`,
/// `terminal/create`, `session/request_permission`, ...).
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle `params` and produce either a JSON-RPC result or an error
    /// `(code, message)` pair.
    async fn handle(&self, params: Value) -> std::result::Result<Value, (i64, String)>;
}

struct SessionEntry {
    status: PromptStatus,
}

/// Parameters for [`AcpClient::prompt`].
pub struct PromptParams {
    /// Target ACP session id.
    pub session_id: String,
    /// Prompt content blocks (already ACP-shaped, e.g. `[{type:"text",...}]`).
    pub prompt: Value,
    /// Who originated the prompt: `"user"` or `"system"`. Defaults to
    /// `"system"` when omitted. Stripped from the wire payload.
    pub prompt_source: Option<String>,
}

/// The typed ACP client: wraps a [`JsonRpcConnection`] with session
/// bookkeeping, the `initialize` exactly-once guard, and inbound request
/// dispatch to installed handlers.
pub struct AcpClient {
    conn: JsonRpcConnection,
    initialized: AtomicBool,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    handlers: Arc<Mutex<HashMap<String, Arc<dyn RequestHandler>>>>,
    events_tx: mpsc::Sender<AcpEvent>,
}

impl AcpClient {
    /// Build a client around an already-spawned [`JsonRpcConnection`] and
    /// start the inbound dispatch loop. Returns the client and the channel
    /// of events (`session/update` forwards and local prompt echoes).
    #[must_use]
    pub fn new(conn: JsonRpcConnection, inbound: mpsc::Receiver<Inbound>) -> (Arc<Self>, mpsc::Receiver<AcpEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let client = Arc::new(Self {
            conn,
            initialized: AtomicBool::new(false),
            sessions: Mutex::new(HashMap::new()),
            handlers: Arc::new(Mutex::new(HashMap::new())),
            events_tx,
        });

        tokio::spawn(dispatch_loop(Arc::clone(&client), inbound));

        (client, events_rx)
    }

    /// Install a handler for an inbound method name. Replaces any existing
    /// handler for the same method.
    pub async fn install_handler(&self, method: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        self.handlers.lock().await.insert(method.into(), handler);
    }

    /// Perform the `initialize` handshake. Must be called exactly once;
    /// subsequent operations fail if it has not completed.
    ///
    /// # Errors
    ///
    /// Returns whatever [`JsonRpcConnection::send_request`] returns on
    /// failure. Returns [`AppError::Protocol`] if called more than once.
    pub async fn initialize(&self, client_capabilities: Value, client_info: Value) -> Result<Value> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(AppError::Protocol("initialize called more than once".into()));
        }

        let params = json!({
            "protocolVersion": 1,
            "clientCapabilities": client_capabilities,
            "clientInfo": client_info,
        });

        self.conn.send_request("initialize", params, false).await
    }

    /// Create a new ACP session on the agent side and track it locally
    /// with `status = idle`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] if `initialize` has not completed, or
    /// whatever the underlying request returns on wire failure.
    pub async fn new_session(&self, params: Value) -> Result<String> {
        self.require_initialized()?;

        let result = self.conn.send_request("session/new", params, false).await?;
        let session_id = result
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Protocol("session/new response missing sessionId".into()))?
            .to_owned();

        self.sessions
            .lock()
            .await
            .insert(session_id.clone(), SessionEntry { status: PromptStatus::Idle });

        Ok(session_id)
    }

    /// Send a prompt to an existing session, enforcing the single-flight
    /// invariant (I2): a session already `prompting` rejects re-entry.
    ///
    /// Emits a [`AcpEvent::LocalPromptEcho`] for the outgoing content
    /// *before* the wire request is sent, so the orchestrator can persist
    /// the user turn regardless of how the agent responds.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] if a prompt is already in flight for
    /// this session, or if the session is unknown. On wire failure, resets
    /// the session back to `idle` before propagating the error.
    pub async fn prompt(&self, params: PromptParams) -> Result<Value> {
        self.require_initialized()?;

        {
            let mut sessions = self.sessions.lock().await;
            let entry = sessions
                .get_mut(&params.session_id)
                .ok_or_else(|| AppError::NotFound(format!("unknown ACP session {}", params.session_id)))?;
            if entry.status == PromptStatus::Prompting {
                return Err(AppError::Protocol(format!(
                    "session {} already prompting",
                    params.session_id
                )));
            }
            entry.status = PromptStatus::Prompting;
        }

        let source = params.prompt_source.clone().unwrap_or_else(|| "system".to_owned());
        let tagged_content = tag_prompt_source(&params.prompt, &source);
        let _ = self
            .events_tx
            .send(AcpEvent::LocalPromptEcho {
                session_id: params.session_id.clone(),
                content: tagged_content,
            })
            .await;

        let wire_params = json!({
            "sessionId": params.session_id,
            "prompt": params.prompt,
        });

        let outcome = self.conn.send_request("session/prompt", wire_params, false).await;

        let mut sessions = self.sessions.lock().await;
        let entry = sessions.get_mut(&params.session_id);

        match outcome {
            Ok(result) => {
                let stop_reason = result.get("stopReason").and_then(Value::as_str).unwrap_or("");
                if let Some(entry) = entry {
                    entry.status = if stop_reason == "cancelled" {
                        PromptStatus::Cancelled
                    } else {
                        PromptStatus::Idle
                    };
                }
                Ok(result)
            }
            Err(err) => {
                if let Some(entry) = entry {
                    entry.status = PromptStatus::Idle;
                }
                Err(err)
            }
        }
    }

    /// Best-effort cancellation of the current prompt. A `method not
    /// found` reply from the agent is swallowed (cancel is spec-optional).
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        let params = json!({ "sessionId": session_id });
        self.conn.send_request("session/cancel", params, true).await?;

        if let Some(entry) = self.sessions.lock().await.get_mut(session_id) {
            entry.status = PromptStatus::Cancelled;
        }
        Ok(())
    }

    /// Current prompt status for a session, if tracked.
    pub async fn status(&self, session_id: &str) -> Option<PromptStatus> {
        self.sessions.lock().await.get(session_id).map(|e| e.status)
    }

    fn require_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::Protocol("client not initialized".into()))
        }
    }
}

fn tag_prompt_source(prompt: &Value, source: &str) -> Value {
    let mut content = prompt.clone();
    if let Some(blocks) = content.as_array_mut() {
        for block in blocks {
            block["_meta"] = json!({ "source": source });
        }
    }
    content
}

async fn dispatch_loop(client: Arc<AcpClient>, mut inbound: mpsc::Receiver<Inbound>) {
    while let Some(event) = inbound.recv().await {
        match event {
            Inbound::Request { id, method, params } => {
                let handler = client.handlers.lock().await.get(&method).cloned();
                match handler {
                    Some(handler) => match handler.handle(params).await {
                        Ok(result) => {
                            if let Err(err) = client.conn.send_response(id, result).await {
                                warn!(%err, method, "acp client: failed to send response");
                            }
                        }
                        Err((code, message)) => {
                            if let Err(err) = client.conn.send_error(id, code, &message, None).await {
                                warn!(%err, method, "acp client: failed to send error response");
                            }
                        }
                    },
                    None => {
                        if let Err(err) = client.conn.send_method_not_found(id, &method).await {
                            warn!(%err, method, "acp client: failed to send method-not-found");
                        }
                    }
                }
            }
            Inbound::Notification { method, params } => {
                if method == "session/update" {
                    let session_id = params
                        .get("sessionId")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned();
                    let update = params.get("update").cloned().unwrap_or(Value::Null);
                    let _ = client.events_tx.send(AcpEvent::Update { session_id, update }).await;
                } else {
                    debug!(method, "acp client: dropping unrecognized notification");
                }
            }
            Inbound::Closed => {
                debug!("acp client: inbound stream closed");
                break;
            }
            Inbound::Error(err) => {
                debug!(%err, "acp client: non-fatal inbound parse error");
            }
        }
    }
}
