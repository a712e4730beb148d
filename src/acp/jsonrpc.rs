//! Full-duplex JSON-RPC 2.0 framing over two independent byte streams.
//!
//! Frames are UTF-8 JSON objects, one per line, with blank lines ignored.
//! There is no `Content-Length` framing — NDJSON only (see [`super::codec`]).
//! Inbound lines are classified by structural inspection: the presence of
//! `"result"` or `"error"` makes a line a response; otherwise the presence
//! of `"id"` makes it a request, and its absence makes it a notification.
//!
//! The correlation table maps an outbound request id to a pending resolver.
//! When the connection closes, every pending resolver is failed with
//! [`AppError::ConnectionClosed`] — a single bad line must never poison the
//! rest of the stream, and a closed stream must never leave a caller
//! waiting forever.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::codec::AcpCodec;
use crate::errors::{INTERNAL_ERROR, INVALID_REQUEST, METHOD_NOT_FOUND};
use crate::{AppError, Result};

/// An inbound event surfaced to the layer above the correlation table.
#[derive(Debug)]
pub enum Inbound {
    /// A request the peer expects a matching response or error for.
    Request {
        /// Correlation id to echo back in the reply.
        id: Value,
        /// Method name.
        method: String,
        /// Method parameters, if any.
        params: Value,
    },
    /// A fire-and-forget notification; no reply is expected.
    Notification {
        /// Method name.
        method: String,
        /// Method parameters, if any.
        params: Value,
    },
    /// The inbound stream ended (agent exited or closed its stdout).
    Closed,
    /// A line failed to parse or didn't match the JSON-RPC envelope shape.
    /// The connection keeps running; this is purely informational.
    Error(String),
}

type PendingResolver = oneshot::Sender<std::result::Result<Value, AppError>>;

struct Shared {
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, PendingResolver>>,
    outbound_tx: mpsc::Sender<Value>,
}

/// A JSON-RPC 2.0 connection over a pair of async byte streams.
///
/// Cloning shares the same correlation table and outbound channel; cheap
/// clones are expected (the reader task, the writer task, and every client
/// call site each hold one).
#[derive(Clone)]
pub struct JsonRpcConnection {
    shared: Arc<Shared>,
}

impl JsonRpcConnection {
    /// Spawn the reader and writer tasks for a connection and return a
    /// handle plus the channel of inbound events.
    ///
    /// `cancel` stops both tasks; on cancellation the reader task emits
    /// [`Inbound::Closed`] and the correlation table is drained with
    /// [`AppError::ConnectionClosed`], matching the behavior of a genuine
    /// stream close.
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<Inbound>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);

        let shared = Arc::new(Shared {
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            outbound_tx,
        });

        let conn = Self {
            shared: Arc::clone(&shared),
        };

        tokio::spawn(run_writer(writer, outbound_rx, cancel.clone()));
        tokio::spawn(run_reader(reader, shared, inbound_tx, cancel));

        (conn, inbound_rx)
    }

    /// Send a request and await the matching response.
    ///
    /// `silent_method_not_found`: when the remote answers with
    /// `-32601 method not found`, treat it as success with `Value::Null`
    /// instead of propagating `AppError::Remote` — used for methods the
    /// remote may not implement.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ConnectionClosed`] if the connection closes
    /// before a response arrives, or [`AppError::Remote`] if the peer
    /// replies with a JSON-RPC error (unless swallowed as above).
    pub async fn send_request(
        &self,
        method: &str,
        params: Value,
        silent_method_not_found: bool,
    ) -> Result<Value> {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, tx);

        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        if self.shared.outbound_tx.send(frame).await.is_err() {
            self.shared.pending.lock().await.remove(&id);
            return Err(AppError::ConnectionClosed);
        }

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(AppError::Remote { code, message })) if silent_method_not_found && code == METHOD_NOT_FOUND => {
                Ok(Value::Null)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(AppError::ConnectionClosed),
        }
    }

    /// Write a successful response for a prior inbound request.
    pub async fn send_response(&self, id: Value, result: Value) -> Result<()> {
        let frame = json!({ "jsonrpc": "2.0", "id": id, "result": result });
        self.write(frame).await
    }

    /// Write an error response for a prior inbound request.
    pub async fn send_error(&self, id: Value, code: i64, message: &str, data: Option<Value>) -> Result<()> {
        let mut error = json!({ "code": code, "message": message });
        if let Some(data) = data {
            error["data"] = data;
        }
        let frame = json!({ "jsonrpc": "2.0", "id": id, "error": error });
        self.write(frame).await
    }

    /// Write a method-not-found error, the standard reply for any method
    /// name with no mounted handler.
    pub async fn send_method_not_found(&self, id: Value, method: &str) -> Result<()> {
        self.send_error(id, METHOD_NOT_FOUND, &format!("method not found: {method}"), None)
            .await
    }

    /// Write a fire-and-forget notification.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let frame = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.write(frame).await
    }

    async fn write(&self, frame: Value) -> Result<()> {
        self.shared
            .outbound_tx
            .send(frame)
            .await
            .map_err(|_| AppError::ConnectionClosed)
    }
}

async fn run_writer<W>(writer: W, mut outbound_rx: mpsc::Receiver<Value>, cancel: CancellationToken)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = FramedWrite::new(writer, AcpCodec::new());
    use futures_util::SinkExt;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            maybe_frame = outbound_rx.recv() => {
                let Some(frame) = maybe_frame else { break };
                let line = match serde_json::to_string(&frame) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(%err, "jsonrpc: failed to serialize outbound frame");
                        continue;
                    }
                };
                if let Err(err) = framed.send(line).await {
                    warn!(%err, "jsonrpc: write failed, closing writer task");
                    break;
                }
            }
        }
    }
}

async fn run_reader<R>(
    reader: R,
    shared: Arc<Shared>,
    inbound_tx: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut framed = FramedRead::new(reader, AcpCodec::new());

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            line = framed.next() => {
                match line {
                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        handle_line(&line, &shared, &inbound_tx).await;
                    }
                    Some(Err(err)) => {
                        warn!(%err, "jsonrpc: codec error, continuing");
                        let _ = inbound_tx.send(Inbound::Error(err.to_string())).await;
                    }
                    None => break,
                }
            }
        }
    }

    drain_pending(&shared).await;
    let _ = inbound_tx.send(Inbound::Closed).await;
}

async fn handle_line(line: &str, shared: &Arc<Shared>, inbound_tx: &mpsc::Sender<Inbound>) {
    let parsed: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(err) => {
            debug!(%err, raw = line, "jsonrpc: malformed line, skipping");
            let _ = inbound_tx.send(Inbound::Error(format!("malformed json: {err}"))).await;
            return;
        }
    };

    if !parsed.is_object() {
        let _ = inbound_tx
            .send(Inbound::Error("jsonrpc line is not a JSON object".into()))
            .await;
        return;
    }

    if parsed.get("result").is_some() || parsed.get("error").is_some() {
        resolve_response(parsed, shared).await;
        return;
    }

    let method = parsed.get("method").and_then(Value::as_str).map(str::to_owned);
    let params = parsed.get("params").cloned().unwrap_or(Value::Null);

    match (method, parsed.get("id").cloned()) {
        (Some(method), Some(id)) => {
            let _ = inbound_tx.send(Inbound::Request { id, method, params }).await;
        }
        (Some(method), None) => {
            let _ = inbound_tx.send(Inbound::Notification { method, params }).await;
        }
        (None, _) => {
            let _ = inbound_tx
                .send(Inbound::Error("jsonrpc line has neither result/error nor method".into()))
                .await;
        }
    }
}

async fn resolve_response(parsed: Value, shared: &Arc<Shared>) {
    let Some(id) = parsed.get("id").and_then(Value::as_i64) else {
        warn!("jsonrpc: response with non-integer or missing id, dropping");
        return;
    };

    let Some(resolver) = shared.pending.lock().await.remove(&id) else {
        debug!(id, "jsonrpc: response for unknown or already-resolved id, dropping");
        return;
    };

    if let Some(error) = parsed.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(INTERNAL_ERROR);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown remote error")
            .to_owned();
        let _ = resolver.send(Err(AppError::Remote { code, message }));
    } else {
        let result = parsed.get("result").cloned().unwrap_or(Value::Null);
        let _ = resolver.send(Ok(result));
    }
}

async fn drain_pending(shared: &Arc<Shared>) {
    let mut pending = shared.pending.lock().await;
    for (_, resolver) in pending.drain() {
        let _ = resolver.send(Err(AppError::ConnectionClosed));
    }
}

/// Build a standard "invalid request" error payload for malformed inbound
/// lines that nonetheless carried an id worth replying to.
#[must_use]
pub fn invalid_request_error(message: &str) -> (i64, String) {
    (INVALID_REQUEST, message.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn request_resolves_on_matching_response() {
        let (client_io, mut agent_io) = duplex(4096);
        let (read_half, write_half) = tokio::io::split(client_io);
        let cancel = CancellationToken::new();
        let (conn, _inbound) = JsonRpcConnection::spawn(read_half, write_half, cancel.clone());

        let handle = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send_request("ping", Value::Null, false).await }
        });

        // Read the outbound request line from the "agent" side and reply.
        let mut buf = vec![0u8; 4096];
        let n = tokio::io::AsyncReadExt::read(&mut agent_io, &mut buf).await.expect("read");
        let line = String::from_utf8_lossy(&buf[..n]);
        let request: Value = serde_json::from_str(line.trim()).expect("parse request");
        let id = request["id"].clone();

        let response = json!({ "jsonrpc": "2.0", "id": id, "result": "pong" });
        let mut response_line = serde_json::to_vec(&response).expect("serialize");
        response_line.push(b'\n');
        tokio::io::AsyncWriteExt::write_all(&mut agent_io, &response_line)
            .await
            .expect("write response");

        let result = handle.await.expect("join").expect("request should succeed");
        assert_eq!(result, Value::String("pong".into()));
        cancel.cancel();
    }

    #[tokio::test]
    async fn close_fails_all_pending_requests() {
        let (client_io, agent_io) = duplex(4096);
        let (read_half, write_half) = tokio::io::split(client_io);
        let cancel = CancellationToken::new();
        let (conn, _inbound) = JsonRpcConnection::spawn(read_half, write_half, cancel.clone());

        let handle = tokio::spawn(async move { conn.send_request("ping", Value::Null, false).await });

        drop(agent_io);

        let result = handle.await.expect("join");
        assert!(matches!(result, Err(AppError::ConnectionClosed)));
    }
}
