//! Agent Client Protocol (ACP) stream handling.
//!
//! This module implements full-duplex JSON-RPC 2.0 framing over a pair of
//! independent byte streams — the agent subprocess's stdout (inbound) and
//! stdin (outbound) — and a typed client layered on top that speaks the
//! session-oriented half of ACP.
//!
//! # Submodules
//!
//! - [`codec`]: [`tokio_util::codec::LinesCodec`]-based NDJSON framing with a
//!   1 MiB per-line limit.
//! - [`jsonrpc`]: the correlation-table-backed connection (C1): assigns
//!   request ids, resolves pending requests as responses arrive, and
//!   classifies inbound lines as request / response / error / notification.
//! - [`client`]: [`client::AcpClient`] (C2), the stateful session layer over
//!   `jsonrpc` — `initialize`, `new_session`, `prompt`, `cancel`, and inbound
//!   request dispatch to installed handlers.

pub mod client;
pub mod codec;
pub mod jsonrpc;
