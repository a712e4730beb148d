#![forbid(unsafe_code)]

//! `kynetic-botd`: a persistent chat-bot orchestrator that bridges a
//! messaging platform to a long-running agent subprocess speaking the
//! Agent Client Protocol over stdio.

pub mod acp;
pub mod channel;
pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod fs_safety;
pub mod identity;
pub mod ipc;
pub mod lifecycle;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod router;
pub mod session;
pub mod streaming;

pub use errors::{AppError, Result};
