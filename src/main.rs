#![forbid(unsafe_code)]

//! `kynetic-botd` — persistent chat-bot orchestrator binary.
//!
//! Bootstraps configuration, the `SQLite` persistence layer, every
//! configured agent's lifecycle, and a console channel adapter, then runs
//! the orchestrator until a shutdown signal arrives.
//!
//! Platform SDK integration (Discord gateway, intents, REST, ...) is out
//! of scope for this crate (spec §1); the console channel here exists so
//! the binary is runnable standalone, the way the teacher's stdio
//! transport let `agent-intercom` run without a live MCP client attached.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use kynetic_bot::channel::{Channel, SendOutcome};
use kynetic_bot::config::OrchestratorConfig;
use kynetic_bot::ipc::{LocalSocketSupervisor, NoSupervisor, SupervisorIpc};
use kynetic_bot::models::message::{NormalizedMessage, Sender};
use kynetic_bot::orchestrator::{Orchestrator, OrchestratorParams};
use kynetic_bot::persistence::db;
use kynetic_bot::persistence::store::{SqliteConversationStore, SqliteEventStore};
use kynetic_bot::session::context_usage::{ContextUsageParser, RegexContextUsageParser};
use kynetic_bot::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "kynetic-botd", about = "Persistent chat-bot orchestrator", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    ///
    /// Defaults to `config.toml` in the current working directory, which
    /// is the expected layout for a portable installation (binary +
    /// config.toml in the same folder).
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Which configured agent the console channel routes typed messages
    /// to. Defaults to the first agent in the config file.
    #[arg(long)]
    agent: Option<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("kynetic-botd bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = OrchestratorConfig::load_from_path(&args.config)?;
    info!(agents = config.agents.len(), "configuration loaded");

    let db_path = config.db_path.to_string_lossy().to_string();
    let db = Arc::new(db::connect(&db_path).await?);
    info!("database connected");

    let events = Arc::new(SqliteEventStore::new(Arc::clone(&db)));
    let conversations = Arc::new(SqliteConversationStore::new(Arc::clone(&db)));

    let agent_name =
        args.agent.clone().or_else(|| config.agents.first().map(|agent| agent.name.clone())).ok_or_else(|| {
            AppError::Config("at least one agent must be configured to select a default route".into())
        })?;

    let agent_configs = config.agents.iter().map(|agent| config.lifecycle_config(agent)).collect();

    let supervisor: Arc<dyn SupervisorIpc> = match &config.ipc_socket_name {
        Some(name) => Arc::new(LocalSocketSupervisor::new(name.clone())),
        None => Arc::new(NoSupervisor),
    };

    let context_parser: Arc<dyn ContextUsageParser> = Arc::new(RegexContextUsageParser::new());
    let channel: Arc<dyn Channel> = Arc::new(ConsoleChannel::new());

    let params = OrchestratorParams {
        agent_configs,
        channel: Arc::clone(&channel),
        events,
        conversations,
        identity_path: config.identity_path.clone(),
        checkpoint_path: config.checkpoint_path.clone(),
        supervisor,
        session_manager_config: config.session_manager_config(),
        context_parser,
        shutdown_timeout: config.shutdown_timeout(),
    };

    let orchestrator = Orchestrator::new(params).await;
    orchestrator.start().await?;
    info!(agent = %agent_name, "orchestrator running");

    let console_task = {
        let orchestrator = Arc::clone(&orchestrator);
        let agent_name = agent_name.clone();
        tokio::spawn(async move { run_console_loop(orchestrator, agent_name).await })
    };

    shutdown_signal().await;
    info!("shutdown signal received — starting graceful shutdown");
    console_task.abort();

    if let Err(err) = orchestrator.stop().await {
        error!(%err, "error during graceful shutdown");
    }

    info!("kynetic-botd shut down");
    Ok(())
}

/// Read lines from stdin, normalize each as a message from a synthetic
/// `"console"` user, and hand it to `handle_message` for `agent_name`.
/// Exists purely to make the binary runnable without a platform adapter
/// wired in; real deployments replace this with a Discord/etc. adapter
/// driving the same `handle_message` entry point.
async fn run_console_loop(orchestrator: Arc<Orchestrator>, agent_name: String) {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(%err, "console channel: stdin read failed");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let msg = NormalizedMessage {
            id: uuid::Uuid::new_v4().to_string(),
            text: line,
            sender: Sender { id: "console-user".into(), platform: "console".into(), display_name: None },
            channel: "console".into(),
            timestamp: Utc::now(),
            metadata: std::collections::HashMap::new(),
        };

        if let Err(err) = orchestrator.handle_message(msg, &agent_name).await {
            warn!(%err, "console channel: message handling failed");
        }
    }
}

/// A [`Channel`] that prints sends/edits to stdout and never streams
/// incrementally, for standalone/local operation of the binary. Grounded
/// in the same "direct invocation, no remote client" niche the teacher's
/// stdio transport filled, reduced here to the `Channel` trait's shape.
struct ConsoleChannel {
    messages: Mutex<Vec<String>>,
}

impl ConsoleChannel {
    fn new() -> Self {
        Self { messages: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl Channel for ConsoleChannel {
    async fn send_message(&self, channel: &str, text: &str, reply_to: Option<&str>) -> Result<SendOutcome> {
        let mut messages = self.messages.lock().await;
        let id = format!("console-{}", messages.len());
        messages.push(text.to_owned());
        drop(messages);

        let mut stdout = std::io::stdout();
        if let Some(reply_to) = reply_to {
            let _ = writeln!(stdout, "[{channel}] (re: {reply_to}) {text}");
        } else {
            let _ = writeln!(stdout, "[{channel}] {text}");
        }
        Ok(SendOutcome::single(id))
    }

    async fn edit_message(&self, channel: &str, message_id: &str, text: &str) -> Result<SendOutcome> {
        let mut stdout = std::io::stdout();
        let _ = writeln!(stdout, "[{channel}] (edit {message_id}) {text}");
        Ok(SendOutcome::single(message_id.to_owned()))
    }

    async fn start_typing_loop(&self, _channel: &str, _message_id: &str) {}

    async fn stop_typing_loop(&self, _channel: &str) {}

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) {}

    fn supports_streaming(&self) -> bool {
        false
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
