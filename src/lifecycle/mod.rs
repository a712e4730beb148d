//! Agent Lifecycle (C3): spawn/health/stop state machine for one agent
//! subprocess, plus the ACP handlers it mounts.
//!
//! The health loop is a `tokio::select!` timer driven by
//! `tokio::time::interval` and cancelled via a `CancellationToken`, the same
//! shape the teacher's stall detector uses for its own timeout loop —
//! generalized here from stall escalation to health-check-failure
//! escalation with exponential backoff.

pub mod handlers;
pub mod spawner;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::acp::client::{AcpClient, AcpEvent};
use crate::acp::jsonrpc::JsonRpcConnection;
use crate::{AppError, Result};
use spawner::{ExitNotice, ProcessHandle, SpawnConfig, SpawnedChild, DEFAULT_SHUTDOWN_TIMEOUT};

/// Lifecycle states (§4.3). `idle`/`failed`/`unhealthy` are the states
/// `spawn()` accepts from; every other state rejects a new spawn request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentLifecycleState {
    /// No process running, nothing in flight.
    Idle,
    /// A spawn attempt is in progress.
    Spawning,
    /// Process alive and the last health check passed.
    Healthy,
    /// Process alive (or just lost) but health checks are failing.
    Unhealthy,
    /// Graceful shutdown (`SIGTERM`, then wait) is in progress.
    Stopping,
    /// Immediate shutdown (`SIGKILL`, no wait) is in progress.
    Terminating,
    /// The most recent spawn attempt errored before reaching `healthy`.
    Failed,
}

/// Events the lifecycle surfaces to its owner (normally C7).
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// Emitted after every health check that changes or confirms status.
    HealthStatus {
        /// Whether the agent is currently considered healthy.
        healthy: bool,
        /// Whether this reading follows a prior unhealthy reading.
        recovered: bool,
    },
    /// Backoff reached its cap after a failed respawn; no further
    /// automatic respawn will be attempted.
    Escalate {
        /// Human-readable reason, propagated from the failing spawn.
        reason: String,
    },
    /// `stop()`/`kill()` has finished; emitted exactly once per shutdown.
    ShutdownComplete,
    /// A spawn attempt failed.
    Error(String),
}

/// Tunables for one [`AgentLifecycle`], defaulted to the values in §5.
#[derive(Debug, Clone)]
pub struct AgentLifecycleConfig {
    /// Name of the agent this lifecycle manages, used for logging and as
    /// the lookup key C5/C7 use to find this lifecycle.
    pub agent_name: String,
    /// How to spawn the agent subprocess.
    pub spawn: SpawnConfig,
    /// Interval between health checks while not shutting down.
    pub health_check_interval: Duration,
    /// Consecutive health-check failures before marking `unhealthy`.
    pub failure_threshold: u32,
    /// Initial respawn backoff.
    pub backoff_initial: Duration,
    /// Multiplier applied to the backoff after each failure.
    pub backoff_multiplier: u32,
    /// Backoff cap; once reached, a failed respawn triggers escalation.
    pub backoff_max: Duration,
    /// How long `stop()` waits for a graceful exit before `SIGKILL`.
    pub shutdown_timeout: Duration,
    /// How long `spawn()` waits for `initialize()` before treating the
    /// attempt as failed.
    pub agent_ready_timeout: Duration,
}

impl AgentLifecycleConfig {
    /// Build a config with the §5 defaults (health 30s, backoff 1s/60s x2,
    /// shutdown 10s, agent-ready 30s).
    #[must_use]
    pub fn new(agent_name: impl Into<String>, spawn: SpawnConfig) -> Self {
        Self {
            agent_name: agent_name.into(),
            spawn,
            health_check_interval: Duration::from_secs(30),
            failure_threshold: 3,
            backoff_initial: Duration::from_secs(1),
            backoff_multiplier: 2,
            backoff_max: Duration::from_secs(60),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            agent_ready_timeout: Duration::from_secs(30),
        }
    }
}

/// Owns one agent subprocess across its full spawn/health/respawn/stop
/// life: the single source of truth C5 and C7 consult for "is the agent
/// usable right now".
pub struct AgentLifecycle {
    config: AgentLifecycleConfig,
    state: Mutex<AgentLifecycleState>,
    client: Mutex<Option<Arc<AcpClient>>>,
    process: Mutex<Option<ProcessHandle>>,
    session_id: Mutex<Option<String>>,
    consecutive_failures: AtomicU32,
    backoff_ms: AtomicU64,
    respawning: AtomicBool,
    shutdown_emitted: AtomicBool,
    spawn_queue: Mutex<VecDeque<oneshot::Sender<Result<()>>>>,
    exit_waiter: Mutex<Option<oneshot::Sender<()>>>,
    events_tx: mpsc::Sender<LifecycleEvent>,
    acp_events_tx: mpsc::Sender<AcpEvent>,
    stderr_tx: broadcast::Sender<String>,
}

impl AgentLifecycle {
    /// Construct a new, idle lifecycle. Returns the lifecycle plus the two
    /// event streams its owner should drain: lifecycle-level events and
    /// forwarded ACP events (`session/update`, local prompt echoes).
    #[must_use]
    pub fn new(config: AgentLifecycleConfig) -> (Arc<Self>, mpsc::Receiver<LifecycleEvent>, mpsc::Receiver<AcpEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (acp_events_tx, acp_events_rx) = mpsc::channel(256);
        let (stderr_tx, _) = broadcast::channel(256);
        let initial_backoff_ms = config.backoff_initial.as_millis() as u64;

        let lifecycle = Arc::new(Self {
            config,
            state: Mutex::new(AgentLifecycleState::Idle),
            client: Mutex::new(None),
            process: Mutex::new(None),
            session_id: Mutex::new(None),
            consecutive_failures: AtomicU32::new(0),
            backoff_ms: AtomicU64::new(initial_backoff_ms),
            respawning: AtomicBool::new(false),
            shutdown_emitted: AtomicBool::new(false),
            spawn_queue: Mutex::new(VecDeque::new()),
            exit_waiter: Mutex::new(None),
            events_tx,
            acp_events_tx,
            stderr_tx,
        });

        (lifecycle, events_rx, acp_events_rx)
    }

    /// Subscribe to the agent's raw stderr lines, most recent spawn only.
    /// Used by the context-usage tracker (C5); lagging subscribers simply
    /// miss older lines rather than blocking the forwarder.
    #[must_use]
    pub fn subscribe_stderr(&self) -> broadcast::Receiver<String> {
        self.stderr_tx.subscribe()
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> AgentLifecycleState {
        *self.state.lock().await
    }

    /// The live ACP client, if the agent is currently spawned.
    pub async fn client(&self) -> Option<Arc<AcpClient>> {
        self.client.lock().await.clone()
    }

    /// Record the ACP session id the health loop should verify the client
    /// still knows about, and that a respawn should carry forward via
    /// `KYNETIC_SESSION_ID`.
    pub async fn set_session_id(&self, session_id: Option<String>) {
        *self.session_id.lock().await = session_id;
    }

    /// Spawn (or queue a spawn behind an in-flight one). See §4.3: from
    /// `idle|failed|unhealthy` proceeds; from `spawning` enqueues (FIFO,
    /// resolved in order); from any other state fails outright.
    ///
    /// # Errors
    ///
    /// Returns the underlying spawn failure, or [`AppError::Protocol`] if
    /// called from a state that doesn't accept a new spawn.
    pub async fn spawn(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            match *state {
                AgentLifecycleState::Idle | AgentLifecycleState::Failed | AgentLifecycleState::Unhealthy => {
                    *state = AgentLifecycleState::Spawning;
                }
                AgentLifecycleState::Spawning => {
                    drop(state);
                    return self.enqueue_spawn_wait().await;
                }
                other => return Err(AppError::Protocol(format!("cannot spawn from state {other:?}"))),
            }
        }

        self.spawn_inner().await
    }

    async fn enqueue_spawn_wait(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.spawn_queue.lock().await.push_back(tx);
        rx.await.map_err(|_| AppError::Protocol("spawn queue dropped before resolution".into()))?
    }

    async fn drain_spawn_queue(&self, result: &Result<()>) {
        let mut queue = self.spawn_queue.lock().await;
        while let Some(tx) = queue.pop_front() {
            let _ = tx.send(result.clone());
        }
    }

    async fn spawn_inner(self: &Arc<Self>) -> Result<()> {
        let session_id = self.session_id.lock().await.clone();
        let overrides = HashMap::new();

        let span = info_span!("agent_spawn", agent = %self.config.agent_name);
        let outcome = self.try_spawn_once(session_id.as_deref(), &overrides).instrument(span).await;

        match outcome {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.backoff_ms.store(self.config.backoff_initial.as_millis() as u64, Ordering::SeqCst);
                *self.state.lock().await = AgentLifecycleState::Healthy;
                self.start_health_loop();
                self.drain_spawn_queue(&Ok(())).await;
                Ok(())
            }
            Err(err) => {
                warn!(%err, agent = %self.config.agent_name, "lifecycle: spawn failed");
                let _ = self.events_tx.send(LifecycleEvent::Error(err.to_string())).await;
                *self.state.lock().await = AgentLifecycleState::Failed;
                self.advance_backoff();
                self.drain_spawn_queue(&Err(err.clone())).await;
                Err(err)
            }
        }
    }

    async fn try_spawn_once(
        self: &Arc<Self>,
        session_id_hint: Option<&str>,
        overrides: &HashMap<String, String>,
    ) -> Result<()> {
        let spawned = spawner::spawn_child(&self.config.spawn, session_id_hint, overrides)?;
        let SpawnedChild { child, stdin, stdout, stderr } = spawned;

        self.forward_stderr(stderr);

        let (exit_tx, mut exit_rx) = mpsc::channel(1);
        let process_handle = spawner::spawn_supervisor(child, exit_tx);

        let cancel = CancellationToken::new();
        let (conn, inbound) = JsonRpcConnection::spawn(stdout, stdin, cancel.clone());
        let (client, client_events_rx) = AcpClient::new(conn, inbound);

        handlers::install_all(&client, self.config.spawn.workspace_root.clone()).await;

        let init = client.initialize(
            json!({}),
            json!({ "name": "kynetic-botd", "version": env!("CARGO_PKG_VERSION") }),
        );

        let ready = tokio::select! {
            biased;
            notice = exit_rx.recv() => {
                Err(AppError::Spawn(format!("agent exited during initialize: {notice:?}")))
            }
            result = tokio::time::timeout(self.config.agent_ready_timeout, init) => {
                match result {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(AppError::Spawn("initialize timed out".into())),
                }
            }
        };

        if let Err(err) = ready {
            process_handle.kill().await;
            cancel.cancel();
            return Err(err);
        }

        *self.client.lock().await = Some(Arc::clone(&client));
        *self.process.lock().await = Some(process_handle);
        self.forward_acp_events(client_events_rx);
        self.watch_exit(exit_rx);

        Ok(())
    }

    fn forward_stderr(&self, stderr: tokio::process::ChildStderr) {
        let tx = self.stderr_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let _ = tx.send(line);
                    }
                    Ok(None) => return,
                    Err(err) => {
                        debug!(%err, "lifecycle: stderr read failed");
                        return;
                    }
                }
            }
        });
    }

    fn forward_acp_events(&self, mut rx: mpsc::Receiver<AcpEvent>) {
        let tx = self.acp_events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });
    }

    /// Test-only seam: mark this lifecycle healthy with a pre-built client
    /// instead of spawning a real subprocess, so orchestrator tests can
    /// exercise the full ACP round trip against an in-process fake peer.
    #[cfg(test)]
    pub(crate) async fn install_test_client(
        &self,
        client: Arc<AcpClient>,
        client_events_rx: mpsc::Receiver<AcpEvent>,
        session_id: impl Into<String>,
    ) {
        *self.client.lock().await = Some(client);
        *self.state.lock().await = AgentLifecycleState::Healthy;
        self.set_session_id(Some(session_id.into())).await;
        self.forward_acp_events(client_events_rx);
    }

    fn watch_exit(self: &Arc<Self>, mut exit_rx: mpsc::Receiver<ExitNotice>) {
        let lifecycle = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(notice) = exit_rx.recv().await {
                if let Some(tx) = lifecycle.exit_waiter.lock().await.take() {
                    let _ = tx.send(());
                }
                if !notice.requested {
                    lifecycle.handle_unexpected_exit(notice).await;
                }
            }
        });
    }

    async fn handle_unexpected_exit(self: &Arc<Self>, notice: ExitNotice) {
        let current = *self.state.lock().await;
        if matches!(current, AgentLifecycleState::Stopping | AgentLifecycleState::Terminating) {
            info!("lifecycle: exit during shutdown, expected");
            return;
        }

        warn!(exit_code = notice.exit_code, "lifecycle: unexpected agent exit");
        *self.state.lock().await = AgentLifecycleState::Unhealthy;
        *self.process.lock().await = None;
        *self.client.lock().await = None;
        self.schedule_respawn();
    }

    fn start_health_loop(self: &Arc<Self>) {
        let lifecycle = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(lifecycle.config.health_check_interval);
            loop {
                interval.tick().await;
                let state = lifecycle.state().await;
                if matches!(
                    state,
                    AgentLifecycleState::Stopping | AgentLifecycleState::Terminating | AgentLifecycleState::Idle
                ) {
                    return;
                }
                lifecycle.run_health_check().await;
            }
        });
    }

    async fn run_health_check(self: &Arc<Self>) {
        let process_alive = self.process.lock().await.is_some();
        let client = self.client.lock().await.clone();
        let client_alive = client.is_some();

        let session_known = match (&client, self.session_id.lock().await.as_deref()) {
            (Some(client), Some(session_id)) => client.status(session_id).await.is_some(),
            _ => true,
        };

        let healthy = process_alive && client_alive && session_known;

        if healthy {
            let recovered = {
                let mut state = self.state.lock().await;
                let was_unhealthy = *state == AgentLifecycleState::Unhealthy;
                if was_unhealthy {
                    *state = AgentLifecycleState::Healthy;
                }
                was_unhealthy
            };
            self.consecutive_failures.store(0, Ordering::SeqCst);
            let _ = self.events_tx.send(LifecycleEvent::HealthStatus { healthy: true, recovered }).await;
        } else {
            let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            if failures >= self.config.failure_threshold {
                self.mark_unhealthy_and_respawn().await;
            }
        }
    }

    async fn mark_unhealthy_and_respawn(self: &Arc<Self>) {
        *self.state.lock().await = AgentLifecycleState::Unhealthy;
        let _ = self.events_tx.send(LifecycleEvent::HealthStatus { healthy: false, recovered: false }).await;
        if let Some(process) = self.process.lock().await.take() {
            process.kill().await;
        }
        *self.client.lock().await = None;
        self.schedule_respawn();
    }

    fn current_backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms.load(Ordering::SeqCst))
    }

    fn backoff_at_max(&self) -> bool {
        self.backoff_ms.load(Ordering::SeqCst) >= self.config.backoff_max.as_millis() as u64
    }

    fn advance_backoff(&self) -> Duration {
        let max_ms = self.config.backoff_max.as_millis() as u64;
        let mult = u64::from(self.config.backoff_multiplier);
        let prev = self.backoff_ms.load(Ordering::SeqCst);
        let next = prev.saturating_mul(mult).min(max_ms);
        self.backoff_ms.store(next, Ordering::SeqCst);
        Duration::from_millis(prev)
    }

    fn schedule_respawn(self: &Arc<Self>) {
        if self.respawning.swap(true, Ordering::SeqCst) {
            return;
        }

        let lifecycle = Arc::clone(self);
        tokio::spawn(async move {
            let wait = lifecycle.current_backoff();
            tokio::time::sleep(wait).await;
            let was_at_max = lifecycle.backoff_at_max();
            lifecycle.advance_backoff();

            let result = lifecycle.spawn().await;
            lifecycle.respawning.store(false, Ordering::SeqCst);

            if let Err(err) = result {
                warn!(%err, "lifecycle: respawn attempt failed");
                if was_at_max {
                    let _ = lifecycle
                        .events_tx
                        .send(LifecycleEvent::Escalate { reason: err.to_string() })
                        .await;
                }
            }
        });
    }

    /// Graceful stop: `SIGTERM`, race the exit against `shutdownTimeout`,
    /// `SIGKILL` on timeout. Emits `ShutdownComplete` exactly once.
    pub async fn stop(self: &Arc<Self>) -> Result<()> {
        self.shutdown(true).await
    }

    /// Immediate stop: `SIGKILL`, no grace period.
    pub async fn kill(self: &Arc<Self>) -> Result<()> {
        self.shutdown(false).await
    }

    async fn shutdown(self: &Arc<Self>, graceful: bool) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if *state == AgentLifecycleState::Spawning {
                drop(state);
                tokio::time::sleep(Duration::from_millis(200)).await;
                state = self.state.lock().await;
                if *state == AgentLifecycleState::Spawning {
                    drop(state);
                    return self.force_kill().await;
                }
            }
            *state = if graceful { AgentLifecycleState::Stopping } else { AgentLifecycleState::Terminating };
        }

        let process = self.process.lock().await.take();
        *self.client.lock().await = None;

        if let Some(process) = process {
            let (tx, rx) = oneshot::channel();
            *self.exit_waiter.lock().await = Some(tx);

            if graceful {
                process.terminate().await;
                if tokio::time::timeout(self.config.shutdown_timeout, rx).await.is_err() {
                    warn!(agent = %self.config.agent_name, "lifecycle: graceful shutdown timed out, killing");
                    process.kill().await;
                }
            } else {
                process.kill().await;
                let _ = rx.await;
            }
        }

        *self.state.lock().await = AgentLifecycleState::Idle;
        self.emit_shutdown_complete().await;
        Ok(())
    }

    async fn force_kill(self: &Arc<Self>) -> Result<()> {
        if let Some(process) = self.process.lock().await.take() {
            process.kill().await;
        }
        *self.client.lock().await = None;
        *self.state.lock().await = AgentLifecycleState::Idle;
        self.emit_shutdown_complete().await;
        Ok(())
    }

    async fn emit_shutdown_complete(&self) {
        if !self.shutdown_emitted.swap(true, Ordering::SeqCst) {
            let _ = self.events_tx.send(LifecycleEvent::ShutdownComplete).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(host_cli: &str) -> AgentLifecycleConfig {
        AgentLifecycleConfig::new(
            "test-agent",
            SpawnConfig {
                host_cli: host_cli.into(),
                host_cli_args: vec![],
                workspace_root: std::env::temp_dir(),
                user_env: HashMap::new(),
            },
        )
    }

    #[tokio::test]
    async fn starts_idle() {
        let (lifecycle, _events, _acp_events) = AgentLifecycle::new(config("true"));
        assert_eq!(lifecycle.state().await, AgentLifecycleState::Idle);
    }

    #[tokio::test]
    async fn spawn_from_healthy_state_is_rejected() {
        let mut cfg = config("true");
        cfg.agent_ready_timeout = Duration::from_millis(200);
        let (lifecycle, _events, _acp_events) = AgentLifecycle::new(cfg);

        *lifecycle.state.lock().await = AgentLifecycleState::Healthy;
        let err = lifecycle.spawn().await.unwrap_err();
        assert!(matches!(err, AppError::Protocol(_)));
    }

    #[tokio::test]
    async fn spawn_fails_when_child_exits_before_initialize() {
        let mut cfg = config("true");
        cfg.agent_ready_timeout = Duration::from_millis(500);
        let (lifecycle, _events, _acp_events) = AgentLifecycle::new(cfg);

        let err = lifecycle.spawn().await.unwrap_err();
        assert!(matches!(err, AppError::Spawn(_)));
        assert_eq!(lifecycle.state().await, AgentLifecycleState::Failed);
    }
}
