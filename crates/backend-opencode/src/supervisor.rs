//! Lifecycle supervisor for the locally-spawned HTTP agent server.
//!
//! Explicit state machine over `{stopped, starting, running, stopping,
//! error}` with a broadcast channel for crash notices. The server is a
//! shared resource: one supervisor instance per process, `we_started`
//! distinguishes our own child from an externally-started server we merely
//! attached to, and shutdown never touches a server we did not spawn.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use bridge_protocol::{BridgeError, BridgeResult};
use bridge_resolver::BinaryResolver;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex as AsyncMutex};

const HEALTH_PATH: &str = "/global/health";
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(100);
const EXIT_WATCH_INTERVAL: Duration = Duration::from_millis(200);
const NOTICE_BUFFER: usize = 16;
const DEFAULT_SERVER_PORT: u16 = 8787;
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;
const ENV_SERVER_STARTUP_TIMEOUT_SECS: &str = "BRIDGE_SERVER_STARTUP_TIMEOUT_SECS";
const ENV_SERVER_BASE_URL: &str = "BRIDGE_OPENCODE_SERVER_BASE_URL";

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Provider name handed to the binary resolver.
    pub provider: String,
    pub port: u16,
    /// Points at an externally-managed server; `connect` adopts it and
    /// `start` is never attempted while it stays healthy.
    pub base_url_override: Option<String>,
    /// Arguments placed before the `serve` subcommand.
    pub base_args: Vec<String>,
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            provider: "opencode".to_owned(),
            port: DEFAULT_SERVER_PORT,
            base_url_override: std::env::var(ENV_SERVER_BASE_URL)
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_owned())
                .filter(|value| !value.is_empty()),
            base_args: Vec::new(),
            startup_timeout: Duration::from_secs(
                std::env::var(ENV_SERVER_STARTUP_TIMEOUT_SECS)
                    .ok()
                    .and_then(|value| value.trim().parse::<u64>().ok())
                    .unwrap_or(DEFAULT_STARTUP_TIMEOUT_SECS),
            ),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

#[derive(Debug, Clone)]
pub enum ServerNotice {
    /// Our own child exited while the server was `Running`.
    Crashed { pid: u32 },
}

/// Observable slice of supervisor state, mainly for callers and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStateView {
    pub status: ServerStatus,
    pub pid: Option<u32>,
    pub we_started: bool,
}

struct ServerState {
    status: ServerStatus,
    pid: Option<u32>,
    we_started: bool,
    child: Option<Child>,
}

pub struct ServerSupervisor {
    config: SupervisorConfig,
    resolver: Arc<dyn BinaryResolver>,
    client: reqwest::Client,
    state: Arc<AsyncMutex<ServerState>>,
    /// Serializes the whole start critical section so a second `start()`
    /// during `starting` waits on the in-flight attempt instead of
    /// double-spawning.
    start_lock: AsyncMutex<()>,
    notices: broadcast::Sender<ServerNotice>,
}

impl ServerSupervisor {
    pub fn new(config: SupervisorConfig, resolver: Arc<dyn BinaryResolver>) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_BUFFER);
        Self {
            config,
            resolver,
            client: reqwest::Client::new(),
            state: Arc::new(AsyncMutex::new(ServerState {
                status: ServerStatus::Stopped,
                pid: None,
                we_started: false,
                child: None,
            })),
            start_lock: AsyncMutex::new(()),
            notices,
        }
    }

    pub fn base_url(&self) -> String {
        match self.config.base_url_override.as_deref() {
            Some(base_url) => base_url.to_owned(),
            None => format!("http://127.0.0.1:{}", self.config.port),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerNotice> {
        self.notices.subscribe()
    }

    pub async fn state_view(&self) -> ServerStateView {
        let state = self.state.lock().await;
        ServerStateView {
            status: state.status,
            pid: state.pid,
            we_started: state.we_started,
        }
    }

    /// Idempotent entry point: a healthy server (ours or adopted) costs one
    /// health probe and nothing else.
    pub async fn ensure_running(&self) -> BridgeResult<()> {
        if self.state.lock().await.status == ServerStatus::Running {
            if self.probe_health().await {
                return Ok(());
            }
            tracing::warn!(
                provider = self.config.provider.as_str(),
                "server marked running but unhealthy; reconnecting"
            );
            let mut state = self.state.lock().await;
            state.status = ServerStatus::Stopped;
            state.we_started = false;
            state.pid = None;
        }

        // Prefer adopting an externally-started server, e.g. one left over
        // from a previous app session.
        if self.connect().await? {
            return Ok(());
        }
        self.start().await
    }

    /// Probe for an already-running server and adopt it without owning its
    /// lifecycle. Returns whether a live server was found.
    pub async fn connect(&self) -> BridgeResult<bool> {
        if !self.probe_health().await {
            return Ok(false);
        }
        let mut state = self.state.lock().await;
        state.status = ServerStatus::Running;
        state.pid = None;
        state.we_started = false;
        state.child = None;
        tracing::info!(
            provider = self.config.provider.as_str(),
            base_url = %self.base_url(),
            "adopted externally-started agent server"
        );
        Ok(true)
    }

    pub async fn start(&self) -> BridgeResult<()> {
        let _guard = self.start_lock.lock().await;
        if self.state.lock().await.status == ServerStatus::Running {
            return Ok(());
        }

        let resolved = self.resolver.resolve(&self.config.provider)?;
        let env = self.resolver.build_env(&self.config.provider, &[]);

        let mut command = Command::new(&resolved.path);
        command.args(&self.config.base_args);
        command.arg("serve");
        command.arg("--port");
        command.arg(self.config.port.to_string());
        command.env_clear();
        command.envs(env);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);

        let mut child = command.spawn().map_err(|error| {
            if error.kind() == std::io::ErrorKind::NotFound {
                BridgeError::ExecutableNotFound(format!(
                    "{}: '{}'",
                    self.config.provider,
                    resolved.path.display()
                ))
            } else {
                BridgeError::ProcessCrash(format!(
                    "failed to spawn {} server '{}': {error}",
                    self.config.provider,
                    resolved.path.display()
                ))
            }
        })?;

        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            spawn_log_pump(stdout, &self.config.provider, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_log_pump(stderr, &self.config.provider, "stderr");
        }

        {
            let mut state = self.state.lock().await;
            state.status = ServerStatus::Starting;
            state.pid = pid;
            state.we_started = true;
            state.child = Some(child);
        }
        spawn_exit_watcher(Arc::clone(&self.state), self.notices.clone());

        if let Err(error) = self.wait_for_ready().await {
            self.force_kill_child().await;
            self.state.lock().await.status = ServerStatus::Error;
            return Err(error);
        }

        self.state.lock().await.status = ServerStatus::Running;
        tracing::info!(
            provider = self.config.provider.as_str(),
            pid,
            base_url = %self.base_url(),
            "agent server started"
        );
        Ok(())
    }

    /// Graceful stop of our own child. A no-op for adopted servers.
    pub async fn shutdown(&self) -> BridgeResult<()> {
        let child = {
            let mut state = self.state.lock().await;
            if !state.we_started {
                state.status = ServerStatus::Stopped;
                state.pid = None;
                return Ok(());
            }
            state.status = ServerStatus::Stopping;
            state.child.take()
        };

        if let Some(mut child) = child {
            terminate_gracefully(&mut child, self.config.shutdown_timeout).await;
        }

        let mut state = self.state.lock().await;
        state.status = ServerStatus::Stopped;
        state.pid = None;
        state.we_started = false;
        Ok(())
    }

    /// Sequential health polling, one outstanding probe at a time. Aborts
    /// early when the child dies before becoming healthy.
    async fn wait_for_ready(&self) -> BridgeResult<()> {
        let deadline = tokio::time::Instant::now() + self.config.startup_timeout;
        loop {
            if self.state.lock().await.child.is_none() {
                return Err(BridgeError::ProcessCrash(format!(
                    "{} server exited before becoming healthy",
                    self.config.provider
                )));
            }
            if self.probe_health().await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BridgeError::Timeout(format!(
                    "{} server failed health check at {}{HEALTH_PATH} within {:?}",
                    self.config.provider,
                    self.base_url(),
                    self.config.startup_timeout
                )));
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    async fn probe_health(&self) -> bool {
        let health_url = format!("{}{HEALTH_PATH}", self.base_url());
        match self.client.get(health_url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn force_kill_child(&self) {
        let child = {
            let mut state = self.state.lock().await;
            state.pid = None;
            state.child.take()
        };
        if let Some(mut child) = child {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

fn spawn_exit_watcher(
    state: Arc<AsyncMutex<ServerState>>,
    notices: broadcast::Sender<ServerNotice>,
) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(EXIT_WATCH_INTERVAL).await;
            let mut guard = state.lock().await;
            let Some(child) = guard.child.as_mut() else {
                // Shutdown or force-kill took ownership of the child.
                return;
            };
            match child.try_wait() {
                Ok(None) => {}
                Ok(Some(exit_status)) => {
                    let crashed = guard.status == ServerStatus::Running && guard.we_started;
                    let pid = guard.pid.unwrap_or_default();
                    guard.child = None;
                    guard.pid = None;
                    guard.we_started = false;
                    guard.status = ServerStatus::Stopped;
                    drop(guard);
                    if crashed {
                        tracing::warn!(pid, %exit_status, "agent server exited unexpectedly");
                        let _ = notices.send(ServerNotice::Crashed { pid });
                    }
                    return;
                }
                Err(_) => return,
            }
        }
    });
}

fn spawn_log_pump(
    stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    provider: &str,
    channel: &'static str,
) {
    let provider = provider.to_owned();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(
                target: "bridge_server",
                provider = provider.as_str(),
                channel,
                line = line.as_str(),
                "server output"
            );
        }
    });
}

#[cfg(unix)]
async fn terminate_gracefully(child: &mut Child, timeout: Duration) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if tokio::time::timeout(timeout, child.wait()).await.is_ok() {
            return;
        }
        tracing::warn!(pid, "agent server ignored SIGTERM; force-killing");
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn terminate_gracefully(child: &mut Child, _timeout: Duration) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}
