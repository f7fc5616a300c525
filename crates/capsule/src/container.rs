//! Container - one supervised worker and everything it holds.
//!
//! Lifecycle: `Starting` only exists inside [`Container::start`]; callers get
//! a `Running` container or an error. `close`/`kill` move to `Closed` and are
//! no-ops afterwards.
//!
//! Teardown order is fixed: close channel, wait for exit, close listener,
//! stop pump, deregister the termination hook, release the HTTP client,
//! delete the owned data directory. Every step runs; the first error wins.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use crate::bridge::protocol::MessageCount;
use crate::commander::{Commander, ControlError};
use crate::hook::{self, HookRegistration};
use crate::http::WorkerHttpClient;
use crate::launch::{DEFAULT_ENTRY_POINT, LaunchSpec, LaunchSpecBuilder};
use crate::services::{ConfigService, ServiceError, TraceService};
use crate::supervisor::{ByteCounter, ProcessSupervisor, SupervisorError, WorkerProcess};

/// Worker executable, when not set on the config.
pub const WORKER_BIN_ENV: &str = "CAPSULE_WORKER_BIN";
pub const ACCEPT_TIMEOUT_ENV: &str = "CAPSULE_ACCEPT_TIMEOUT_SECS";
/// `0` or `false` disables the log spy.
pub const LOG_SPY_ENV: &str = "CAPSULE_LOG_SPY";
/// Agent artifact, when not set on the config.
pub const AGENT_ENV: &str = "CAPSULE_AGENT";

/// Looked for next to the worker executable when no agent is configured.
pub const AGENT_FILE_NAME: &str = "capsule-agent";

pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// How often `execute_app` asks whether the workload's traces have landed.
pub const EXECUTE_APP_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Give up waiting for traces after this long; the workload keeps running.
pub const EXECUTE_APP_TIMEOUT: Duration = Duration::from_secs(5);

const DATA_DIR_PREFIX: &str = "capsule-datadir";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Starting,
    Running,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("failed to launch {}: {source}", program.display())]
    LaunchFailed {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The worker never dialed back. It has been killed and its control
    /// listener closed.
    #[error("worker did not connect within {bound:?}")]
    HandshakeTimeout {
        bound: Duration,
        pid: Option<u32>,
        control_port: u16,
    },
    /// The worker came up but could not serve. `pid` and `control_port`
    /// identify what was released, when known.
    #[error("worker failed to start: {reason}")]
    StartupFailed {
        reason: String,
        pid: Option<u32>,
        control_port: Option<u16>,
    },
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("{0}")]
    Assertion(String),
    #[error("container is {0:?}, not running")]
    NotRunning(ContainerState),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<SupervisorError> for ContainerError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::LaunchFailed { program, source } => {
                Self::LaunchFailed { program, source }
            }
            SupervisorError::HandshakeTimeout {
                bound,
                pid,
                control_port,
            } => Self::HandshakeTimeout {
                bound,
                pid,
                control_port,
            },
            SupervisorError::ExitedBeforeConnect(status) => {
                Self::StartupFailed {
                    reason: format!("worker exited before connecting ({status})"),
                    pid: None,
                    control_port: None,
                }
            }
            SupervisorError::Io(e) => Self::Io(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub worker_program: PathBuf,
    /// Borrowed data directory. `None` creates a temporary one owned (and
    /// deleted) by the container.
    pub data_dir: Option<PathBuf>,
    /// 0 lets the worker pick.
    pub ui_port: u16,
    pub use_file_db: bool,
    /// Shared containers ignore `close(false)`.
    pub shared: bool,
    pub log_spy_enabled: bool,
    pub accept_timeout: Option<Duration>,
    /// How long teardown waits for the worker before SIGKILL.
    pub kill_timeout: Duration,
    pub library_path: Option<String>,
    /// `None` falls back to a `capsule-agent` beside the worker, if present.
    pub agent: Option<PathBuf>,
    pub extra_args: Vec<String>,
    pub entry_point: String,
    /// Copy `--instrument=` flags from our own argv.
    pub passthrough: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            worker_program: std::env::var_os(WORKER_BIN_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ENTRY_POINT)),
            data_dir: None,
            ui_port: 0,
            use_file_db: false,
            shared: false,
            log_spy_enabled: std::env::var(LOG_SPY_ENV)
                .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false"))
                .unwrap_or(true),
            accept_timeout: Some(
                std::env::var(ACCEPT_TIMEOUT_ENV)
                    .ok()
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_ACCEPT_TIMEOUT),
            ),
            kill_timeout: DEFAULT_KILL_TIMEOUT,
            library_path: None,
            agent: std::env::var_os(AGENT_ENV)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            extra_args: Vec::new(),
            entry_point: DEFAULT_ENTRY_POINT.to_string(),
            passthrough: true,
        }
    }
}

impl ContainerConfig {
    pub fn new(worker_program: impl Into<PathBuf>) -> Self {
        Self {
            worker_program: worker_program.into(),
            ..Self::default()
        }
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_ui_port(mut self, port: u16) -> Self {
        self.ui_port = port;
        self
    }

    pub fn with_file_db(mut self, use_file_db: bool) -> Self {
        self.use_file_db = use_file_db;
        self
    }

    pub fn with_shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    pub fn with_log_spy(mut self, enabled: bool) -> Self {
        self.log_spy_enabled = enabled;
        self
    }

    pub fn with_accept_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    pub fn with_library_path(mut self, path: impl Into<String>) -> Self {
        self.library_path = Some(path.into());
        self
    }

    pub fn with_agent(mut self, agent: impl Into<PathBuf>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = entry_point.into();
        self
    }

    pub fn with_passthrough(mut self, passthrough: bool) -> Self {
        self.passthrough = passthrough;
        self
    }

    fn launch_builder(&self, data_dir: &Path) -> LaunchSpecBuilder {
        let mut builder = LaunchSpec::builder(&self.worker_program)
            .with_data_dir(data_dir)
            .with_ui_port(self.ui_port)
            .with_file_db(self.use_file_db)
            .with_extra_args(self.extra_args.iter().cloned())
            .with_entry_point(&self.entry_point);
        if let Some(ref path) = self.library_path {
            builder = builder.with_library_path(path);
        }
        if self.passthrough {
            builder = builder.with_current_passthrough();
        }
        let agent = self
            .agent
            .clone()
            .or_else(|| discover_agent(&self.worker_program));
        if let Some(agent) = agent {
            builder = builder.with_agent(agent);
        }
        builder
    }
}

fn discover_agent(worker_program: &Path) -> Option<PathBuf> {
    let agent = worker_program.parent()?.join(AGENT_FILE_NAME);
    if agent.is_file() {
        tracing::debug!(agent = %agent.display(), "Using agent found beside worker");
        Some(agent)
    } else {
        None
    }
}

#[derive(Debug)]
enum DataDir {
    Owned(TempDir),
    Borrowed(PathBuf),
    Released,
}

impl DataDir {
    fn create(borrowed: Option<&Path>) -> io::Result<Self> {
        match borrowed {
            Some(dir) => Ok(Self::Borrowed(dir.to_path_buf())),
            None => Ok(Self::Owned(
                tempfile::Builder::new().prefix(DATA_DIR_PREFIX).tempdir()?,
            )),
        }
    }

    fn path(&self) -> Option<&Path> {
        match self {
            Self::Owned(dir) => Some(dir.path()),
            Self::Borrowed(dir) => Some(dir),
            Self::Released => None,
        }
    }

    /// Delete the directory if we created it.
    fn release(&mut self) -> io::Result<()> {
        match std::mem::replace(self, Self::Released) {
            Self::Owned(dir) => {
                let path = dir.path().to_path_buf();
                dir.close()?;
                tracing::debug!(path = %path.display(), "Deleted data directory");
                Ok(())
            }
            Self::Borrowed(_) | Self::Released => Ok(()),
        }
    }
}

/// Keeps the first teardown failure and logs the rest.
#[derive(Default)]
struct FirstError(Option<ContainerError>);

impl FirstError {
    fn record<E: Into<ContainerError>>(&mut self, step: &'static str, result: Result<(), E>) {
        let Err(e) = result else { return };
        let e = e.into();
        tracing::warn!(step, error = %e, "Teardown step failed");
        self.0.get_or_insert(e);
    }

    fn into_result(self) -> Result<(), ContainerError> {
        self.0.map_or(Ok(()), Err)
    }
}

pub struct Container {
    config: ContainerConfig,
    state: ContainerState,
    commander: Option<Arc<Commander>>,
    process: Option<WorkerProcess>,
    http: Option<WorkerHttpClient>,
    hook: Option<HookRegistration>,
    data_dir: DataDir,
    ui_port: u16,
    pid: Option<u32>,
    console_bytes: ByteCounter,
}

impl Container {
    /// Launch a worker, handshake over the control channel and resolve its
    /// service port.
    ///
    /// A worker that answers NO_PORT is shut down and fully released before
    /// [`ContainerError::StartupFailed`] is returned.
    pub async fn start(config: ContainerConfig) -> Result<Self, ContainerError> {
        let mut data_dir = DataDir::create(config.data_dir.as_deref())?;
        let launch = match data_dir.path() {
            Some(path) => config.launch_builder(path),
            None => return Err(io::Error::from(io::ErrorKind::NotFound).into()),
        };

        let supervisor = ProcessSupervisor::new().with_accept_timeout(config.accept_timeout);
        let (endpoint, mut process) = match supervisor.start(&launch).await {
            Ok(started) => started,
            Err(e) => {
                if let Err(release_err) = data_dir.release() {
                    tracing::warn!(error = %release_err, "Deleting data directory after failed launch");
                }
                return Err(e.into());
            }
        };
        let pid = process.pid();
        let control_port = process.control_listener().port();
        let console_bytes = process.console_bytes();
        let commander = Arc::new(Commander::new(endpoint));

        let ui_port = match commander.get_port().await {
            Ok(Some(port)) => port,
            Ok(None) => {
                tracing::error!(pid, "Worker could not open its service port");
                abort_startup(&commander, &mut process, &mut data_dir, &config, true).await;
                return Err(ContainerError::StartupFailed {
                    reason: "worker could not open its service port".to_string(),
                    pid,
                    control_port: Some(control_port),
                });
            }
            Err(e) => {
                abort_startup(&commander, &mut process, &mut data_dir, &config, false).await;
                return Err(e.into());
            }
        };

        let http = match WorkerHttpClient::for_port(ui_port) {
            Ok(http) => http,
            Err(e) => {
                abort_startup(&commander, &mut process, &mut data_dir, &config, true).await;
                return Err(e.into());
            }
        };

        let weak = Arc::downgrade(&commander);
        let hook = hook::register(move || {
            let weak = weak.clone();
            async move {
                if let Some(commander) = weak.upgrade() {
                    let _ = commander.send_kill().await;
                }
            }
        });

        tracing::info!(pid, ui_port, shared = config.shared, "Container running");

        Ok(Self {
            config,
            state: ContainerState::Running,
            commander: Some(commander),
            process: Some(process),
            http: Some(http),
            hook: Some(hook),
            data_dir,
            ui_port,
            pid,
            console_bytes,
        })
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    pub fn is_shared(&self) -> bool {
        self.config.shared
    }

    pub fn ui_port(&self) -> u16 {
        self.ui_port
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.data_dir.path()
    }

    /// Bytes the worker has written to stdout and stderr so far.
    pub fn num_console_bytes(&self) -> u64 {
        self.console_bytes.get()
    }

    pub fn is_responsive(&self, within: Duration) -> bool {
        self.commander
            .as_ref()
            .is_some_and(|c| c.is_responsive(within))
    }

    pub fn trace_service(&self) -> Result<&dyn TraceService, ContainerError> {
        let http: &dyn TraceService = self.http()?;
        Ok(http)
    }

    pub fn config_service(&self) -> Result<&dyn ConfigService, ContainerError> {
        let http: &dyn ConfigService = self.http()?;
        Ok(http)
    }

    fn commander(&self) -> Result<&Commander, ContainerError> {
        match (&self.state, &self.commander) {
            (ContainerState::Running, Some(commander)) => Ok(commander),
            (state, _) => Err(ContainerError::NotRunning(*state)),
        }
    }

    fn http(&self) -> Result<&WorkerHttpClient, ContainerError> {
        match (&self.state, &self.http) {
            (ContainerState::Running, Some(http)) => Ok(http),
            (state, _) => Err(ContainerError::NotRunning(*state)),
        }
    }

    /// Start a workload and wait (bounded) until its traces are stored.
    pub async fn execute_app(&self, app: &str) -> Result<(), ContainerError> {
        self.commander()?.execute_app(app).await?;

        let traces = self.http()?;
        let started = Instant::now();
        loop {
            if traces.num_pending_complete_traces().await? == 0 {
                tracing::debug!(app, elapsed = ?started.elapsed(), "Workload traces stored");
                return Ok(());
            }
            if started.elapsed() >= EXECUTE_APP_TIMEOUT {
                tracing::warn!(app, "Traces still pending after {:?}", EXECUTE_APP_TIMEOUT);
                return Ok(());
            }
            tokio::time::sleep(EXECUTE_APP_POLL_INTERVAL).await;
        }
    }

    pub async fn interrupt_app(&self) -> Result<(), ContainerError> {
        self.commander()?.interrupt().await?;
        Ok(())
    }

    pub async fn add_expected_log_message(
        &self,
        logger_name: &str,
        partial_message: &str,
    ) -> Result<(), ContainerError> {
        if !self.config.log_spy_enabled {
            return Err(ContainerError::Assertion(
                "Log spy is disabled, expected log messages cannot be checked".to_string(),
            ));
        }
        self.commander()?
            .add_expected_log_message(logger_name, partial_message)
            .await?;
        Ok(())
    }

    /// Verify the worker is idle and clean, then reset it for the next caller.
    pub async fn check_and_reset(&self) -> Result<MessageCount, ContainerError> {
        let http = self.http()?;
        http.assert_no_active_traces().await.map_err(|e| match e {
            ServiceError::Assertion(message) => ContainerError::Assertion(message),
            e => e.into(),
        })?;
        http.delete_all_snapshots().await?;
        http.reset_all_config().await?;

        if !self.config.log_spy_enabled {
            return Ok(MessageCount::default());
        }

        let count = self.commander()?.clear_log_messages().await?;
        if count.expected > 0 {
            return Err(ContainerError::Assertion(
                "One or more expected messages were not logged".to_string(),
            ));
        }
        if count.unexpected > 0 {
            return Err(ContainerError::Assertion(
                "One or more unexpected messages were logged".to_string(),
            ));
        }
        Ok(count)
    }

    /// Ask the worker to shut down and release everything.
    ///
    /// A shared container ignores this unless `force` is set.
    pub async fn close(&mut self, force: bool) -> Result<(), ContainerError> {
        if self.config.shared && !force {
            tracing::debug!(pid = self.pid, "Shared container, close deferred");
            return Ok(());
        }
        if self.state == ContainerState::Closed {
            return Ok(());
        }

        let mut errors = FirstError::default();
        if let Some(ref commander) = self.commander {
            errors.record("shutdown", commander.shutdown().await);
        }
        errors.record("teardown", self.teardown().await);
        errors.into_result()
    }

    /// Send KILL without waiting for an answer, then release everything.
    pub async fn kill(&mut self) -> Result<(), ContainerError> {
        if self.state == ContainerState::Closed {
            return Ok(());
        }

        let mut errors = FirstError::default();
        if let Some(ref commander) = self.commander {
            errors.record("kill", commander.send_kill().await);
        }
        errors.record("teardown", self.teardown().await);
        errors.into_result()
    }

    async fn teardown(&mut self) -> Result<(), ContainerError> {
        let mut errors = FirstError::default();

        if let Some(commander) = self.commander.take() {
            errors.record("close channel", commander.close().await);
        }
        // wait for exit, close listener, stop pump
        if let Some(mut process) = self.process.take() {
            errors.record("stop worker", process.stop(Some(self.config.kill_timeout)).await);
            if let Some(status) = process.exit_status() {
                tracing::debug!(pid = self.pid, %status, "Worker stopped");
            }
        }
        if let Some(hook) = self.hook.take() {
            hook.deregister();
        }
        self.http = None;
        errors.record("delete data dir", self.data_dir.release());

        self.state = ContainerState::Closed;
        tracing::info!(pid = self.pid, console_bytes = self.console_bytes.get(), "Container closed");
        errors.into_result()
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if self.state == ContainerState::Running {
            tracing::warn!(pid = self.pid, "Container dropped while running, worker will be killed");
        }
    }
}

async fn abort_startup(
    commander: &Commander,
    process: &mut WorkerProcess,
    data_dir: &mut DataDir,
    config: &ContainerConfig,
    graceful: bool,
) {
    if graceful && let Err(e) = commander.shutdown().await {
        tracing::warn!(error = %e, "Shutdown during failed startup");
    }
    if let Err(e) = commander.close().await {
        tracing::debug!(error = %e, "Closing control channel during failed startup");
    }
    if let Err(e) = process.stop(Some(config.kill_timeout)).await {
        tracing::warn!(error = %e, "Stopping worker during failed startup");
    }
    if let Err(e) = data_dir.release() {
        tracing::warn!(error = %e, "Deleting data directory during failed startup");
    }
}
