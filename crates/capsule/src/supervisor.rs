//! Process supervisor - spawns the worker and owns its OS resources.
//!
//! Flow:
//! 1. Bind the control listener on an ephemeral loopback port
//! 2. Spawn the worker with stdout+stderr merged into one pipe
//! 3. Pump that pipe to our stdout, counting bytes
//! 4. Accept exactly one control connection (or give up and reap the child)
//!
//! The supervisor owns the child handle, the listener, and the pump task.
//! The accepted connection is handed out as a [`ControlEndpoint`].

use std::io;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::transport::{AcceptError, ControlEndpoint, ControlListener};
use crate::launch::{LaunchSpec, LaunchSpecBuilder};

/// How long a stopping pump may keep draining buffered output before it is cancelled.
pub const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

const PUMP_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to launch {}: {source}", program.display())]
    LaunchFailed {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The worker was killed and reaped and the listener closed before this
    /// was returned; `pid` and `control_port` name what was released.
    #[error("worker did not connect within {bound:?}")]
    HandshakeTimeout {
        bound: Duration,
        pid: Option<u32>,
        control_port: u16,
    },
    #[error("worker exited before connecting ({0})")]
    ExitedBeforeConnect(ExitStatus),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Bytes observed on the worker's merged output. Only the pump writes it.
#[derive(Debug, Clone, Default)]
pub struct ByteCounter(Arc<AtomicU64>);

impl ByteCounter {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    fn add(&self, n: usize) {
        self.0.fetch_add(n as u64, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor {
    accept_timeout: Option<Duration>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the wait for the worker's control connection. `None` waits forever.
    pub fn with_accept_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Spawn the worker and accept its control connection.
    ///
    /// On any failure after spawning, the child is killed and reaped and the
    /// listener and pump released before the error is returned.
    pub async fn start(
        &self,
        launch: &LaunchSpecBuilder,
    ) -> Result<(ControlEndpoint, WorkerProcess), SupervisorError> {
        let mut listener = ControlListener::bind().await?;
        let spec = launch.build().with_control_port(listener.port());

        let (mut child, output) = spawn(&spec)?;
        let pid = child.id();
        let control_port = listener.port();
        tracing::info!(pid, control_port, command = %spec.display(), "Spawned worker");

        let bytes = ByteCounter::default();
        let pump = match ConsolePump::start(output, bytes.clone()) {
            Ok(pump) => pump,
            Err(e) => {
                reap(&mut child).await;
                listener.close();
                return Err(e.into());
            }
        };

        let accepted = tokio::select! {
            accepted = listener.accept(self.accept_timeout) => accepted.map_err(|e| match e {
                AcceptError::Timeout(bound) => SupervisorError::HandshakeTimeout {
                    bound,
                    pid,
                    control_port,
                },
                AcceptError::Closed => SupervisorError::Io(io::ErrorKind::NotConnected.into()),
                AcceptError::Io(e) => SupervisorError::Io(e),
            }),
            status = child.wait() => Err(match status {
                Ok(status) => SupervisorError::ExitedBeforeConnect(status),
                Err(e) => SupervisorError::Io(e),
            }),
        };

        let mut process = WorkerProcess {
            child,
            pid,
            listener,
            bytes,
            pump: Some(pump),
            exit_status: None,
        };

        match accepted {
            Ok(endpoint) => Ok((endpoint, process)),
            Err(e) => {
                tracing::error!(pid, error = %e, "Worker never connected");
                if let Err(stop_err) = process.stop(Some(Duration::ZERO)).await {
                    tracing::warn!(pid, error = %stop_err, "Stopping worker after failed handshake");
                }
                Err(e)
            }
        }
    }
}

fn spawn(spec: &LaunchSpec) -> Result<(Child, OwnedFd), SupervisorError> {
    let launch_failed = |source| SupervisorError::LaunchFailed {
        program: spec.program().to_path_buf(),
        source,
    };

    let (output, stdout, stderr) = merged_output_pipe().map_err(launch_failed)?;

    // The Command holds our copies of the write end; it must be gone before
    // the pump can ever see EOF.
    let child = Command::new(spec.program())
        .args(spec.args())
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .kill_on_drop(true)
        .spawn()
        .map_err(launch_failed)?;

    Ok((child, output))
}

/// One pipe shared by the child's stdout and stderr, so output keeps its
/// interleaving. Returns the read end and the two child-side handles.
fn merged_output_pipe() -> io::Result<(OwnedFd, Stdio, Stdio)> {
    #[cfg(target_os = "linux")]
    let (read, write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)?;
    #[cfg(not(target_os = "linux"))]
    let (read, write) = nix::unistd::pipe()?;

    let write_stderr = write.try_clone()?;
    Ok((read, Stdio::from(write), Stdio::from(write_stderr)))
}

async fn reap(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "start_kill failed (already exited?)");
    }
    if let Err(e) = child.wait().await {
        tracing::warn!(error = %e, "Failed to reap worker");
    }
}

/// Copies the worker's merged output to our stdout.
struct ConsolePump {
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl ConsolePump {
    fn start(output: OwnedFd, bytes: ByteCounter) -> io::Result<Self> {
        let source = pipe::Receiver::from_owned_fd(output)?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pump_console(source, bytes, cancel.clone()));
        Ok(Self { task, cancel })
    }

    /// Let the pump reach EOF on its own for a bounded time, then cancel it.
    async fn stop(mut self) {
        if tokio::time::timeout(PUMP_DRAIN_TIMEOUT, &mut self.task)
            .await
            .is_err()
        {
            tracing::debug!("Console pump still open after drain window, cancelling");
            self.cancel.cancel();
            let _ = self.task.await;
        }
    }
}

async fn pump_console(mut source: pipe::Receiver, bytes: ByteCounter, cancel: CancellationToken) {
    let mut console = tokio::io::stdout();
    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            read = source.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(error = %e, "Console pipe read failed");
                    break;
                }
            },
        };

        bytes.add(n);
        if let Err(e) = console.write_all(&buf[..n]).await {
            tracing::warn!(error = %e, "Failed to mirror worker output");
            continue;
        }
        let _ = console.flush().await;
    }

    tracing::trace!(total_bytes = bytes.get(), "Console pump exiting");
}

/// A spawned worker and the resources that live exactly as long as it does.
pub struct WorkerProcess {
    child: Child,
    pid: Option<u32>,
    listener: ControlListener,
    bytes: ByteCounter,
    pump: Option<ConsolePump>,
    exit_status: Option<ExitStatus>,
}

impl WorkerProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Live view of the pump's byte count; stays readable after `stop`.
    pub fn console_bytes(&self) -> ByteCounter {
        self.bytes.clone()
    }

    pub fn control_listener(&self) -> &ControlListener {
        &self.listener
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    pub fn is_running(&mut self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                false
            }
            Ok(None) => true,
            Err(_) => false,
        }
    }

    /// Block until the worker exits. Returns immediately once it already has.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        tracing::debug!(pid = self.pid, %status, "Worker exited");
        self.exit_status = Some(status);
        Ok(status)
    }

    /// Wait up to `bound`, then SIGKILL and reap.
    pub async fn wait_with_timeout(&mut self, bound: Duration) -> io::Result<ExitStatus> {
        if let Ok(result) = tokio::time::timeout(bound, self.wait()).await {
            return result;
        }
        tracing::warn!(pid = self.pid, ?bound, "Worker still running, killing");
        self.child.start_kill()?;
        self.wait().await
    }

    /// Release everything in order: wait for exit, close the listener, stop
    /// the pump. Every step runs even if an earlier one failed; the first
    /// error is returned. Safe to call more than once.
    pub async fn stop(&mut self, kill_after: Option<Duration>) -> Result<(), SupervisorError> {
        let waited = match kill_after {
            Some(bound) => self.wait_with_timeout(bound).await,
            None => self.wait().await,
        };

        self.listener.close();

        if let Some(pump) = self.pump.take() {
            pump.stop().await;
            tracing::debug!(pid = self.pid, console_bytes = self.bytes.get(), "Console pump stopped");
        }

        waited.map(|_| ()).map_err(SupervisorError::from)
    }
}

/// Whether a process with this pid still exists (including unreaped zombies).
pub fn process_exists(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch(program: &str) -> LaunchSpecBuilder {
        LaunchSpec::builder(program)
            .with_aggregate_interval(None)
            .with_data_dir("/tmp")
    }

    #[tokio::test]
    async fn missing_executable_is_launch_failed() {
        let err = ProcessSupervisor::new()
            .with_accept_timeout(Some(Duration::from_secs(1)))
            .start(&launch("/nonexistent/capsule-worker"))
            .await
            .err()
            .unwrap();

        match err {
            SupervisorError::LaunchFailed { program, source } => {
                assert_eq!(program, PathBuf::from("/nonexistent/capsule-worker"));
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("expected LaunchFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn worker_exiting_before_connect_is_reported() {
        // `false` ignores its arguments and exits 1 without dialing back.
        let err = ProcessSupervisor::new()
            .with_accept_timeout(Some(Duration::from_secs(10)))
            .start(&launch("false"))
            .await
            .err()
            .unwrap();

        match err {
            SupervisorError::ExitedBeforeConnect(status) => assert!(!status.success()),
            other => panic!("expected ExitedBeforeConnect, got {other}"),
        }
    }

    /// Writes a known amount to stdout and stderr, then dials the control
    /// port (always the last argument) and exits.
    const CHATTY_WORKER: &str = r#"#!/usr/bin/env bash
port="${@: -1}"
yes stdout | head -c 60000
yes stderr | head -c 40000 >&2
exec 3<>"/dev/tcp/127.0.0.1/$port"
exec 3>&-
"#;

    fn write_script(dir: &std::path::Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("worker.sh");
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn byte_count_matches_merged_output_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), CHATTY_WORKER);

        let (endpoint, mut process) = ProcessSupervisor::new()
            .with_accept_timeout(Some(Duration::from_secs(30)))
            .start(&launch(script.to_str().unwrap()))
            .await
            .unwrap();
        drop(endpoint);

        process.stop(Some(Duration::from_secs(10))).await.unwrap();
        assert!(process.exit_status().unwrap().success());
        assert_eq!(process.console_bytes().get(), 100_000);
    }

    #[tokio::test]
    async fn handshake_timeout_releases_worker_and_listener() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "#!/usr/bin/env bash\nsleep 30\n");

        let err = ProcessSupervisor::new()
            .with_accept_timeout(Some(Duration::from_millis(200)))
            .start(&launch(script.to_str().unwrap()))
            .await
            .err()
            .unwrap();

        match err {
            SupervisorError::HandshakeTimeout {
                bound,
                pid,
                control_port,
            } => {
                assert_eq!(bound, Duration::from_millis(200));
                assert!(!process_exists(pid.unwrap()));
                let refused =
                    std::net::TcpStream::connect((std::net::Ipv4Addr::LOCALHOST, control_port));
                assert!(refused.is_err());
            }
            other => panic!("expected HandshakeTimeout, got {other}"),
        }
    }

    #[test]
    fn byte_counter_is_shared_between_clones() {
        let counter = ByteCounter::default();
        let view = counter.clone();
        counter.add(10);
        counter.add(5);
        assert_eq!(view.get(), 15);
    }

    #[test]
    fn own_pid_exists() {
        assert!(process_exists(std::process::id()));
        assert!(!process_exists(u32::MAX));
    }
}
