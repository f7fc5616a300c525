//! Worker side of the control protocol.
//!
//! Runs inside the spawned process: dial the supervisor, start the heartbeat,
//! then answer commands until SHUTDOWN, KILL or a dropped connection.
//!
//! Architecture:
//! - Command loop: one command in, one response out, in order
//! - Heartbeat task: a liveness frame every interval, through the same writer
//! - Workloads: spawned tasks, each with a child of the current interrupt token

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{Command, Request, Response, WorkerMessage};
use crate::bridge::transport::{WorkerWriter, connect};
use crate::log_spy::LogSpy;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// A started workload. Resolves when the work is done or interrupted.
pub type Workload = BoxFuture<'static, ()>;

type SharedWriter = Arc<Mutex<WorkerWriter>>;

/// What the worker actually does, as seen by the command loop.
pub trait WorkerHandler: Send + Sync + 'static {
    /// Port of the worker's own service, `None` when it could not be opened.
    fn service_port(&self) -> Option<u16>;

    /// Resolve `app` to a workload. Called before EXECUTE_APP is acknowledged,
    /// so bookkeeping done here is visible as soon as the supervisor sees the
    /// ack. The workload must stop promptly once `interrupt` fires.
    fn prepare(&self, app: &str, interrupt: CancellationToken) -> Result<Workload, String>;

    fn log_spy(&self) -> Option<&dyn LogSpy> {
        None
    }
}

pub struct WorkerConfig {
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

/// Why the command loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// SHUTDOWN was answered and the connection closed.
    Shutdown,
    /// KILL arrived. The caller should exit the process without cleanup.
    Killed,
    /// The supervisor went away.
    Disconnected,
}

/// Run the worker until the supervisor tells it to stop.
pub async fn run_worker<H: WorkerHandler>(
    handler: Arc<H>,
    control_port: u16,
    config: WorkerConfig,
) -> io::Result<WorkerExit> {
    let (mut reader, writer) = connect(control_port).await?;
    let writer: SharedWriter = Arc::new(Mutex::new(writer));
    tracing::info!(control_port, "Worker connected");

    let heartbeat_cancel = CancellationToken::new();
    let heartbeat = tokio::spawn(run_heartbeat(
        Arc::clone(&writer),
        config.heartbeat_interval,
        heartbeat_cancel.clone(),
    ));

    let mut interrupt = CancellationToken::new();
    let mut workloads = JoinSet::new();

    let exit = loop {
        tokio::select! {
            biased;

            command = reader.next() => {
                let command = match command {
                    Some(Ok(command)) => command,
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Control channel error");
                        break WorkerExit::Disconnected;
                    }
                    None => {
                        tracing::info!("Control channel closed by supervisor");
                        break WorkerExit::Disconnected;
                    }
                };

                let request = match parse(command) {
                    Ok(request) => request,
                    Err(response) => {
                        respond(&writer, response).await?;
                        continue;
                    }
                };

                match request {
                    Request::Kill => {
                        tracing::info!("Kill requested");
                        heartbeat_cancel.cancel();
                        return Ok(WorkerExit::Killed);
                    }
                    Request::Shutdown => {
                        tracing::info!("Shutdown requested");
                        respond(&writer, Response::ShuttingDown).await?;
                        break WorkerExit::Shutdown;
                    }
                    Request::GetPort => {
                        let response = match handler.service_port() {
                            Some(port) => Response::Port { port },
                            None => Response::NoPort,
                        };
                        respond(&writer, response).await?;
                    }
                    Request::ExecuteApp { app } => {
                        let response = match handler.prepare(&app, interrupt.child_token()) {
                            Ok(workload) => {
                                tracing::debug!(%app, "Starting workload");
                                workloads.spawn(workload);
                                Response::Ack
                            }
                            Err(error) => {
                                tracing::warn!(%app, %error, "Rejected workload");
                                Response::Failed { error }
                            }
                        };
                        respond(&writer, response).await?;
                    }
                    Request::Interrupt => {
                        tracing::debug!(running = workloads.len(), "Interrupting workloads");
                        std::mem::replace(&mut interrupt, CancellationToken::new()).cancel();
                        respond(&writer, Response::Ack).await?;
                    }
                    Request::AddExpectedLogMessage { logger_name, partial_message } => {
                        let response = match handler.log_spy() {
                            Some(spy) => {
                                spy.expect(&logger_name, &partial_message);
                                Response::Ack
                            }
                            None => Response::Failed {
                                error: "log spy is not installed".to_string(),
                            },
                        };
                        respond(&writer, response).await?;
                    }
                    Request::ClearLogMessages => {
                        let count = handler
                            .log_spy()
                            .map(|spy| spy.drain_counts())
                            .unwrap_or_default();
                        respond(&writer, Response::LogMessageCount(count)).await?;
                    }
                }
            }

            Some(joined) = workloads.join_next(), if !workloads.is_empty() => {
                if let Err(e) = joined
                    && e.is_panic()
                {
                    tracing::error!(error = %e, "Workload panicked");
                }
            }
        }
    };

    heartbeat_cancel.cancel();
    let _ = heartbeat.await;

    interrupt.cancel();
    workloads.shutdown().await;

    if let Err(e) = writer.lock().await.close().await {
        tracing::debug!(error = %e, "Closing control channel");
    }

    tracing::info!(?exit, "Worker exiting");
    Ok(exit)
}

fn parse(command: Command) -> Result<Request, Response> {
    command.parse().map_err(|e| {
        tracing::warn!(error = %e, "Malformed command");
        Response::Failed {
            error: e.to_string(),
        }
    })
}

async fn respond(writer: &SharedWriter, response: Response) -> io::Result<()> {
    writer
        .lock()
        .await
        .send(WorkerMessage::Response(response))
        .await
}

async fn run_heartbeat(writer: SharedWriter, period: Duration, cancel: CancellationToken) {
    let mut ticks = tokio::time::interval(period);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = ticks.tick() => {
                let sent = writer.lock().await.send(WorkerMessage::Heartbeat).await;
                if let Err(e) = sent {
                    tracing::debug!(error = %e, "Heartbeat failed, stopping");
                    break;
                }
            }
        }
    }
}
