//! Commander - the supervisor side of the control protocol.
//!
//! One rendezvous at a time: `send` holds the rendezvous lock from the moment
//! the command is written until its response is read, so the Kth response
//! always belongs to the Kth command. A background reader task drains the
//! socket, records heartbeats, and forwards responses to whoever holds the
//! lock.
//!
//! A caller may give up on `send` (a timeout, a dropped future). The command
//! is then still owed a response; the next `send` reads and discards it before
//! writing anything new. A write abandoned part way leaves the framing
//! unknown, and every later `send` fails with [`ControlError::ChannelClosed`].
//!
//! KILL is the exception: it only takes the write lock and never waits.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{Command, CommandToken, MessageCount, Response, WorkerMessage};
use crate::bridge::transport::{ControlEndpoint, SupervisorReader, SupervisorWriter};

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control channel closed")]
    ChannelClosed,
    #[error("control channel i/o error: {0}")]
    Io(#[source] io::Error),
    #[error("unexpected response to {token}: {response:?}")]
    UnexpectedResponse {
        token: CommandToken,
        response: Response,
    },
    #[error("worker rejected {token}: {error}")]
    Remote { token: CommandToken, error: String },
    #[error("{0} is never answered; use send_kill")]
    Unanswered(CommandToken),
}

impl ControlError {
    fn from_io(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof => Self::ChannelClosed,
            _ => Self::Io(e),
        }
    }
}

/// Liveness bookkeeping fed by worker heartbeats.
#[derive(Default)]
struct HeartbeatMonitor {
    last: StdMutex<Option<Instant>>,
    count: AtomicU64,
}

impl HeartbeatMonitor {
    fn record(&self) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn last(&self) -> Option<Instant> {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// State guarded by the rendezvous lock.
struct Rendezvous {
    responses: mpsc::Receiver<Response>,
    /// Responses still owed to senders that stopped waiting.
    abandoned: usize,
    /// Set while a command is being written; left set if that write never finished.
    torn: bool,
}

impl Rendezvous {
    async fn discard_abandoned(&mut self) -> Result<(), ControlError> {
        while self.abandoned > 0 {
            let stale = self.responses.recv().await.ok_or(ControlError::ChannelClosed)?;
            self.abandoned -= 1;
            tracing::debug!(?stale, "Discarding response to an abandoned command");
        }
        Ok(())
    }
}

pub struct Commander {
    peer_addr: SocketAddr,
    writer: Arc<Mutex<Option<SupervisorWriter>>>,
    rendezvous: Mutex<Rendezvous>,
    heartbeats: Arc<HeartbeatMonitor>,
    cancel: CancellationToken,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Commander {
    /// Take ownership of an accepted endpoint and start draining it.
    pub fn new(endpoint: ControlEndpoint) -> Self {
        let ControlEndpoint {
            peer_addr,
            reader,
            writer,
            ..
        } = endpoint;

        let (response_tx, response_rx) = mpsc::channel(1);
        let heartbeats = Arc::new(HeartbeatMonitor::default());
        let cancel = CancellationToken::new();

        let reader_task = tokio::spawn(run_reader(
            reader,
            response_tx,
            Arc::clone(&heartbeats),
            cancel.clone(),
        ));

        Self {
            peer_addr,
            writer: Arc::new(Mutex::new(Some(writer))),
            rendezvous: Mutex::new(Rendezvous {
                responses: response_rx,
                abandoned: 0,
                torn: false,
            }),
            heartbeats,
            cancel,
            reader_task: StdMutex::new(Some(reader_task)),
        }
    }

    /// Write `command` and wait for its response.
    ///
    /// Cancel safe: dropping the future at any point never hands its response
    /// to a later caller.
    pub async fn send(&self, command: Command) -> Result<Response, ControlError> {
        let token = command.token;
        if !token.expects_response() {
            return Err(ControlError::Unanswered(token));
        }

        let mut rendezvous = self.rendezvous.lock().await;
        if rendezvous.torn {
            return Err(ControlError::ChannelClosed);
        }
        rendezvous.discard_abandoned().await?;

        // Each field update sits between awaits, so a dropped future leaves
        // the bookkeeping describing exactly how far it got.
        rendezvous.torn = true;
        self.write(command).await?;
        rendezvous.torn = false;
        rendezvous.abandoned += 1;

        let response = rendezvous
            .responses
            .recv()
            .await
            .ok_or(ControlError::ChannelClosed)?;
        rendezvous.abandoned -= 1;
        tracing::trace!(%token, ?response, "Rendezvous complete");
        Ok(response)
    }

    /// Write KILL without waiting for anything back.
    pub async fn send_kill(&self) -> Result<(), ControlError> {
        tracing::debug!(peer = %self.peer_addr, "Sending kill");
        self.write(Command::nullary(CommandToken::Kill)).await
    }

    async fn write(&self, command: Command) -> Result<(), ControlError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ControlError::ChannelClosed)?;
        writer.send(command).await.map_err(ControlError::from_io)
    }

    /// Resolve the worker's service port. `None` means NO_PORT.
    pub async fn get_port(&self) -> Result<Option<u16>, ControlError> {
        match self.send(CommandToken::GetPort.into()).await? {
            Response::Port { port } => Ok(Some(port)),
            Response::NoPort => Ok(None),
            other => Err(unexpected(CommandToken::GetPort, other)),
        }
    }

    pub async fn execute_app(&self, app: &str) -> Result<(), ControlError> {
        let response = self.send(Command::execute_app(app)).await?;
        expect_ack(CommandToken::ExecuteApp, response)
    }

    pub async fn interrupt(&self) -> Result<(), ControlError> {
        let response = self.send(CommandToken::Interrupt.into()).await?;
        expect_ack(CommandToken::Interrupt, response)
    }

    pub async fn add_expected_log_message(
        &self,
        logger_name: &str,
        partial_message: &str,
    ) -> Result<(), ControlError> {
        let response = self
            .send(Command::add_expected_log_message(logger_name, partial_message))
            .await?;
        expect_ack(CommandToken::AddExpectedLogMessage, response)
    }

    pub async fn clear_log_messages(&self) -> Result<MessageCount, ControlError> {
        match self.send(CommandToken::ClearLogMessages.into()).await? {
            Response::LogMessageCount(count) => Ok(count),
            other => Err(unexpected(CommandToken::ClearLogMessages, other)),
        }
    }

    /// Ask the worker to exit. A worker that closes the connection without
    /// answering has still shut down.
    pub async fn shutdown(&self) -> Result<(), ControlError> {
        match self.send(CommandToken::Shutdown.into()).await {
            Ok(Response::ShuttingDown | Response::Ack) | Err(ControlError::ChannelClosed) => Ok(()),
            Ok(other) => Err(unexpected(CommandToken::Shutdown, other)),
            Err(e) => Err(e),
        }
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.heartbeats.last()
    }

    pub fn heartbeat_count(&self) -> u64 {
        self.heartbeats.count.load(Ordering::Relaxed)
    }

    /// Whether a heartbeat arrived within `within`.
    pub fn is_responsive(&self, within: Duration) -> bool {
        self.last_heartbeat()
            .is_some_and(|last| last.elapsed() <= within)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Close both directions and stop the reader task. Idempotent.
    pub async fn close(&self) -> Result<(), ControlError> {
        self.cancel.cancel();

        let writer = self.writer.lock().await.take();
        let close_result = match writer {
            Some(mut writer) => writer.close().await.map_err(ControlError::from_io),
            None => Ok(()),
        };

        let reader_task = self
            .reader_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        // The reader may be parked handing a stale response to nobody; abort
        // rather than wait for it to notice the cancellation.
        if let Some(task) = reader_task.inspect(JoinHandle::abort)
            && let Err(e) = task.await
            && e.is_panic()
        {
            tracing::error!(error = %e, "Control reader task panicked");
        }

        match close_result {
            // The peer hung up first; nothing left to close.
            Err(ControlError::ChannelClosed) => Ok(()),
            other => other,
        }
    }
}

impl Drop for Commander {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn unexpected(token: CommandToken, response: Response) -> ControlError {
    match response {
        Response::Failed { error } => ControlError::Remote { token, error },
        response => ControlError::UnexpectedResponse { token, response },
    }
}

fn expect_ack(token: CommandToken, response: Response) -> Result<(), ControlError> {
    match response {
        Response::Ack => Ok(()),
        other => Err(unexpected(token, other)),
    }
}

async fn run_reader(
    mut reader: SupervisorReader,
    response_tx: mpsc::Sender<Response>,
    heartbeats: Arc<HeartbeatMonitor>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::trace!("Control reader cancelled");
                break;
            }

            frame = reader.next() => match frame {
                Some(Ok(WorkerMessage::Heartbeat)) => heartbeats.record(),
                Some(Ok(WorkerMessage::Response(response))) => {
                    if response_tx.send(response).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Control channel read error");
                    break;
                }
                None => {
                    tracing::debug!("Control channel closed by worker");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::Request;
    use crate::bridge::transport::{ControlListener, WorkerReader, WorkerWriter, connect};

    async fn channel_pair() -> (Commander, WorkerReader, WorkerWriter) {
        let listener = ControlListener::bind().await.unwrap();
        let port = listener.port();
        let (accepted, dialed) = tokio::join!(
            listener.accept(Some(Duration::from_secs(5))),
            connect(port)
        );
        let (reader, writer) = dialed.unwrap();
        (Commander::new(accepted.ok().unwrap()), reader, writer)
    }

    async fn reply(writer: &mut WorkerWriter, response: Response) {
        writer
            .send(WorkerMessage::Response(response))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn kth_response_answers_kth_command() {
        let (commander, mut reader, mut writer) = channel_pair().await;

        let worker = tokio::spawn(async move {
            while let Some(Ok(cmd)) = reader.next().await {
                // Heartbeats interleave with replies and must not be mistaken for them.
                writer.send(WorkerMessage::Heartbeat).await.unwrap();
                let error = cmd.args.first().cloned().unwrap_or_default();
                reply(&mut writer, Response::Failed { error }).await;
            }
        });

        for i in 0..20 {
            let response = commander
                .send(Command::execute_app(format!("app-{i}")))
                .await
                .unwrap();
            assert_eq!(
                response,
                Response::Failed {
                    error: format!("app-{i}")
                }
            );
        }
        assert!(commander.heartbeat_count() >= 19);
        assert!(commander.is_responsive(Duration::from_secs(5)));

        commander.close().await.unwrap();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_senders_are_serialized() {
        let (commander, mut reader, mut writer) = channel_pair().await;
        let commander = Arc::new(commander);

        let worker = tokio::spawn(async move {
            for _ in 0..2 {
                let cmd = reader.next().await.unwrap().unwrap();
                // Nothing else may arrive while this command is outstanding.
                let early =
                    tokio::time::timeout(Duration::from_millis(100), reader.next()).await;
                assert!(early.is_err(), "second command sent before first was answered");
                reply(&mut writer, Response::Failed { error: cmd.args[0].clone() }).await;
            }
        });

        let a = tokio::spawn({
            let commander = Arc::clone(&commander);
            async move { commander.send(Command::execute_app("a")).await.unwrap() }
        });
        let b = tokio::spawn({
            let commander = Arc::clone(&commander);
            async move { commander.send(Command::execute_app("b")).await.unwrap() }
        });

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(a, Response::Failed { error: "a".into() });
        assert_eq!(b, Response::Failed { error: "b".into() });
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn abandoned_send_does_not_answer_the_next_one() {
        let (commander, mut reader, mut writer) = channel_pair().await;

        let worker = tokio::spawn(async move {
            while let Some(Ok(cmd)) = reader.next().await {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let error = cmd.args.first().cloned().unwrap_or_default();
                reply(&mut writer, Response::Failed { error }).await;
            }
        });

        let gave_up = tokio::time::timeout(
            Duration::from_millis(50),
            commander.send(Command::execute_app("first")),
        )
        .await;
        assert!(gave_up.is_err());

        let response = commander
            .send(Command::execute_app("second"))
            .await
            .unwrap();
        assert_eq!(
            response,
            Response::Failed {
                error: "second".into()
            }
        );

        // Later rendezvous stay in step.
        let response = commander.send(Command::execute_app("third")).await.unwrap();
        assert_eq!(
            response,
            Response::Failed {
                error: "third".into()
            }
        );

        commander.close().await.unwrap();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn pending_send_fails_when_worker_hangs_up() {
        let (commander, mut reader, writer) = channel_pair().await;

        let worker = tokio::spawn(async move {
            let _ = reader.next().await;
            drop(writer);
            drop(reader);
        });

        let err = commander.get_port().await.unwrap_err();
        assert!(matches!(err, ControlError::ChannelClosed));
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn kill_is_written_without_waiting() {
        let (commander, mut reader, _writer) = channel_pair().await;

        tokio::time::timeout(Duration::from_secs(1), commander.send_kill())
            .await
            .expect("send_kill blocked")
            .unwrap();

        let cmd = reader.next().await.unwrap().unwrap();
        assert_eq!(cmd.parse().unwrap(), Request::Kill);
    }

    #[tokio::test]
    async fn kill_through_send_is_rejected() {
        let (commander, _reader, _writer) = channel_pair().await;
        let err = commander
            .send(Command::nullary(CommandToken::Kill))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::Unanswered(CommandToken::Kill)));
    }

    #[tokio::test]
    async fn typed_helpers_map_responses() {
        let (commander, mut reader, mut writer) = channel_pair().await;

        let worker = tokio::spawn(async move {
            let replies = [
                Response::NoPort,
                Response::Port { port: 4000 },
                Response::LogMessageCount(MessageCount {
                    expected: 1,
                    unexpected: 2,
                }),
                Response::Failed {
                    error: "no such app".into(),
                },
                Response::ShuttingDown,
            ];
            for response in replies {
                let _ = reader.next().await.unwrap().unwrap();
                reply(&mut writer, response).await;
            }
        });

        assert_eq!(commander.get_port().await.unwrap(), None);
        assert_eq!(commander.get_port().await.unwrap(), Some(4000));
        let count = commander.clear_log_messages().await.unwrap();
        assert_eq!((count.expected, count.unexpected), (1, 2));
        let err = commander.execute_app("missing").await.unwrap_err();
        assert!(matches!(
            err,
            ControlError::Remote {
                token: CommandToken::ExecuteApp,
                ..
            }
        ));
        commander.shutdown().await.unwrap();

        worker.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_accepts_a_silent_hang_up() {
        let (commander, mut reader, writer) = channel_pair().await;
        tokio::spawn(async move {
            let _ = reader.next().await;
            drop(writer);
        });

        commander.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_later_sends() {
        let (commander, _reader, _writer) = channel_pair().await;

        commander.close().await.unwrap();
        commander.close().await.unwrap();

        assert!(matches!(
            commander.interrupt().await.unwrap_err(),
            ControlError::ChannelClosed
        ));
        assert!(matches!(
            commander.send_kill().await.unwrap_err(),
            ControlError::ChannelClosed
        ));
    }

    #[tokio::test]
    async fn no_heartbeat_means_not_responsive() {
        let (commander, _reader, _writer) = channel_pair().await;
        assert!(commander.last_heartbeat().is_none());
        assert!(!commander.is_responsive(Duration::from_secs(60)));
    }
}
