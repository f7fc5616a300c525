//! Loopback TCP transport for the control channel.
//!
//! The supervisor binds an ephemeral port on 127.0.0.1 before spawning the
//! worker, passes the port on the worker's command line, and accepts exactly
//! one connection. The accepted stream is split into framed halves.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::JsonCodec;
use super::protocol::{Command, WorkerMessage};

/// Supervisor-side halves.
pub type SupervisorReader = FramedRead<OwnedReadHalf, JsonCodec<WorkerMessage>>;
pub type SupervisorWriter = FramedWrite<OwnedWriteHalf, JsonCodec<Command>>;

/// Worker-side halves.
pub type WorkerReader = FramedRead<OwnedReadHalf, JsonCodec<Command>>;
pub type WorkerWriter = FramedWrite<OwnedWriteHalf, JsonCodec<WorkerMessage>>;

#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    #[error("no control connection within {0:?}")]
    Timeout(Duration),
    #[error("control listener already closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Listening socket the worker dials back to.
pub struct ControlListener {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
}

impl ControlListener {
    /// Bind 127.0.0.1 on an ephemeral port.
    pub async fn bind() -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let local_addr = listener.local_addr()?;
        tracing::debug!(%local_addr, "Bound control listener");
        Ok(Self {
            listener: Some(listener),
            local_addr,
        })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept the single control connection.
    ///
    /// `None` waits forever, which is only sensible when the caller has its own
    /// overall deadline.
    pub async fn accept(&self, timeout: Option<Duration>) -> Result<ControlEndpoint, AcceptError> {
        let listener = self.listener.as_ref().ok_or(AcceptError::Closed)?;
        let (stream, peer) = match timeout {
            Some(bound) => tokio::time::timeout(bound, listener.accept())
                .await
                .map_err(|_| AcceptError::Timeout(bound))??,
            None => listener.accept().await?,
        };
        tracing::debug!(%peer, "Worker connected to control listener");
        ControlEndpoint::from_stream(stream, self.local_addr).map_err(AcceptError::from)
    }

    /// Stop listening. Idempotent.
    pub fn close(&mut self) {
        if self.listener.take().is_some() {
            tracing::trace!(local_addr = %self.local_addr, "Closed control listener");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.listener.is_none()
    }
}

/// Accepted control connection, ready to hand to a `Commander`.
pub struct ControlEndpoint {
    pub listen_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub reader: SupervisorReader,
    pub writer: SupervisorWriter,
}

impl ControlEndpoint {
    fn from_stream(stream: TcpStream, listen_addr: SocketAddr) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            listen_addr,
            peer_addr,
            reader: FramedRead::new(read_half, JsonCodec::new()),
            writer: FramedWrite::new(write_half, JsonCodec::new()),
        })
    }
}

/// Dial the supervisor from inside the worker.
pub async fn connect(control_port: u16) -> io::Result<(WorkerReader, WorkerWriter)> {
    let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, control_port)).await?;
    stream.set_nodelay(true)?;
    tracing::debug!(control_port, "Connected to supervisor");
    let (read_half, write_half) = stream.into_split();
    Ok((
        FramedRead::new(read_half, JsonCodec::new()),
        FramedWrite::new(write_half, JsonCodec::new()),
    ))
}
