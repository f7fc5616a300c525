//! Wire protocol for the supervisor-worker control channel.
//!
//! - Supervisor → worker: [`Command`], a token plus string arguments.
//! - Worker → supervisor: [`WorkerMessage`], either a heartbeat or the single
//!   [`Response`] to the command currently in flight.
//!
//! `Command` stays loosely typed on the wire (token + args) so the worker can
//! report arity mistakes instead of failing to decode; [`Command::parse`]
//! lifts it into the typed [`Request`].

use serde::{Deserialize, Serialize};

/// Command vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandToken {
    GetPort,
    ExecuteApp,
    Interrupt,
    AddExpectedLogMessage,
    ClearLogMessages,
    Shutdown,
    /// Never answered. Sent when the worker may be unresponsive.
    Kill,
}

impl CommandToken {
    /// Number of string arguments the token carries.
    pub fn arity(self) -> usize {
        match self {
            Self::ExecuteApp => 1,
            Self::AddExpectedLogMessage => 2,
            Self::GetPort
            | Self::Interrupt
            | Self::ClearLogMessages
            | Self::Shutdown
            | Self::Kill => 0,
        }
    }

    /// Whether the sender waits for a [`Response`].
    pub fn expects_response(self) -> bool {
        !matches!(self, Self::Kill)
    }
}

impl std::fmt::Display for CommandToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::GetPort => "GET_PORT",
            Self::ExecuteApp => "EXECUTE_APP",
            Self::Interrupt => "INTERRUPT",
            Self::AddExpectedLogMessage => "ADD_EXPECTED_LOG_MESSAGE",
            Self::ClearLogMessages => "CLEAR_LOG_MESSAGES",
            Self::Shutdown => "SHUTDOWN",
            Self::Kill => "KILL",
        };
        f.write_str(name)
    }
}

/// A command frame: a token, optionally followed by ordered string arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub token: CommandToken,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl Command {
    pub fn nullary(token: CommandToken) -> Self {
        Self {
            token,
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(token: CommandToken, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            token,
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn execute_app(app: impl Into<String>) -> Self {
        Self::with_args(CommandToken::ExecuteApp, [app.into()])
    }

    pub fn add_expected_log_message(
        logger_name: impl Into<String>,
        partial_message: impl Into<String>,
    ) -> Self {
        Self::with_args(
            CommandToken::AddExpectedLogMessage,
            [logger_name.into(), partial_message.into()],
        )
    }

    /// Validate arity and convert into a typed request.
    pub fn parse(self) -> Result<Request, ProtocolError> {
        if self.args.len() != self.token.arity() {
            return Err(ProtocolError::Arity {
                token: self.token,
                expected: self.token.arity(),
                actual: self.args.len(),
            });
        }

        let mut args = self.args.into_iter();
        // Arity was checked above, so the `next()` calls below cannot run dry.
        let mut arg = move || args.next().unwrap_or_default();

        Ok(match self.token {
            CommandToken::GetPort => Request::GetPort,
            CommandToken::ExecuteApp => Request::ExecuteApp { app: arg() },
            CommandToken::Interrupt => Request::Interrupt,
            CommandToken::AddExpectedLogMessage => {
                let logger_name = arg();
                let partial_message = arg();
                Request::AddExpectedLogMessage {
                    logger_name,
                    partial_message,
                }
            }
            CommandToken::ClearLogMessages => Request::ClearLogMessages,
            CommandToken::Shutdown => Request::Shutdown,
            CommandToken::Kill => Request::Kill,
        })
    }
}

impl From<CommandToken> for Command {
    fn from(token: CommandToken) -> Self {
        Self::nullary(token)
    }
}

/// Typed view of a [`Command`], used by the worker's command processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    GetPort,
    ExecuteApp {
        app: String,
    },
    Interrupt,
    AddExpectedLogMessage {
        logger_name: String,
        partial_message: String,
    },
    ClearLogMessages,
    Shutdown,
    Kill,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("{token} takes {expected} argument(s), got {actual}")]
    Arity {
        token: CommandToken,
        expected: usize,
        actual: usize,
    },
}

/// Log-spy bookkeeping returned by CLEAR_LOG_MESSAGES.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCount {
    /// Expected messages that were never logged.
    pub expected: u32,
    /// Warn/error messages that nobody expected.
    pub unexpected: u32,
}

impl MessageCount {
    pub fn is_clean(&self) -> bool {
        self.expected == 0 && self.unexpected == 0
    }
}

/// Reply to a rendezvous command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    /// The worker's own service port.
    Port { port: u16 },
    /// The worker could not open its service endpoint.
    NoPort,
    Ack,
    LogMessageCount(MessageCount),
    /// Last frame before the worker closes the connection.
    ShuttingDown,
    /// The worker understood the frame but refused it.
    Failed { error: String },
}

/// Frames written by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Liveness marker, independent of command traffic. Never answers a command.
    Heartbeat,
    Response(Response),
}
