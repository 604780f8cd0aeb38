use remdbg_protocol::ProtocolError;
use remdbg_server::ServerError;

/// All error types for the remdbg CLI.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("could not connect before the deadline")]
    ConnectTimeout,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("not attached to a terminal")]
    NotATty,

    #[error("no process injector configured (pass --injector)")]
    InjectorUnavailable,

    #[error("injector failed: {0}")]
    InjectorFailed(String),

    #[error("invalid address: {0}")]
    BadAddress(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code: 1 for failure to connect, 2 for everything that
    /// went wrong past the connection.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::ConnectTimeout | CliError::ConnectionFailed(_) => 1,
            _ => 2,
        }
    }
}
