use std::io;
use std::net::SocketAddr;

use remdbg_engine::EngineError;
use remdbg_protocol::ProtocolError;

/// All error types for the remdbg-server crate.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("target thread unavailable: {0}")]
    TargetUnavailable(String),

    /// Internal and expected: the debug shell quit. Routed as success by
    /// the session teardown path.
    #[error("debugger quit")]
    DebuggerQuit,

    #[error("server already listening at {0}")]
    AlreadyBound(SocketAddr),

    #[error("server not running")]
    NotRunning,

    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    #[error("fatal server error: {0}")]
    Fatal(String),

    #[error("script error: {0}")]
    Script(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ServerError {
    /// Stable code for logs and for the error line sent to a client before
    /// its socket closes.
    pub fn error_code(&self) -> &'static str {
        match self {
            ServerError::Transport(_) => "transport_error",
            ServerError::Protocol(_) => "protocol_error",
            ServerError::Resource(_) => "resource_error",
            ServerError::TargetUnavailable(_) => "target_unavailable",
            ServerError::DebuggerQuit => "debugger_quit",
            ServerError::AlreadyBound(_) => "already_bound",
            ServerError::NotRunning => "not_running",
            ServerError::ConfigInvalid(_) => "config_invalid",
            ServerError::Fatal(_) => "fatal",
            ServerError::Script(_) => "script_error",
            ServerError::Io(_) => "io_error",
        }
    }

    /// Errors that end one client without touching the session or server.
    pub fn is_client_scoped(&self) -> bool {
        matches!(
            self,
            ServerError::Transport(_) | ServerError::Protocol(_) | ServerError::Io(_)
        )
    }
}

impl From<ProtocolError> for ServerError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Io(io) => ServerError::Io(io),
            other => ServerError::Protocol(other.to_string()),
        }
    }
}

impl From<EngineError> for ServerError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::TargetUnavailable(t) => ServerError::TargetUnavailable(t),
            EngineError::Io(io) => ServerError::Io(io),
            EngineError::Script(se) => ServerError::Script(se.message),
            other => ServerError::Script(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases: Vec<(ServerError, &str)> = vec![
            (ServerError::Transport("reset".to_string()), "transport_error"),
            (ServerError::Protocol("bad header".to_string()), "protocol_error"),
            (ServerError::Resource("no ptys".to_string()), "resource_error"),
            (ServerError::DebuggerQuit, "debugger_quit"),
            (ServerError::NotRunning, "not_running"),
            (ServerError::Fatal("loop died".to_string()), "fatal"),
        ];
        for (err, code) in cases {
            assert_eq!(err.error_code(), code);
        }
    }

    #[test]
    fn test_client_scoped_classification() {
        assert!(ServerError::Transport("reset".to_string()).is_client_scoped());
        assert!(ServerError::Protocol("truncated".to_string()).is_client_scoped());
        assert!(!ServerError::Fatal("x".to_string()).is_client_scoped());
        assert!(!ServerError::DebuggerQuit.is_client_scoped());
    }

    #[test]
    fn test_engine_target_unavailable_maps_through() {
        let err: ServerError = EngineError::TargetUnavailable("worker (#3)".to_string()).into();
        assert_eq!(err.error_code(), "target_unavailable");
    }
}
