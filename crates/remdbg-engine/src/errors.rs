use std::io;

use crate::traceback::Traceback;

/// A runtime failure inside a running script, with the call stack captured at
/// the point of the raise. This is what `try`/`catch` intercepts and what
/// post-mortem examines.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ScriptError {
    pub message: String,
    pub traceback: Traceback,
}

/// All error types for the remdbg-engine crate.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("syntax error at line {line}: {message}")]
    Syntax { line: u32, message: String },

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("target thread unavailable: {0}")]
    TargetUnavailable(String),

    #[error("module not found: {0}")]
    ModuleNotFound(String),

    #[error("signal delivery failed: {0}")]
    Signal(nix::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl EngineError {
    /// Whether this is a failure of the script itself rather than of the
    /// engine or its plumbing.
    pub fn is_script_error(&self) -> bool {
        matches!(self, EngineError::Script(_) | EngineError::Syntax { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_error_display_is_bare_message() {
        let err = ScriptError {
            message: "division by zero".to_string(),
            traceback: Traceback {
                message: "division by zero".to_string(),
                frames: vec![],
            },
        };
        assert_eq!(err.to_string(), "division by zero");
        assert!(EngineError::from(err).is_script_error());
    }

    #[test]
    fn test_engine_error_classification() {
        assert!(EngineError::Syntax {
            line: 3,
            message: "unexpected token".to_string()
        }
        .is_script_error());
        assert!(!EngineError::TargetUnavailable("worker".to_string()).is_script_error());
    }
}
