use std::io;

/// All error types for the remdbg-protocol crate.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed config payload: {0}")]
    Malformed(String),

    #[error("stream closed before the full frame arrived")]
    Truncated,

    #[error("frame length {0} exceeds the {max} byte cap", max = crate::framing::MAX_FRAME_LEN)]
    OversizedFrame(u32),

    #[error("terminal query failed: {0}")]
    Terminal(#[from] nix::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}
