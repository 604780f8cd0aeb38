pub mod config;
pub mod errors;
pub mod framing;
pub mod piping;

// Primary re-exports
pub use config::{TermAttrs, TerminalConfig};
pub use errors::ProtocolError;
pub use framing::{read_config, recv_config, send_config};
pub use piping::Piping;

/// Default address the server binds and the client dials.
pub const DEFAULT_IP: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 0xdb9;

/// Wall-clock deadline for the client's connect retry loop, in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: f64 = 10.0;
