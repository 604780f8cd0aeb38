pub mod api;
pub mod bridge;
pub mod chooser;
pub mod config;
pub mod debugger;
pub mod errors;
pub mod pty;
pub mod server;
pub mod session;

// Primary re-exports
pub use api::{listen, run_with_debugging, set_trace_on_connect, stop, RunOptions};
pub use config::{load_server_config, ServerConfig};
pub use errors::ServerError;
pub use server::{default_addr, make_sure_listening_at, make_sure_listening_at_with};
