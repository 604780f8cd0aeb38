pub mod errors;
pub mod host_state;
pub mod inject;
pub mod interp;
pub mod lexer;
pub mod logging;
pub mod parser;
pub mod registry;
pub mod trace;
pub mod traceback;
pub mod value;

// Primary re-exports
pub use errors::{EngineError, ScriptError};
pub use inject::inject;
pub use interp::Interp;
pub use logging::init_logging;
pub use registry::{register_current_thread, RegisteredThread, ThreadHandle};
pub use trace::session::{run_script, ScriptMode, SessionEvent, TraceSession};
pub use trace::{clear_session_provider, set_session_provider, SessionProvider};
pub use traceback::Traceback;
pub use value::Value;

/// Extension used by module-mode script resolution.
pub const SCRIPT_EXTENSION: &str = "rsc";
