//! Embedding surface: what a host process calls to make itself debuggable.

use std::net::SocketAddr;

use remdbg_engine::{registry, EngineError, RegisteredThread, ScriptMode};
use tracing::{info, warn};

use crate::errors::ServerError;
use crate::server::{self, ServerCmd};

/// Start (or confirm) the process-wide debug server at `addr`.
pub fn listen(addr: SocketAddr) -> Result<(), ServerError> {
    server::make_sure_listening_at(addr)
}

/// Stop the server and join its loop thread.
pub fn stop() -> Result<(), ServerError> {
    server::stop()
}

/// Make the calling thread debuggable and ensure the server is listening.
///
/// A client that connects and picks this thread triggers an attach by
/// injection; the thread stops in the shell at its next statement, even if
/// it is blocked in a sleep. Keep the returned guard alive for as long as
/// the thread should stay in the chooser menu.
pub fn set_trace_on_connect(addr: SocketAddr) -> Result<RegisteredThread, ServerError> {
    let name = std::thread::current()
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| "main".to_string());
    let guard = registry::register_current_thread(&name);
    server::make_sure_listening_at(addr)?;
    info!(event = "server.api.trace_on_connect_armed", thread = %guard.handle());
    Ok(guard)
}

pub struct RunOptions {
    pub addr: SocketAddr,
    pub path: String,
    pub mode: ScriptMode,
    pub argv: Vec<String>,
    pub use_set_trace: bool,
    pub use_post_mortem: bool,
}

/// Run a script under the debugger: listen, wait for a client
/// to attach to this thread, run the script (tracing from the first
/// statement with `use_set_trace`), and on failure show the traceback and
/// drop into post-mortem before surfacing the error to the caller.
pub fn run_with_debugging(opts: RunOptions) -> Result<(), ServerError> {
    server::make_sure_listening_at(opts.addr)?;
    let name = std::thread::current()
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| "main".to_string());
    let guard = registry::register_current_thread(&name);
    let thread = guard.handle();

    let (trace, client_waiter) = server::loop_request(|reply| ServerCmd::PrimeRunSession {
        thread: thread.clone(),
        reply,
    })?;

    info!(
        event = "server.api.waiting_for_client",
        thread = %thread,
        addr = %opts.addr,
    );
    client_waiter
        .recv()
        .map_err(|_| ServerError::Fatal("server loop dropped the client waiter".to_string()))?;

    let result = trace.run_script(&opts.path, opts.mode, opts.argv.clone(), opts.use_set_trace);
    match result {
        Ok(_) => {
            let _ = trace.write_output(&format!("{} finished running successfully\n", opts.path));
            trace.finish();
            Ok(())
        }
        Err(EngineError::Script(script_err)) => {
            let _ = trace.write_output(&script_err.traceback.render());
            if opts.use_post_mortem {
                if let Err(e) = trace.post_mortem(&script_err.traceback) {
                    warn!(event = "server.api.post_mortem_failed", error = %e);
                }
            } else {
                trace.finish();
            }
            Err(ServerError::Script(script_err.message))
        }
        Err(other) => {
            let _ = trace.write_output(&format!("{}\n", other));
            trace.finish();
            Err(other.into())
        }
    }
}
