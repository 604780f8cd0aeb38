//! The trace-engine adapter: one [`TraceSession`] per debugged thread,
//! wrapping the debug shell over that thread's PTY slave and reporting
//! lifecycle events back to whoever owns the session.

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::errors::EngineError;
use crate::host_state;
use crate::inject::InjectionPayload;
use crate::interp::Interp;
use crate::parser;
use crate::trace::{self, shell::Shell, TraceEvent, DEBUGGING_GLOBAL};
use crate::traceback::Traceback;
use crate::value::Value;

/// Lifecycle notifications a session emits toward its debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Tracing began (shell is or will shortly be interacting).
    Started,
    /// The shell continued the program; a re-attach is possible.
    Continued,
    /// The debug session ended; clients should be released.
    Done,
}

/// How `run_script` interprets its path argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptMode {
    /// A filesystem path.
    File,
    /// A dotted module name resolved against the search path.
    Module,
}

pub struct TraceSession {
    shell: Mutex<Shell>,
    events: Box<dyn Fn(SessionEvent) + Send + Sync>,
}

impl TraceSession {
    /// `reader` and `writer` are both the PTY slave; `events` is invoked on
    /// the traced thread and must only schedule work elsewhere.
    pub fn new(
        reader: File,
        writer: File,
        events: impl Fn(SessionEvent) + Send + Sync + 'static,
    ) -> Self {
        Self {
            shell: Mutex::new(Shell::new(reader, writer)),
            events: Box::new(events),
        }
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        debug!(event = "engine.session.event", kind = ?event);
        (self.events)(event);
    }

    pub(crate) fn interact(
        &self,
        interp: &mut Interp,
        event: TraceEvent,
    ) -> std::io::Result<crate::trace::shell::Directive> {
        self.shell
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .interact(interp, event)
    }

    /// Begin stepping on the calling thread; the next statement stops.
    pub fn set_trace_here(self: &Arc<Self>) {
        trace::install_stepping(self.clone());
    }

    /// Payload for [`crate::inject::inject`]: attach to the target thread's
    /// current frame, masked by the check-debugging-global gate.
    pub fn attach_payload(self: &Arc<Self>) -> InjectionPayload {
        trace::attach_payload(self.clone())
    }

    /// Interactive shell over a captured failure.
    pub fn post_mortem(&self, tb: &Traceback) -> Result<(), EngineError> {
        info!(event = "engine.session.post_mortem", error = %tb.message);
        self.emit(SessionEvent::Started);
        let result = {
            // Prompt input must not re-enter tracing machinery.
            let _guard = trace::DispatchGuard::enter();
            self.shell
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .interact_post_mortem(tb)
        };
        self.emit(SessionEvent::Done);
        result.map_err(Into::into)
    }

    /// Write text to the session's terminal (and so to every client).
    pub fn write_output(&self, text: &str) -> Result<(), EngineError> {
        self.shell
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .write_str(text)
            .map_err(Into::into)
    }

    /// Report the session done outside the normal quit path. Used after a
    /// script failure when no post-mortem follows.
    pub fn finish(&self) {
        self.emit(SessionEvent::Done);
    }

    /// Run a script under this session, optionally with tracing armed from
    /// the first statement.
    pub fn run_script(
        self: &Arc<Self>,
        path: &str,
        mode: ScriptMode,
        argv: Vec<String>,
        with_set_trace: bool,
    ) -> Result<Interp, EngineError> {
        run_script(path, mode, argv, with_set_trace, Some(self))
    }
}

/// Resolve a dotted module name against the interpreter search path.
pub fn resolve_module(name: &str) -> Result<PathBuf, EngineError> {
    let mut rel = PathBuf::new();
    for part in name.split('.') {
        rel.push(part);
    }
    rel.set_extension(crate::SCRIPT_EXTENSION);
    for dir in host_state::search_path() {
        let candidate = dir.join(&rel);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(EngineError::ModuleNotFound(name.to_string()))
}

/// Execute a script as the program's top level.
///
/// argv and the module search path are substituted for the duration of the
/// run and restored exactly afterwards, on every exit path. With
/// `with_set_trace` the sentinel is placed into the script's initial globals
/// and the gate-armed hook is installed, so the first statement stops in the
/// shell.
///
/// On success the finished interpreter is returned (callers inspect globals
/// in tests); a still-armed trace session is reported done. On failure the
/// hook is removed silently so the caller can decide whether a post-mortem
/// follows.
pub fn run_script(
    path: &str,
    mode: ScriptMode,
    argv: Vec<String>,
    with_set_trace: bool,
    session: Option<&Arc<TraceSession>>,
) -> Result<Interp, EngineError> {
    let _preserve = host_state::preserve();
    let resolved = match mode {
        ScriptMode::File => PathBuf::from(path),
        ScriptMode::Module => resolve_module(path)?,
    };
    if mode == ScriptMode::File {
        if let Some(parent) = resolved.parent() {
            let dir = if parent.as_os_str().is_empty() {
                PathBuf::from(".")
            } else {
                parent.to_path_buf()
            };
            host_state::set_script_dir(dir);
        }
    }
    host_state::set_argv(argv);

    info!(
        event = "engine.session.run_script_started",
        path = %resolved.display(),
        traced = with_set_trace,
    );
    let src = std::fs::read_to_string(&resolved)?;
    let program = parser::parse(&src)?;

    let mut globals = HashMap::new();
    if with_set_trace {
        globals.insert(DEBUGGING_GLOBAL.to_string(), Value::Bool(true));
    }
    let mut interp = Interp::with_globals(resolved.to_string_lossy().into_owned(), globals);

    if with_set_trace {
        if let Some(session) = session {
            trace::install_gated(session.clone());
        }
    }

    let result = interp.run(&program);
    match result {
        Ok(()) => {
            trace::finish_thread();
            info!(event = "engine.session.run_script_completed", path = %resolved.display());
            Ok(interp)
        }
        Err(e) => {
            trace::clear();
            info!(
                event = "engine.session.run_script_failed",
                path = %resolved.display(),
                error = %e,
            );
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_script(dir: &std::path::Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_run_file_script() {
        let _lock = host_state::test_lock();
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "main.rsc", "x = 2 + 3\n");
        let interp = run_script(
            path.to_str().unwrap(),
            ScriptMode::File,
            vec![path.to_string_lossy().into_owned()],
            false,
            None,
        )
        .unwrap();
        assert_eq!(
            interp.globals_ref().borrow().get("x"),
            Some(&Value::Int(5))
        );
    }

    #[test]
    fn test_run_script_restores_argv_and_search_path() {
        let _lock = host_state::test_lock();
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "main.rsc", "x = argc()\nfirst = argv(0)\n");
        let before = host_state::snapshot();
        let interp = run_script(
            path.to_str().unwrap(),
            ScriptMode::File,
            vec!["main.rsc".to_string(), "--flag".to_string()],
            false,
            None,
        )
        .unwrap();
        assert_eq!(host_state::snapshot(), before);
        assert_eq!(
            interp.globals_ref().borrow().get("x"),
            Some(&Value::Int(2))
        );
        assert_eq!(
            interp.globals_ref().borrow().get("first"),
            Some(&Value::Str("main.rsc".to_string()))
        );
    }

    #[test]
    fn test_run_script_restores_state_on_failure() {
        let _lock = host_state::test_lock();
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "boom.rsc", "x = 1 / 0\n");
        let before = host_state::snapshot();
        let err = run_script(
            path.to_str().unwrap(),
            ScriptMode::File,
            vec!["boom.rsc".to_string()],
            false,
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("division by zero"));
        assert_eq!(host_state::snapshot(), before);
    }

    #[test]
    fn test_module_mode_resolves_against_search_path() {
        let _lock = host_state::test_lock();
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("pkg")).unwrap();
        write_script(dir.path(), "pkg/tool.rsc", "done = true\n");

        let _preserve = host_state::preserve();
        host_state::push_search_path(dir.path().to_path_buf());
        let interp = run_script(
            "pkg.tool",
            ScriptMode::Module,
            vec!["pkg.tool".to_string()],
            false,
            None,
        )
        .unwrap();
        assert_eq!(
            interp.globals_ref().borrow().get("done"),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn test_module_mode_missing_module() {
        let _lock = host_state::test_lock();
        let err = run_script(
            "no.such.module",
            ScriptMode::Module,
            vec![],
            false,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::ModuleNotFound(_)));
    }

    #[test]
    fn test_file_mode_script_dir_is_searchable() {
        let _lock = host_state::test_lock();
        let dir = tempfile::tempdir().unwrap();
        // helper.rsc sits next to the script; module resolution during the
        // run must find it through the injected script dir.
        write_script(dir.path(), "helper.rsc", "unused = 0\n");
        let path = write_script(dir.path(), "main.rsc", "x = 1\n");
        run_script(
            path.to_str().unwrap(),
            ScriptMode::File,
            vec![],
            false,
            None,
        )
        .unwrap();
        // State restored; helper no longer resolvable.
        assert!(resolve_module("helper").is_err());
    }

    #[test]
    fn test_with_set_trace_plants_sentinel_without_session() {
        let _lock = host_state::test_lock();
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "main.rsc", "x = 1\n");
        let interp = run_script(
            path.to_str().unwrap(),
            ScriptMode::File,
            vec![],
            true,
            None,
        )
        .unwrap();
        // No hook was installed, so nothing removed the sentinel.
        assert!(interp
            .globals_ref()
            .borrow()
            .contains_key(DEBUGGING_GLOBAL));
    }
}
