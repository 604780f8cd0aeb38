//! Per-thread trace dispatch.
//!
//! The hook lives in a thread local: the interpreter calls [`trace_event`]
//! at every statement, call and return, and the installed [`TraceSession`]
//! decides whether the thread stops in the debug shell. Installation happens
//! either directly (`set_trace()` on the thread itself) or through an
//! injected payload that first plants the well-known sentinel key into the
//! thread's globals and arms the check-debugging-global gate. The gate makes
//! the dispatcher ignore every frame whose globals lack the sentinel; on the
//! first frame that has it the sentinel is removed, the gate is disarmed and
//! stepping begins. That masks the window between hook installation and the
//! moment user code is actually running again.

pub mod session;
pub mod shell;

use std::cell::{Cell, RefCell};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::errors::EngineError;
use crate::interp::Interp;
use crate::value::Value;
use session::{SessionEvent, TraceSession};
use shell::Directive;

/// Sentinel key planted in a thread's globals by signal-based attachment.
pub const DEBUGGING_GLOBAL: &str = "__remote_debugging__";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    Line,
    Call,
    Return,
}

#[derive(Debug, Clone, Copy)]
enum StepState {
    /// Stop at every event.
    Step,
    /// Stop at the next event at or above the recorded depth.
    Next { depth: usize },
    /// Run until quit or re-attach.
    Continue,
}

struct ActiveTrace {
    session: Arc<TraceSession>,
    state: StepState,
    check_debugging_global: bool,
    /// Whether the session's start has been reported yet.
    announced: bool,
}

thread_local! {
    static ACTIVE: RefCell<Option<ActiveTrace>> = const { RefCell::new(None) };
    static IN_DISPATCH: Cell<bool> = const { Cell::new(false) };
}

/// Install the hook stepping immediately. Used by `set_trace()` running on
/// the target thread itself; no gate is needed because the next event is
/// already user code.
pub(crate) fn install_stepping(session: Arc<TraceSession>) {
    session.emit(SessionEvent::Started);
    ACTIVE.with(|a| {
        *a.borrow_mut() = Some(ActiveTrace {
            session,
            state: StepState::Step,
            check_debugging_global: false,
            announced: true,
        })
    });
}

/// Install the hook with the check-debugging-global gate armed. Used by the
/// attach payload and by `run_script` when tracing is requested.
pub(crate) fn install_gated(session: Arc<TraceSession>) {
    ACTIVE.with(|a| {
        *a.borrow_mut() = Some(ActiveTrace {
            session,
            state: StepState::Step,
            check_debugging_global: true,
            announced: false,
        })
    });
}

/// Whether the calling thread currently has a trace hook installed.
pub fn is_active() -> bool {
    ACTIVE.with(|a| a.borrow().is_some())
}

/// Remove the hook without firing any event.
pub(crate) fn clear() -> Option<Arc<TraceSession>> {
    ACTIVE.with(|a| a.borrow_mut().take()).map(|t| t.session)
}

/// End of a thread's traced life (script finished or thread unregistering):
/// if a hook is still installed, remove it and report the session done.
pub fn finish_thread() {
    if let Some(session) = clear() {
        debug!(event = "engine.trace.finished_with_hook_installed");
        session.emit(SessionEvent::Done);
    }
}

/// The interpreter's per-event entry point.
pub fn trace_event(interp: &mut Interp, event: TraceEvent) -> Result<(), EngineError> {
    if IN_DISPATCH.with(|c| c.get()) {
        return Ok(());
    }
    crate::inject::drain_pending(interp);

    let session = ACTIVE.with(|a| {
        let mut guard = a.borrow_mut();
        let active = guard.as_mut()?;
        if active.check_debugging_global {
            let globals = interp.globals_ref();
            if globals.borrow().contains_key(DEBUGGING_GLOBAL) {
                // Remove on first match so nested runs never see it.
                globals.borrow_mut().remove(DEBUGGING_GLOBAL);
                active.check_debugging_global = false;
                active.state = StepState::Step;
            } else {
                return None;
            }
        }
        let stop = match active.state {
            StepState::Step => true,
            StepState::Next { depth } => interp.depth() <= depth,
            StepState::Continue => false,
        };
        if !stop {
            return None;
        }
        if !active.announced {
            active.announced = true;
            active.session.emit(SessionEvent::Started);
        }
        Some(active.session.clone())
    });
    let Some(session) = session else {
        return Ok(());
    };

    let directive = {
        let _guard = DispatchGuard::enter();
        session.interact(interp, event)
    };
    match directive {
        Ok(Directive::Step) => set_state(StepState::Step),
        Ok(Directive::Next) => set_state(StepState::Next {
            depth: interp.depth(),
        }),
        Ok(Directive::Continue) => {
            set_state(StepState::Continue);
            session.emit(SessionEvent::Continued);
        }
        Ok(Directive::Quit) => {
            clear();
            session.emit(SessionEvent::Done);
        }
        Err(e) => {
            // The shell's terminal is gone; end the session and let the
            // script run on.
            warn!(event = "engine.trace.shell_io_failed", error = %e);
            clear();
            session.emit(SessionEvent::Done);
        }
    }
    Ok(())
}

fn set_state(state: StepState) {
    ACTIVE.with(|a| {
        if let Some(active) = a.borrow_mut().as_mut() {
            active.state = state;
        }
    });
}

pub(crate) struct DispatchGuard;

impl DispatchGuard {
    pub(crate) fn enter() -> Self {
        IN_DISPATCH.with(|c| c.set(true));
        DispatchGuard
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        IN_DISPATCH.with(|c| c.set(false));
    }
}

/// Server-side seam: how a thread's builtins obtain the trace session bound
/// to its PTY.
pub trait SessionProvider: Send + Sync {
    fn session_for_current_thread(&self) -> Result<Arc<TraceSession>, EngineError>;
}

static PROVIDER: RwLock<Option<Arc<dyn SessionProvider>>> = RwLock::new(None);

pub fn set_session_provider(provider: Arc<dyn SessionProvider>) {
    *PROVIDER.write().expect("provider lock poisoned") = Some(provider);
}

pub fn clear_session_provider() {
    *PROVIDER.write().expect("provider lock poisoned") = None;
}

fn provider() -> Option<Arc<dyn SessionProvider>> {
    PROVIDER.read().expect("provider lock poisoned").clone()
}

/// `set_trace()` builtin: arrange that the next statement stops in the
/// debug shell. Without a provider (no server listening) this is a no-op.
pub(crate) fn set_trace_builtin(_interp: &mut Interp) -> Result<(), EngineError> {
    if IN_DISPATCH.with(|c| c.get()) {
        // Typed at the debugger prompt: the thread is already stopped.
        return Ok(());
    }
    let Some(provider) = provider() else {
        warn!(event = "engine.trace.set_trace_without_server");
        return Ok(());
    };
    let session = provider.session_for_current_thread()?;
    install_stepping(session);
    Ok(())
}

/// `post_mortem()` builtin: examine the last caught traceback.
pub(crate) fn post_mortem_builtin(interp: &mut Interp) -> Result<(), EngineError> {
    if IN_DISPATCH.with(|c| c.get()) {
        // The shell is already on the terminal; re-entering would deadlock
        // on its own lock.
        return Err(interp.raise("post_mortem() is not available from the debugger prompt"));
    }
    let tb = match interp.last_traceback() {
        Some(tb) => tb.clone(),
        None => return Err(interp.raise("no traceback to examine")),
    };
    let Some(provider) = provider() else {
        warn!(event = "engine.trace.post_mortem_without_server");
        return Ok(());
    };
    let session = provider.session_for_current_thread()?;
    session.post_mortem(&tb)
}

/// Payload that an injected attach runs on its target thread: plant the
/// sentinel, arm the gate, install the hook. A thread that already has a
/// hook (its own `set_trace()` raced the attach) is left alone.
pub fn attach_payload(session: Arc<TraceSession>) -> crate::inject::InjectionPayload {
    Box::new(move |interp: &mut Interp| {
        if is_active() {
            debug!(event = "engine.trace.attach_skipped_already_tracing");
            return;
        }
        interp
            .globals_ref()
            .borrow_mut()
            .insert(DEBUGGING_GLOBAL.to_string(), Value::Bool(true));
        install_gated(session);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_hook_means_no_stop() {
        let mut interp = Interp::new("test.rsc");
        assert!(!is_active());
        trace_event(&mut interp, TraceEvent::Line).unwrap();
    }

    #[test]
    fn test_clear_without_hook_is_none() {
        assert!(clear().is_none());
        finish_thread();
    }
}
