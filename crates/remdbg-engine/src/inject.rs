//! Running a one-shot payload on a chosen live target thread.
//!
//! The payload is parked in the target's registry slot and a thread-directed
//! signal is sent. The handler itself is a no-op installed without
//! `SA_RESTART`, so its only observable effect is interrupting a blocking
//! system call with EINTR. The interpreter drains parked payloads at
//! statement boundaries and inside `sleep`, which is where the payload
//! actually runs — with the thread's current frame, never inside the
//! handler.

use std::sync::atomic::Ordering;
use std::sync::Once;
use std::time::Duration;

use nix::sys::pthread::pthread_kill;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::time::{clock_gettime, ClockId};
use tracing::debug;

use crate::errors::EngineError;
use crate::interp::Interp;
use crate::registry::{self, ThreadHandle};

/// One-shot callable delivered to a target thread. Receives the thread's
/// interpreter positioned at its current frame.
pub type InjectionPayload = Box<dyn FnOnce(&mut Interp) + Send>;

/// Thread-directed wakeup signal. SIGURG is ignored by default, so an
/// uninvolved thread that somehow receives it is unaffected.
pub const INJECTION_SIGNAL: Signal = Signal::SIGURG;

extern "C" fn noop_handler(_signum: nix::libc::c_int) {}

fn ensure_handler_installed() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        // No SA_RESTART: the whole point is the EINTR on the target.
        let action = SigAction::new(
            SigHandler::Handler(noop_handler),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // Installing a no-op handler for SIGURG cannot break the process.
        unsafe {
            let _ = sigaction(INJECTION_SIGNAL, &action);
        }
    });
}

/// Arrange for `payload` to run on `thread` with its current frame,
/// interrupting a blocking system call if necessary. Callers keep at most
/// one injection outstanding per target thread.
pub fn inject(thread: &ThreadHandle, payload: InjectionPayload) -> Result<(), EngineError> {
    let entry = registry::lookup(thread.id)
        .ok_or_else(|| EngineError::TargetUnavailable(thread.to_string()))?;

    if registry::is_current(thread.id) {
        // Same thread: no signal choreography needed, but the payload still
        // runs at a statement boundary, which is exactly where we are.
        debug!(event = "engine.inject.same_thread", id = thread.id);
        *entry.pending.lock().expect("pending lock poisoned") = Some(payload);
        entry.pending_flag.store(true, Ordering::Release);
        return Ok(());
    }

    ensure_handler_installed();
    *entry.pending.lock().expect("pending lock poisoned") = Some(payload);
    entry.pending_flag.store(true, Ordering::Release);
    debug!(event = "engine.inject.signalling", id = thread.id);
    pthread_kill(entry.pthread, INJECTION_SIGNAL).map_err(|e| {
        entry.pending.lock().expect("pending lock poisoned").take();
        entry.pending_flag.store(false, Ordering::Release);
        match e {
            nix::errno::Errno::ESRCH => EngineError::TargetUnavailable(thread.to_string()),
            other => EngineError::Signal(other),
        }
    })
}

/// Run any payload parked for the calling thread. Invoked by the
/// interpreter at every statement boundary and whenever `sleep` is
/// interrupted.
pub fn drain_pending(interp: &mut Interp) {
    let Some(entry) = registry::current_entry() else {
        return;
    };
    if !entry.pending_flag.swap(false, Ordering::AcqRel) {
        return;
    }
    let payload = entry.pending.lock().expect("pending lock poisoned").take();
    if let Some(payload) = payload {
        debug!(event = "engine.inject.payload_running", id = entry.id);
        payload(interp);
    }
}

/// Sleep that a delivered injection signal can interrupt. The parked
/// payload runs immediately on EINTR and the remaining time is then slept.
pub fn interruptible_sleep(interp: &mut Interp, duration: Duration) -> Result<(), EngineError> {
    let started = clock_gettime(ClockId::CLOCK_MONOTONIC).map_err(EngineError::Signal)?;
    let deadline = Duration::new(started.tv_sec() as u64, started.tv_nsec() as u32) + duration;
    loop {
        let now = clock_gettime(ClockId::CLOCK_MONOTONIC).map_err(EngineError::Signal)?;
        let now = Duration::new(now.tv_sec() as u64, now.tv_nsec() as u32);
        let Some(remaining) = deadline.checked_sub(now) else {
            return Ok(());
        };
        let request = nix::sys::time::TimeSpec::from_duration(remaining);
        match nix::time::clock_nanosleep(
            ClockId::CLOCK_MONOTONIC,
            nix::time::ClockNanosleepFlags::empty(),
            &request,
        ) {
            Ok(_) => return Ok(()),
            Err(nix::errno::Errno::EINTR) => {
                drain_pending(interp);
            }
            Err(e) => return Err(EngineError::Signal(e)),
        }
    }
}
