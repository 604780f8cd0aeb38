//! Controlling-terminal handling for the client: raw mode with guaranteed
//! restoration.
//!
//! The guard restores the saved termios on drop; a process-exit hook backs
//! it up for paths that skip destructors (`std::process::exit`). Whichever
//! runs first disarms the other, so restoration happens exactly once.

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::{Mutex, Once};

use nix::sys::termios::{self, SetArg, Termios};
use tracing::debug;

use crate::errors::CliError;

/// Open the process's controlling terminal read-write.
pub fn controlling_tty() -> Result<File, CliError> {
    File::options()
        .read(true)
        .write(true)
        .open("/dev/tty")
        .map_err(|_| CliError::NotATty)
}

/// Slot consulted by the process-exit hook. Holds its own duplicate of the
/// tty fd so restoration works even after the caller's handle is gone.
static EXIT_RESTORE: Mutex<Option<(OwnedFd, Termios)>> = Mutex::new(None);

extern "C" fn restore_terminal_at_exit() {
    let slot = EXIT_RESTORE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
    if let Some((fd, saved)) = slot {
        let _ = termios::tcsetattr(fd.as_fd(), SetArg::TCSANOW, &saved);
    }
}

fn arm_exit_hook(tty: &File, saved: &Termios) -> Result<(), CliError> {
    static REGISTER: Once = Once::new();
    REGISTER.call_once(|| unsafe {
        let _ = libc::atexit(restore_terminal_at_exit);
    });
    let duplicate = tty.as_fd().try_clone_to_owned()?;
    *EXIT_RESTORE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some((duplicate, saved.clone()));
    Ok(())
}

/// Scope guard: the terminal is raw while this lives.
pub struct RawModeGuard {
    fd: std::os::fd::RawFd,
    saved: Termios,
}

impl RawModeGuard {
    pub fn enter(tty: &File) -> Result<Self, CliError> {
        let saved = termios::tcgetattr(tty.as_fd())
            .map_err(|e| CliError::ConnectionFailed(format!("tcgetattr: {}", e)))?;
        arm_exit_hook(tty, &saved)?;

        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(tty.as_fd(), SetArg::TCSANOW, &raw)
            .map_err(|e| CliError::ConnectionFailed(format!("tcsetattr: {}", e)))?;
        debug!(event = "client.tty.raw_mode_entered");
        Ok(Self {
            fd: tty.as_raw_fd(),
            saved,
        })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let fd = unsafe { BorrowedFd::borrow_raw(self.fd) };
        let _ = termios::tcsetattr(fd, SetArg::TCSANOW, &self.saved);
        // Restored normally: the exit hook has nothing left to do.
        EXIT_RESTORE
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        debug!(event = "client.tty.raw_mode_restored");
    }
}
