//! PTY ownership: one master/slave pair per debugged thread (plus a
//! short-lived pair per chooser run).
//!
//! The slave is where the debug shell lives; the master is what the client
//! bridge multiplexes. Both descriptors are opened exactly once and closed
//! exactly once; closing drains the slave first so the final output reaches
//! clients.

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use nix::pty::Winsize;
use nix::sys::termios;
use remdbg_protocol::TerminalConfig;
use tracing::{debug, info};

use crate::errors::ServerError;

nix::ioctl_write_ptr_bad!(tiocswinsz, nix::libc::TIOCSWINSZ, Winsize);

pub struct Pty {
    master: Option<OwnedFd>,
    slave: Option<OwnedFd>,
}

impl Pty {
    /// Allocate a fresh pair. Exhaustion of the host's PTY pool surfaces as
    /// a `Resource` error.
    pub fn open() -> Result<Self, ServerError> {
        let pair = nix::pty::openpty(None, None)
            .map_err(|e| ServerError::Resource(format!("openpty: {}", e)))?;
        info!(
            event = "server.pty.opened",
            master_fd = pair.master.as_raw_fd(),
            slave_fd = pair.slave.as_raw_fd(),
        );
        Ok(Self {
            master: Some(pair.master),
            slave: Some(pair.slave),
        })
    }

    fn slave_fd(&self) -> Result<&OwnedFd, ServerError> {
        self.slave
            .as_ref()
            .ok_or_else(|| ServerError::Resource("PTY already closed".to_string()))
    }

    fn master_fd(&self) -> Result<&OwnedFd, ServerError> {
        self.master
            .as_ref()
            .ok_or_else(|| ServerError::Resource("PTY already closed".to_string()))
    }

    /// Replay a client's terminal configuration onto the slave: window size
    /// always, attributes when present.
    pub fn apply_config(&self, config: &TerminalConfig) -> Result<(), ServerError> {
        self.resize(config.rows, config.cols)?;
        let slave = self.slave_fd()?;
        let mut attrs = termios::tcgetattr(slave.as_fd())
            .map_err(|e| ServerError::Resource(format!("tcgetattr: {}", e)))?;
        config.attrs.apply_to(&mut attrs);
        termios::tcsetattr(slave.as_fd(), termios::SetArg::TCSANOW, &attrs)
            .map_err(|e| ServerError::Resource(format!("tcsetattr: {}", e)))?;
        debug!(
            event = "server.pty.config_applied",
            rows = config.rows,
            cols = config.cols,
            term = %config.term_type,
        );
        Ok(())
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), ServerError> {
        let slave = self.slave_fd()?;
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        unsafe { tiocswinsz(slave.as_raw_fd(), &winsize) }
            .map_err(|e| ServerError::Resource(format!("set window size: {}", e)))?;
        Ok(())
    }

    pub fn master_reader(&self) -> Result<File, ServerError> {
        Ok(File::from(self.master_fd()?.try_clone()?))
    }

    pub fn master_writer(&self) -> Result<File, ServerError> {
        Ok(File::from(self.master_fd()?.try_clone()?))
    }

    pub fn slave_reader(&self) -> Result<File, ServerError> {
        Ok(File::from(self.slave_fd()?.try_clone()?))
    }

    pub fn slave_writer(&self) -> Result<File, ServerError> {
        Ok(File::from(self.slave_fd()?.try_clone()?))
    }

    pub fn is_closed(&self) -> bool {
        self.master.is_none() && self.slave.is_none()
    }

    /// Drain the slave, then close both descriptors. Idempotent and
    /// best-effort: a half-gone terminal must not fail teardown.
    pub fn close(&mut self) {
        if let Some(slave) = self.slave.take() {
            if let Err(e) = termios::tcdrain(slave.as_fd()) {
                debug!(event = "server.pty.drain_failed", error = %e);
            }
            drop(slave);
        }
        if let Some(master) = self.master.take() {
            drop(master);
            debug!(event = "server.pty.closed");
        }
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        self.close();
    }
}
