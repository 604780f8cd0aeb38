use std::os::fd::{AsFd, AsRawFd};

use nix::pty::Winsize;
use nix::sys::termios::{self, ControlFlags, InputFlags, LocalFlags, OutputFlags, Termios};
use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;

nix::ioctl_read_bad!(tiocgwinsz, nix::libc::TIOCGWINSZ, Winsize);

/// Captured termios state, portable enough to replay onto a PTY slave on the
/// same host family. Flags travel as raw bits; control characters as bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermAttrs {
    pub input_flags: u64,
    pub output_flags: u64,
    pub control_flags: u64,
    pub local_flags: u64,
    pub control_chars: Vec<u8>,
}

impl TermAttrs {
    /// Snapshot the four flag words and the control-character table.
    pub fn capture(t: &Termios) -> Self {
        Self {
            input_flags: t.input_flags.bits() as u64,
            output_flags: t.output_flags.bits() as u64,
            control_flags: t.control_flags.bits() as u64,
            local_flags: t.local_flags.bits() as u64,
            control_chars: t.control_chars.to_vec(),
        }
    }

    /// Overlay the captured state onto `t`. Unknown flag bits are dropped;
    /// a short control-character table only overwrites its prefix.
    pub fn apply_to(&self, t: &mut Termios) {
        t.input_flags = InputFlags::from_bits_truncate(self.input_flags as _);
        t.output_flags = OutputFlags::from_bits_truncate(self.output_flags as _);
        t.control_flags = ControlFlags::from_bits_truncate(self.control_flags as _);
        t.local_flags = LocalFlags::from_bits_truncate(self.local_flags as _);
        for (dst, src) in t.control_chars.iter_mut().zip(self.control_chars.iter()) {
            *dst = *src;
        }
    }
}

/// Everything the server needs to make the remote PTY behave like the
/// client's local terminal. Sent once, length-prefixed, right after connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalConfig {
    pub term_type: String,
    pub rows: u16,
    pub cols: u16,
    pub attrs: TermAttrs,
}

impl TerminalConfig {
    /// Capture the configuration of a local terminal. `TERM` is the only
    /// environment variable consulted.
    pub fn from_tty<Fd: AsFd>(fd: Fd) -> Result<Self, ProtocolError> {
        let attrs = termios::tcgetattr(&fd)?;
        let mut winsize = Winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        unsafe { tiocgwinsz(fd.as_fd().as_raw_fd(), &mut winsize) }?;
        Ok(Self {
            term_type: std::env::var("TERM").unwrap_or_else(|_| "xterm".to_string()),
            rows: winsize.ws_row,
            cols: winsize.ws_col,
            attrs: TermAttrs::capture(&attrs),
        })
    }
}
