//! The out-of-process debugging console.
//!
//! Dials the target, sends the local terminal's configuration as one framed
//! message, switches the local tty to raw mode, and splices
//! stdin -> socket -> stdout until the server hangs up.

use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsFd, AsRawFd};
use std::time::{Duration, Instant};

use remdbg_protocol::piping::set_nonblocking;
use remdbg_protocol::{send_config, Piping, TerminalConfig};
use tracing::{debug, info};

use crate::errors::CliError;
use crate::tty::{controlling_tty, RawModeGuard};

const STDIN_FILENO: i32 = 0;
const STDOUT_FILENO: i32 = 1;
const CONNECT_RETRY_PAUSE: Duration = Duration::from_millis(50);

/// Keep dialling until the deadline. Refused connections are retried (the
/// target may still be starting its server); other failures are final.
fn connect_with_deadline(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, CliError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CliError::ConnectTimeout);
        }
        match TcpStream::connect_timeout(&addr, remaining) {
            Ok(stream) => return Ok(stream),
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                std::thread::sleep(CONNECT_RETRY_PAUSE.min(remaining));
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                return Err(CliError::ConnectTimeout);
            }
            Err(e) => return Err(CliError::ConnectionFailed(e.to_string())),
        }
    }
}

/// Run the interactive console against `addr`. Returns when the server
/// closes the connection.
pub fn connect_to_debugger(addr: SocketAddr, timeout: Duration) -> Result<(), CliError> {
    let mut stream = connect_with_deadline(addr, timeout)?;
    info!(event = "client.connected", addr = %addr);

    let tty = controlling_tty()?;
    let config = TerminalConfig::from_tty(&tty)?;
    send_config(&mut stream, &config)?;
    debug!(
        event = "client.config_sent",
        term = %config.term_type,
        rows = config.rows,
        cols = config.cols,
    );

    {
        let _raw = RawModeGuard::enter(&tty)?;
        let socket_fd = stream.as_raw_fd();
        set_nonblocking(STDIN_FILENO)?;
        set_nonblocking(STDOUT_FILENO)?;
        set_nonblocking(socket_fd)?;

        let mut piping = Piping::new();
        piping
            .add_route(STDIN_FILENO, socket_fd)
            .add_route(socket_fd, STDOUT_FILENO);
        piping.run()?;
    }

    // Let buffered server output reach the screen before returning to the
    // cooked shell.
    let _ = nix::sys::termios::tcdrain(std::io::stdout().as_fd());
    info!(event = "client.disconnected", addr = %addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_timeout_against_dead_port() {
        // Bind-then-drop: nothing is listening here now.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let started = Instant::now();
        let err = connect_with_deadline(addr, Duration::from_millis(300)).unwrap_err();
        assert!(matches!(err, CliError::ConnectTimeout));
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[test]
    fn test_connect_succeeds_against_live_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = connect_with_deadline(addr, Duration::from_secs(2)).unwrap();
        drop(stream);
    }

    #[test]
    fn test_connect_retries_until_listener_appears() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let opener = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            std::net::TcpListener::bind(addr)
        });
        let result = connect_with_deadline(addr, Duration::from_secs(5));
        let listener = opener.join().unwrap();
        // The port could have been taken in the gap; only assert when the
        // late bind actually worked.
        if listener.is_ok() {
            assert!(result.is_ok());
        }
    }
}
