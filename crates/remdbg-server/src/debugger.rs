//! Per-target-thread debugger state machine.
//!
//! One `Debugger` exists per target thread for the life of the process. It
//! owns the thread's PTY, the table of attached clients, and the trace
//! session running the shell on the PTY slave. All mutation happens on the
//! server loop thread; the traced thread reports lifecycle changes through
//! the loop's event channel.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::termios::{self, LocalFlags, SetArg};
use remdbg_engine::{SessionEvent, ThreadHandle, TraceSession};
use remdbg_protocol::TerminalConfig;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::errors::ServerError;
use crate::pty::Pty;
use crate::server::LoopEvent;

pub type ClientId = u64;

const CTRL_C: u8 = 0x03;

/// A connected client as the debugger sees it: terminal config plus the
/// wake-up used to release its connection when the session ends.
pub struct Client {
    pub id: ClientId,
    pub config: TerminalConfig,
    detach_tx: Option<oneshot::Sender<()>>,
}

impl Client {
    pub fn new(id: ClientId, config: TerminalConfig) -> (Self, oneshot::Receiver<()>) {
        let (detach_tx, detach_rx) = oneshot::channel();
        (
            Self {
                id,
                config,
                detach_tx: Some(detach_tx),
            },
            detach_rx,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebuggerState {
    /// No trace active; a first client will trigger an attach.
    Idle,
    /// Trace hook primed (injection sent or run-mode gate armed), tracing
    /// has not reported in yet.
    WaitingToAttach,
    /// The shell is interacting on the PTY.
    Tracing,
    /// Inside a continue; Ctrl-C on the PTY re-attaches.
    DetachedRunning,
}

struct Watcher {
    stop: Arc<AtomicBool>,
}

pub struct Debugger {
    thread: ThreadHandle,
    pty: Pty,
    trace: Arc<TraceSession>,
    master_writer: Arc<Mutex<File>>,
    clients: HashMap<ClientId, Client>,
    state: DebuggerState,
    watcher: Option<Watcher>,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
    /// Run-mode callers blocked until a first client arrives.
    client_waiters: Vec<std::sync::mpsc::Sender<()>>,
    ui_poll: Duration,
}

impl Debugger {
    pub fn new(
        thread: ThreadHandle,
        pty: Pty,
        trace: Arc<TraceSession>,
        master_writer: Arc<Mutex<File>>,
        events_tx: mpsc::UnboundedSender<LoopEvent>,
        ui_poll: Duration,
    ) -> Self {
        Self {
            thread,
            pty,
            trace,
            master_writer,
            clients: HashMap::new(),
            state: DebuggerState::Idle,
            watcher: None,
            events_tx,
            client_waiters: Vec::new(),
            ui_poll,
        }
    }

    pub fn thread(&self) -> &ThreadHandle {
        &self.thread
    }

    pub fn state(&self) -> DebuggerState {
        self.state
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn trace_session(&self) -> Arc<TraceSession> {
        self.trace.clone()
    }

    /// Attach a client. The first client's terminal config is applied to
    /// the PTY; an Idle debugger is attached to its thread by injection.
    pub fn add_client(&mut self, client: Client) -> Result<(), ServerError> {
        let first = self.clients.is_empty();
        let id = client.id;
        if first {
            if let Err(e) = self.pty.apply_config(&client.config) {
                warn!(
                    event = "server.debugger.config_apply_failed",
                    thread = %self.thread,
                    error = %e,
                );
            }
        }
        self.clients.insert(id, client);
        for waiter in self.client_waiters.drain(..) {
            let _ = waiter.send(());
        }
        info!(
            event = "server.debugger.client_added",
            thread = %self.thread,
            client_id = id,
            client_count = self.clients.len(),
            state = ?self.state,
        );
        match self.state {
            DebuggerState::Idle => {
                if let Err(e) = self.attach() {
                    self.clients.remove(&id);
                    return Err(e);
                }
            }
            DebuggerState::DetachedRunning => {
                // The resume prompt is already on the PTY; make sure the
                // Ctrl-C watcher is listening again.
                if self.watcher.is_none() {
                    self.start_watcher();
                }
            }
            DebuggerState::WaitingToAttach | DebuggerState::Tracing => {
                // Joining an active session needs no re-injection.
            }
        }
        Ok(())
    }

    /// Detach a client. Removing the last one quits an active shell and
    /// cancels a pending re-attach prompt.
    pub fn remove_client(&mut self, id: ClientId) {
        if self.clients.remove(&id).is_none() {
            return;
        }
        info!(
            event = "server.debugger.client_removed",
            thread = %self.thread,
            client_id = id,
            client_count = self.clients.len(),
        );
        if !self.clients.is_empty() {
            return;
        }
        match self.state {
            DebuggerState::Tracing | DebuggerState::WaitingToAttach => {
                // Nobody is left to drive the shell: ask it to quit.
                if let Err(e) = self.write_master(b"q\n") {
                    warn!(
                        event = "server.debugger.quit_write_failed",
                        thread = %self.thread,
                        error = %e,
                    );
                }
            }
            DebuggerState::DetachedRunning => self.stop_watcher(),
            DebuggerState::Idle => {}
        }
    }

    /// Begin tracing on the target thread. The injected payload plants the
    /// sentinel in the thread's globals before the hook can fire, so no
    /// setup code is ever stepped.
    pub fn attach(&mut self) -> Result<(), ServerError> {
        info!(event = "server.debugger.attach_started", thread = %self.thread);
        self.state = DebuggerState::WaitingToAttach;
        let payload = self.trace.attach_payload();
        remdbg_engine::inject(&self.thread, payload).map_err(|e| {
            self.state = DebuggerState::Idle;
            ServerError::from(e)
        })
    }

    /// Run-mode priming: tracing will be armed by the script runner, not by
    /// injection, so a first client must not trigger an attach.
    pub fn set_waiting(&mut self) {
        if self.state == DebuggerState::Idle {
            self.state = DebuggerState::WaitingToAttach;
        }
    }

    /// Block-until-first-client registration for run mode.
    pub fn add_client_waiter(&mut self) -> std::sync::mpsc::Receiver<()> {
        let (tx, rx) = std::sync::mpsc::channel();
        if !self.clients.is_empty() {
            let _ = tx.send(());
        } else {
            self.client_waiters.push(tx);
        }
        rx
    }

    /// Lifecycle reported by the trace session on the target thread.
    pub fn handle_event(&mut self, event: SessionEvent) {
        debug!(
            event = "server.debugger.session_event",
            thread = %self.thread,
            kind = ?event,
            state = ?self.state,
        );
        match event {
            SessionEvent::Started => {
                self.stop_watcher();
                self.state = DebuggerState::Tracing;
            }
            SessionEvent::Continued => {
                self.state = DebuggerState::DetachedRunning;
                if !self.clients.is_empty() {
                    self.start_watcher();
                }
            }
            SessionEvent::Done => self.on_done(),
        }
    }

    /// The debug session ended: wake every connected client's detach
    /// callback exactly once and go back to Idle.
    fn on_done(&mut self) {
        self.stop_watcher();
        let released = self.clients.len();
        for (_, mut client) in self.clients.drain() {
            if let Some(tx) = client.detach_tx.take() {
                let _ = tx.send(());
            }
        }
        self.state = DebuggerState::Idle;
        info!(
            event = "server.debugger.session_done",
            thread = %self.thread,
            released_clients = released,
        );
    }

    /// Ctrl-C watcher for the Detached-Running state. Runs on a blocking
    /// worker, scanning the slave for 0x03 and discarding everything else;
    /// a hit schedules a re-attach on the loop.
    fn start_watcher(&mut self) {
        let Ok(slave) = self.pty.slave_reader() else {
            warn!(event = "server.debugger.watcher_no_slave", thread = %self.thread);
            return;
        };
        // Raw-ish slave so the 0x03 byte is visible immediately.
        if let Ok(mut attrs) = termios::tcgetattr(&slave) {
            attrs
                .local_flags
                .remove(LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ISIG);
            let _ = termios::tcsetattr(&slave, SetArg::TCSANOW, &attrs);
        }
        let stop = Arc::new(AtomicBool::new(false));
        let watcher_stop = stop.clone();
        let events_tx = self.events_tx.clone();
        let thread_id = self.thread.id;
        let poll_interval = self.ui_poll;
        debug!(event = "server.debugger.watcher_started", thread = %self.thread);
        tokio::task::spawn_blocking(move || {
            watch_for_interrupt(slave, watcher_stop, poll_interval, move || {
                let _ = events_tx.send(LoopEvent::ReAttach(thread_id));
            });
        });
        self.watcher = Some(Watcher { stop });
    }

    fn stop_watcher(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.stop.store(true, Ordering::Release);
            debug!(event = "server.debugger.watcher_stopped", thread = %self.thread);
        }
    }

    fn write_master(&self, data: &[u8]) -> Result<(), ServerError> {
        use std::io::Write;
        let mut writer = self
            .master_writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Final teardown at server shutdown: release clients and close the PTY.
    pub fn shutdown(&mut self) {
        self.on_done();
        self.pty.close();
    }
}

fn watch_for_interrupt(
    mut slave: File,
    stop: Arc<AtomicBool>,
    poll_interval: Duration,
    on_interrupt: impl Fn(),
) {
    let timeout = PollTimeout::from(poll_interval.as_millis().min(250) as u8);
    let mut buf = [0u8; 64];
    while !stop.load(Ordering::Acquire) {
        let fd = unsafe { BorrowedFd::borrow_raw(slave.as_raw_fd()) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        match poll(&mut fds, timeout) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => break,
        }
        match slave.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if buf[..n].contains(&CTRL_C) {
                    on_interrupt();
                    break;
                }
                // Input while the target runs free has nowhere to go.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remdbg_protocol::TermAttrs;

    fn test_config() -> TerminalConfig {
        TerminalConfig {
            term_type: "xterm".to_string(),
            rows: 24,
            cols: 80,
            attrs: TermAttrs {
                input_flags: 0,
                output_flags: 0,
                control_flags: 0,
                local_flags: 0,
                control_chars: vec![],
            },
        }
    }

    fn test_debugger(
        events_tx: mpsc::UnboundedSender<LoopEvent>,
    ) -> (Debugger, Arc<Mutex<Vec<SessionEvent>>>) {
        let pty = Pty::open().unwrap();
        let master_writer = Arc::new(Mutex::new(pty.master_writer().unwrap()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let trace = Arc::new(TraceSession::new(
            pty.slave_reader().unwrap(),
            pty.slave_writer().unwrap(),
            {
                let seen = seen.clone();
                move |e| seen.lock().unwrap().push(e)
            },
        ));
        let thread = ThreadHandle {
            id: u64::MAX - 1,
            name: "missing".to_string(),
        };
        (
            Debugger::new(
                thread,
                pty,
                trace,
                master_writer,
                events_tx,
                Duration::from_millis(20),
            ),
            seen,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_add_client_to_missing_thread_fails_and_rolls_back() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (mut debugger, _) = test_debugger(events_tx);
        let (client, _detach_rx) = Client::new(1, test_config());
        // The registry has no such thread: injection must fail and the
        // client table must stay empty.
        let err = debugger.add_client(client).unwrap_err();
        assert_eq!(err.error_code(), "target_unavailable");
        assert_eq!(debugger.client_count(), 0);
        assert_eq!(debugger.state(), DebuggerState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_done_releases_every_client_exactly_once() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (mut debugger, _) = test_debugger(events_tx);
        debugger.set_waiting(); // avoid the injection path

        let (c1, d1) = Client::new(1, test_config());
        let (c2, d2) = Client::new(2, test_config());
        debugger.add_client(c1).unwrap();
        debugger.add_client(c2).unwrap();
        assert_eq!(debugger.client_count(), 2);

        debugger.handle_event(SessionEvent::Started);
        assert_eq!(debugger.state(), DebuggerState::Tracing);
        debugger.handle_event(SessionEvent::Done);
        assert_eq!(debugger.state(), DebuggerState::Idle);
        assert_eq!(debugger.client_count(), 0);

        d1.await.unwrap();
        d2.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_last_client_removed_while_tracing_sends_quit() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (mut debugger, _) = test_debugger(events_tx);
        debugger.set_waiting();
        let (client, _detach) = Client::new(7, test_config());
        debugger.add_client(client).unwrap();
        debugger.handle_event(SessionEvent::Started);

        let mut slave = debugger.pty.slave_reader().unwrap();
        debugger.remove_client(7);

        // The quit line lands on the slave, where the shell would read it.
        let got = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 8];
            let n = slave.read(&mut buf).unwrap();
            buf[..n].to_vec()
        })
        .await
        .unwrap();
        assert_eq!(got, b"q\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ctrl_c_while_detached_schedules_reattach() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (mut debugger, _) = test_debugger(events_tx);
        debugger.set_waiting();
        let (client, _detach) = Client::new(3, test_config());
        debugger.add_client(client).unwrap();
        debugger.handle_event(SessionEvent::Started);
        debugger.handle_event(SessionEvent::Continued);
        assert_eq!(debugger.state(), DebuggerState::DetachedRunning);

        // A client pressing Ctrl-C shows up on the master write side.
        use std::io::Write;
        let mut master = debugger.pty.master_writer().unwrap();
        master.write_all(&[CTRL_C]).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            LoopEvent::ReAttach(id) => assert_eq!(id, debugger.thread().id),
            other => panic!("unexpected loop event: {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_client_waiter_fires_on_first_client() {
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (mut debugger, _) = test_debugger(events_tx);
        debugger.set_waiting();
        let waiter = debugger.add_client_waiter();
        assert!(waiter
            .recv_timeout(Duration::from_millis(50))
            .is_err());

        let (client, _detach) = Client::new(9, test_config());
        debugger.add_client(client).unwrap();
        waiter.recv_timeout(Duration::from_secs(1)).unwrap();

        // A waiter added while a client is present fires immediately.
        let waiter2 = debugger.add_client_waiter();
        waiter2.recv_timeout(Duration::from_secs(1)).unwrap();
    }
}
