//! One Session per target thread: the Debugger plus the PTY bridge over its
//! master, created on first demand and kept until server shutdown.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use remdbg_engine::{ThreadHandle, TraceSession};
use remdbg_protocol::TerminalConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bridge::{self, Bridge, InputEnd};
use crate::config::ServerConfig;
use crate::debugger::{Client, ClientId, Debugger};
use crate::errors::ServerError;
use crate::pty::Pty;
use crate::server::LoopEvent;

/// How long a departing client's output pump waits for in-flight master
/// bytes before closing.
const OUTPUT_SETTLE: Duration = Duration::from_millis(50);

/// Why `connect_client` returned: the three ways a client leaves a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The client socket reached EOF; the connection is over.
    ClientEof,
    /// The debug session ended (quit or script completion).
    DebuggerDone,
    /// The server is shutting down.
    Shutdown,
}

pub struct Session {
    thread: ThreadHandle,
    debugger: tokio::sync::Mutex<Debugger>,
    bridge: Arc<Bridge>,
    trace: Arc<TraceSession>,
}

impl Session {
    /// Open the thread's PTY, wire the trace session onto its slave and the
    /// bridge onto its master.
    pub fn create(
        thread: ThreadHandle,
        config: &ServerConfig,
        events_tx: mpsc::UnboundedSender<LoopEvent>,
    ) -> Result<Arc<Self>, ServerError> {
        let pty = Pty::open()?;
        let master_writer = Arc::new(Mutex::new(pty.master_writer()?));
        let bridge = Arc::new(Bridge::new(&pty, master_writer.clone(), config)?);

        let session_events_tx = events_tx.clone();
        let thread_id = thread.id;
        let trace = Arc::new(TraceSession::new(
            pty.slave_reader()?,
            pty.slave_writer()?,
            move |event| {
                let _ = session_events_tx.send(LoopEvent::Session(thread_id, event));
            },
        ));

        let debugger = Debugger::new(
            thread.clone(),
            pty,
            trace.clone(),
            master_writer,
            events_tx,
            Duration::from_millis(config.ui_poll_ms),
        );
        info!(event = "server.session.created", thread = %thread);
        Ok(Arc::new(Self {
            thread,
            debugger: tokio::sync::Mutex::new(debugger),
            bridge,
            trace,
        }))
    }

    pub fn thread(&self) -> &ThreadHandle {
        &self.thread
    }

    pub fn trace_session(&self) -> Arc<TraceSession> {
        self.trace.clone()
    }

    pub fn debugger(&self) -> &tokio::sync::Mutex<Debugger> {
        &self.debugger
    }

    /// Bind one remote client to this session until its socket closes, the
    /// debugger finishes, or the server shuts down. On every exit path the
    /// client is removed from the debugger and the bridge scope is torn
    /// down; the socket halves are handed back so the connection can
    /// re-enter the chooser.
    pub async fn connect_client<R, W>(
        self: &Arc<Self>,
        reader: R,
        writer: W,
        config: TerminalConfig,
        client_id: ClientId,
        shutdown: CancellationToken,
    ) -> Result<(R, W, ConnectOutcome), ServerError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (client, mut detach_rx) = Client::new(client_id, config);

        let scope = CancellationToken::new();
        let out_task = tokio::spawn(bridge::pump_output(
            self.bridge.subscribe(),
            self.bridge.scrollback_contents(),
            writer,
            scope.clone(),
        ));
        let mut in_task = tokio::spawn(bridge::pump_input(
            reader,
            self.bridge.clone(),
            scope.clone(),
        ));

        if let Err(e) = self.debugger.lock().await.add_client(client) {
            // Attach failed (for example the target thread died between the
            // chooser and now). Tell the client and end the connection.
            debug!(event = "server.session.add_client_failed", error = %e);
            scope.cancel();
            let (reader, _) = in_task.await.map_err(join_failure)?;
            let mut writer = out_task.await.map_err(join_failure)?;
            use tokio::io::AsyncWriteExt;
            let _ = writer.write_all(format!("\r\n{}\r\n", e).as_bytes()).await;
            return Ok((reader, writer, ConnectOutcome::ClientEof));
        }

        // Wait for whichever comes first: client gone, debugger done, or
        // shutdown. The internal DebuggerQuit outcome is reported as
        // success to the connection loop.
        let (input_result, outcome) = tokio::select! {
            input = &mut in_task => {
                let (reader, end) = input.map_err(join_failure)?;
                let outcome = match end {
                    InputEnd::Eof | InputEnd::Cancelled => ConnectOutcome::ClientEof,
                };
                (Some(reader), outcome)
            }
            _ = &mut detach_rx => (None, ConnectOutcome::DebuggerDone),
            _ = shutdown.cancelled() => (None, ConnectOutcome::Shutdown),
        };

        self.debugger.lock().await.remove_client(client_id);
        if outcome != ConnectOutcome::ClientEof {
            // The shell's final output may still be crossing the master;
            // give the bridge reader a moment before the pump closes.
            tokio::time::sleep(OUTPUT_SETTLE).await;
        }
        scope.cancel();
        let reader = match input_result {
            Some(reader) => reader,
            None => in_task.await.map_err(join_failure)?.0,
        };
        let writer = out_task.await.map_err(join_failure)?;

        info!(
            event = "server.session.client_disconnected",
            thread = %self.thread,
            client_id = client_id,
            outcome = ?outcome,
        );
        Ok((reader, writer, outcome))
    }

    /// Shutdown path: release clients, close the PTY (which also ends the
    /// bridge's master reader).
    pub async fn shutdown(&self) {
        self.debugger.lock().await.shutdown();
    }
}

fn join_failure(e: tokio::task::JoinError) -> ServerError {
    ServerError::Fatal(format!("bridge task failed: {}", e))
}
