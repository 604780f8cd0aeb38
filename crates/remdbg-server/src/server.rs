//! Process-wide debug server.
//!
//! A single dedicated OS thread hosts a current-thread tokio runtime; every
//! connection handler, PTY pump and chooser await runs inside that loop.
//! Target threads talk to the loop through two thread-safe channels: a
//! command channel (session lookup for builtins) and an event channel
//! (trace lifecycle, re-attach requests).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use remdbg_engine::{registry, EngineError, SessionEvent, ThreadHandle, TraceSession};
use remdbg_protocol::framing::read_config;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chooser::run_chooser;
use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::session::{ConnectOutcome, Session};

/// Default server address: loopback on the project port.
pub fn default_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], remdbg_protocol::DEFAULT_PORT))
}

/// Events scheduled onto the loop from target threads and watchers.
#[derive(Debug)]
pub enum LoopEvent {
    /// A trace session on the given thread changed state.
    Session(u64, SessionEvent),
    /// Ctrl-C on a detached PTY: re-attach the thread's debugger.
    ReAttach(u64),
}

/// Requests from outside the loop (engine builtins, run mode).
pub enum ServerCmd {
    ObtainSession {
        thread: ThreadHandle,
        reply: std::sync::mpsc::Sender<Result<Arc<TraceSession>, ServerError>>,
    },
    PrimeRunSession {
        thread: ThreadHandle,
        reply: std::sync::mpsc::Sender<
            Result<(Arc<TraceSession>, std::sync::mpsc::Receiver<()>), ServerError>,
        >,
    },
}

struct ServerShared {
    addr: SocketAddr,
    cmd_tx: mpsc::UnboundedSender<ServerCmd>,
    shutdown: CancellationToken,
    fatal: Arc<Mutex<Option<String>>>,
    join: Option<std::thread::JoinHandle<()>>,
}

static STATE: Mutex<Option<ServerShared>> = Mutex::new(None);
static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

const READY_TIMEOUT: Duration = Duration::from_secs(10);
const CMD_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Ensure the process-wide server is listening at `addr`.
///
/// Idempotent for the same address. A different address fails with
/// `AlreadyBound`. If a previous loop died with a fatal error, that error is
/// re-raised here instead of silently re-initialising.
pub fn make_sure_listening_at(addr: SocketAddr) -> Result<(), ServerError> {
    make_sure_listening_at_with(addr, ServerConfig::default())
}

pub fn make_sure_listening_at_with(
    addr: SocketAddr,
    config: ServerConfig,
) -> Result<(), ServerError> {
    config.validate()?;
    let mut state = STATE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(shared) = state.as_ref() {
        let fatal = shared
            .fatal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(message) = fatal {
            return Err(ServerError::Fatal(message));
        }
        if shared.addr != addr {
            return Err(ServerError::AlreadyBound(shared.addr));
        }
        return Ok(());
    }

    let fatal: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let shutdown = CancellationToken::new();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), ServerError>>();

    let loop_fatal = fatal.clone();
    let loop_shutdown = shutdown.clone();
    let join = std::thread::Builder::new()
        .name("remdbg-server".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = ready_tx.send(Err(ServerError::Fatal(format!(
                        "event loop construction failed: {}",
                        e
                    ))));
                    return;
                }
            };
            runtime.block_on(async {
                let listener = match TcpListener::bind(addr).await {
                    Ok(listener) => {
                        let _ = ready_tx.send(Ok(()));
                        listener
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(ServerError::Io(e)));
                        return;
                    }
                };
                serve(listener, config, loop_shutdown, loop_fatal, cmd_rx).await;
            });
            // Give in-flight blocking tasks (PTY readers already unblocked
            // by session teardown) a bounded window to finish.
            runtime.shutdown_timeout(Duration::from_secs(5));
        })
        .map_err(|e| ServerError::Fatal(format!("server thread spawn failed: {}", e)))?;

    match ready_rx.recv_timeout(READY_TIMEOUT) {
        Ok(Ok(())) => {
            remdbg_engine::set_session_provider(Arc::new(LoopSessionProvider {
                cmd_tx: cmd_tx.clone(),
            }));
            info!(event = "server.listening", addr = %addr);
            *state = Some(ServerShared {
                addr,
                cmd_tx,
                shutdown,
                fatal,
                join: Some(join),
            });
            Ok(())
        }
        Ok(Err(e)) => {
            let _ = join.join();
            Err(e)
        }
        Err(_) => Err(ServerError::Fatal(
            "server thread did not report readiness".to_string(),
        )),
    }
}

/// Cancel the serve loop, close all sessions and join the loop thread.
pub fn stop() -> Result<(), ServerError> {
    let shared = {
        let mut state = STATE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.take()
    };
    let Some(mut shared) = shared else {
        return Err(ServerError::NotRunning);
    };
    remdbg_engine::clear_session_provider();
    info!(event = "server.stop_started", addr = %shared.addr);
    shared.shutdown.cancel();
    if let Some(join) = shared.join.take() {
        let _ = join.join();
    }
    info!(event = "server.stop_completed");
    Ok(())
}

/// Send a command into the loop and wait for its reply.
pub(crate) fn loop_request<T>(
    build: impl FnOnce(std::sync::mpsc::Sender<Result<T, ServerError>>) -> ServerCmd,
) -> Result<T, ServerError> {
    let cmd_tx = {
        let state = STATE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(shared) = state.as_ref() else {
            return Err(ServerError::NotRunning);
        };
        shared.cmd_tx.clone()
    };
    let (reply_tx, reply_rx) = std::sync::mpsc::channel();
    cmd_tx
        .send(build(reply_tx))
        .map_err(|_| ServerError::NotRunning)?;
    reply_rx
        .recv_timeout(CMD_REPLY_TIMEOUT)
        .map_err(|_| ServerError::Fatal("server loop did not reply".to_string()))?
}

struct LoopSessionProvider {
    cmd_tx: mpsc::UnboundedSender<ServerCmd>,
}

impl remdbg_engine::SessionProvider for LoopSessionProvider {
    fn session_for_current_thread(&self) -> Result<Arc<TraceSession>, EngineError> {
        let thread = registry::current_thread_handle().ok_or_else(|| {
            EngineError::TargetUnavailable("current thread is not registered".to_string())
        })?;
        let (reply_tx, reply_rx) = std::sync::mpsc::channel();
        self.cmd_tx
            .send(ServerCmd::ObtainSession {
                thread,
                reply: reply_tx,
            })
            .map_err(|_| EngineError::TargetUnavailable("debug server stopped".to_string()))?;
        match reply_rx.recv_timeout(CMD_REPLY_TIMEOUT) {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(e)) => Err(EngineError::TargetUnavailable(e.to_string())),
            Err(_) => Err(EngineError::TargetUnavailable(
                "debug server did not reply".to_string(),
            )),
        }
    }
}

struct Table {
    sessions: HashMap<u64, Arc<Session>>,
    /// Creation order; closed in reverse at shutdown.
    order: Vec<u64>,
    config: ServerConfig,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
}

async fn serve(
    listener: TcpListener,
    config: ServerConfig,
    shutdown: CancellationToken,
    fatal: Arc<Mutex<Option<String>>>,
    mut cmd_rx: mpsc::UnboundedReceiver<ServerCmd>,
) {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let table = Arc::new(RwLock::new(Table {
        sessions: HashMap::new(),
        order: Vec::new(),
        config: config.clone(),
        events_tx,
    }));

    let mut accept_failures: u32 = 0;
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    accept_failures = 0;
                    info!(event = "server.client_connected", peer = %peer);
                    let table = table.clone();
                    let token = shutdown.child_token();
                    tokio::spawn(async move {
                        handle_connection(stream, table, token).await;
                        info!(event = "server.client_finished", peer = %peer);
                    });
                }
                Err(e) => {
                    accept_failures += 1;
                    error!(event = "server.accept_failed", error = %e, failures = accept_failures);
                    if accept_failures >= 10 {
                        // The listener is wedged; record and stop.
                        *fatal.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) =
                            Some(format!("accept failed repeatedly: {}", e));
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(config.accept_retry_ms)).await;
                }
            },
            Some(event) = events_rx.recv() => dispatch_event(&table, event).await,
            Some(cmd) = cmd_rx.recv() => handle_cmd(&table, cmd).await,
            _ = shutdown.cancelled() => {
                info!(event = "server.shutdown_started");
                break;
            }
        }
    }

    // Close sessions LIFO, the exit-stack order.
    let mut guard = table.write().await;
    let order: Vec<u64> = guard.order.drain(..).collect();
    for id in order.into_iter().rev() {
        if let Some(session) = guard.sessions.remove(&id) {
            session.shutdown().await;
        }
    }
    info!(event = "server.shutdown_completed");
}

async fn dispatch_event(table: &Arc<RwLock<Table>>, event: LoopEvent) {
    match event {
        LoopEvent::Session(thread_id, session_event) => {
            let session = table.read().await.sessions.get(&thread_id).cloned();
            if let Some(session) = session {
                session.debugger().lock().await.handle_event(session_event);
            }
        }
        LoopEvent::ReAttach(thread_id) => {
            let session = table.read().await.sessions.get(&thread_id).cloned();
            if let Some(session) = session {
                if let Err(e) = session.debugger().lock().await.attach() {
                    warn!(
                        event = "server.reattach_failed",
                        thread_id = thread_id,
                        error = %e,
                    );
                }
            }
        }
    }
}

async fn handle_cmd(table: &Arc<RwLock<Table>>, cmd: ServerCmd) {
    match cmd {
        ServerCmd::ObtainSession { thread, reply } => {
            let result = get_or_create(table, thread).await.map(|s| s.trace_session());
            let _ = reply.send(result);
        }
        ServerCmd::PrimeRunSession { thread, reply } => {
            let result = match get_or_create(table, thread).await {
                Ok(session) => {
                    let mut debugger = session.debugger().lock().await;
                    debugger.set_waiting();
                    let waiter = debugger.add_client_waiter();
                    Ok((session.trace_session(), waiter))
                }
                Err(e) => Err(e),
            };
            let _ = reply.send(result);
        }
    }
}

async fn get_or_create(
    table: &Arc<RwLock<Table>>,
    thread: ThreadHandle,
) -> Result<Arc<Session>, ServerError> {
    let mut guard = table.write().await;
    if let Some(session) = guard.sessions.get(&thread.id) {
        return Ok(session.clone());
    }
    let session = Session::create(thread.clone(), &guard.config, guard.events_tx.clone())?;
    guard.sessions.insert(thread.id, session.clone());
    guard.order.push(thread.id);
    Ok(session)
}

/// One client connection: framed config, then chooser/session rounds until
/// the client leaves or picks Exit.
async fn handle_connection(
    stream: TcpStream,
    table: Arc<RwLock<Table>>,
    token: CancellationToken,
) {
    let (mut reader, mut writer) = stream.into_split();

    let term_config = match read_config(&mut reader).await {
        Ok(config) => config,
        Err(e) => {
            warn!(event = "server.config_read_failed", error = %e);
            let _ = writer
                .write_all(format!("\r\n{}\r\nClosing connection\r\n", e).as_bytes())
                .await;
            let _ = writer.shutdown().await;
            return;
        }
    };
    debug!(
        event = "server.config_received",
        term = %term_config.term_type,
        rows = term_config.rows,
        cols = term_config.cols,
    );

    let server_config = table.read().await.config.clone();
    loop {
        let (r, w, choice) =
            match run_chooser(reader, writer, &term_config, &server_config, token.clone()).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(event = "server.chooser_failed", error = %e);
                    return;
                }
            };
        reader = r;
        writer = w;

        let Some(thread) = choice else {
            break;
        };

        let session = match get_or_create(&table, thread).await {
            Ok(session) => session,
            Err(e) => {
                // The client still gets the failure as text, then EOF.
                error!(event = "server.session_create_failed", error = %e);
                let _ = writer.write_all(format!("\r\n{}\r\n", e).as_bytes()).await;
                break;
            }
        };

        let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        match session
            .connect_client(reader, writer, term_config.clone(), client_id, token.clone())
            .await
        {
            Ok((r, w, outcome)) => {
                reader = r;
                writer = w;
                match outcome {
                    ConnectOutcome::ClientEof | ConnectOutcome::Shutdown => break,
                    ConnectOutcome::DebuggerDone => {
                        // Same socket goes back to the chooser.
                    }
                }
            }
            Err(e) => {
                error!(event = "server.connect_client_failed", error = %e);
                return;
            }
        }
    }

    let _ = writer.write_all(b"\r\nClosing connection\r\n").await;
    let _ = writer.shutdown().await;
}
