//! Full-screen thread chooser shown to every newly connected client.
//!
//! The app renders to a short-lived chooser PTY whose master is bridged to
//! the client socket; input is parsed from raw slave bytes, so it works for
//! any remote terminal without owning the process's own tty. Returns the
//! chosen thread, or `None` for Exit / client EOF.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossterm::cursor::{Hide, Show};
use crossterm::execute;
use crossterm::terminal::{EnterAlternateScreen, LeaveAlternateScreen};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::termios::{self, LocalFlags, SetArg};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Layout, Rect};
use ratatui::style::{Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, List, ListItem, ListState, Paragraph};
use ratatui::{Terminal, TerminalOptions, Viewport};
use remdbg_engine::registry;
use remdbg_engine::ThreadHandle;
use remdbg_protocol::TerminalConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::pty::Pty;

/// `File` implements both `Read` and `Write`, which makes `crossterm::execute!`
/// ambiguous over which trait's `by_ref` to use. This newtype exposes only
/// `Write` so the macro resolves unambiguously.
struct WriteOnly<'a>(&'a mut File);

impl<'a> Write for WriteOnly<'a> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Focus {
    Debug,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Key {
    Up,
    Down,
    Tab,
    BackTab,
    Enter,
    Cancel,
    Other,
}

/// Incremental decoder for the handful of escape sequences the chooser
/// cares about. A pending lone ESC is resolved by the next read or by a
/// poll timeout.
struct KeyParser {
    pending: Vec<u8>,
}

impl KeyParser {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    fn feed(&mut self, data: &[u8]) -> Vec<Key> {
        let mut keys = Vec::new();
        self.pending.extend_from_slice(data);
        let mut i = 0;
        while i < self.pending.len() {
            match self.pending[i] {
                0x1b => {
                    match self.pending.get(i + 1) {
                        Some(b'[') => match self.pending.get(i + 2) {
                            Some(b'A') => {
                                keys.push(Key::Up);
                                i += 3;
                            }
                            Some(b'B') => {
                                keys.push(Key::Down);
                                i += 3;
                            }
                            Some(b'Z') => {
                                keys.push(Key::BackTab);
                                i += 3;
                            }
                            Some(_) => {
                                // Unrecognised CSI: swallow the final byte too.
                                i += 3;
                            }
                            None => break, // incomplete, wait for more
                        },
                        Some(_) => {
                            keys.push(Key::Cancel); // ESC followed by junk
                            i += 2;
                        }
                        None => break, // maybe a sequence prefix
                    }
                }
                b'\t' => {
                    keys.push(Key::Tab);
                    i += 1;
                }
                b'\r' | b'\n' => {
                    keys.push(Key::Enter);
                    i += 1;
                }
                b'k' => {
                    keys.push(Key::Up);
                    i += 1;
                }
                b'j' => {
                    keys.push(Key::Down);
                    i += 1;
                }
                b'q' | 0x03 | 0x04 => {
                    keys.push(Key::Cancel);
                    i += 1;
                }
                _ => {
                    keys.push(Key::Other);
                    i += 1;
                }
            }
        }
        self.pending.drain(..i);
        keys
    }

    /// Called on poll timeout: a lone buffered ESC is a real Escape.
    fn flush_pending_escape(&mut self) -> Option<Key> {
        if self.pending.as_slice() == [0x1b] {
            self.pending.clear();
            return Some(Key::Cancel);
        }
        None
    }
}

/// Blocking chooser app over the chooser-PTY slave.
pub(crate) fn run_app(
    mut input: File,
    mut output: File,
    threads: Vec<ThreadHandle>,
    rows: u16,
    cols: u16,
    cancelled: Arc<AtomicBool>,
    poll_interval: Duration,
) -> Option<ThreadHandle> {
    // Raw-ish slave: keys must arrive unbuffered and unechoed.
    if let Ok(mut attrs) = termios::tcgetattr(&input) {
        attrs
            .local_flags
            .remove(LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ISIG);
        let _ = termios::tcsetattr(&input, SetArg::TCSANOW, &attrs);
    }
    let _ = execute!(WriteOnly(&mut output), EnterAlternateScreen, Hide);

    let result = chooser_loop(
        &mut input,
        &mut output,
        &threads,
        rows,
        cols,
        &cancelled,
        poll_interval,
    );

    let _ = execute!(WriteOnly(&mut output), Show, LeaveAlternateScreen);
    let _ = output.flush();
    result
}

fn chooser_loop(
    input: &mut File,
    output: &mut File,
    threads: &[ThreadHandle],
    rows: u16,
    cols: u16,
    cancelled: &AtomicBool,
    poll_interval: Duration,
) -> Option<ThreadHandle> {
    let backend = CrosstermBackend::new(output);
    let viewport = Viewport::Fixed(Rect::new(0, 0, cols.max(20), rows.max(6)));
    let mut terminal = Terminal::with_options(backend, TerminalOptions { viewport }).ok()?;

    let mut list_state = ListState::default();
    if !threads.is_empty() {
        list_state.select(Some(0));
    }
    let mut focus = Focus::Debug;
    let mut parser = KeyParser::new();
    let timeout = PollTimeout::from(poll_interval.as_millis().min(250) as u8);
    let mut buf = [0u8; 256];

    loop {
        terminal
            .draw(|frame| draw_ui(frame, threads, &mut list_state, focus))
            .ok()?;

        if cancelled.load(Ordering::Acquire) {
            return None;
        }

        let fd = unsafe { BorrowedFd::borrow_raw(input.as_raw_fd()) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        let keys = match poll(&mut fds, timeout) {
            Ok(0) => match parser.flush_pending_escape() {
                Some(key) => vec![key],
                None => continue,
            },
            Ok(_) => match input.read(&mut buf) {
                Ok(0) | Err(_) => return None,
                Ok(n) => parser.feed(&buf[..n]),
            },
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => return None,
        };

        for key in keys {
            match key {
                Key::Up => {
                    if let Some(sel) = list_state.selected() {
                        list_state.select(Some(sel.saturating_sub(1)));
                    }
                }
                Key::Down => {
                    if let Some(sel) = list_state.selected() {
                        list_state.select(Some((sel + 1).min(threads.len().saturating_sub(1))));
                    }
                }
                Key::Tab | Key::BackTab => {
                    focus = match focus {
                        Focus::Debug => Focus::Exit,
                        Focus::Exit => Focus::Debug,
                    };
                }
                Key::Enter => match focus {
                    Focus::Debug => {
                        if let Some(sel) = list_state.selected() {
                            return threads.get(sel).cloned();
                        }
                        // Nothing to debug; behave like Exit.
                        return None;
                    }
                    Focus::Exit => return None,
                },
                Key::Cancel => return None,
                Key::Other => {}
            }
        }
    }
}

fn draw_ui(
    frame: &mut ratatui::Frame,
    threads: &[ThreadHandle],
    list_state: &mut ListState,
    focus: Focus,
) {
    let area = frame.area();
    let block = Block::bordered().title("Choose thread to debug");
    let inner = block.inner(area);
    frame.render_widget(block, area);

    let chunks = Layout::vertical([
        Constraint::Length(2),
        Constraint::Min(1),
        Constraint::Length(1),
    ])
    .split(inner);

    frame.render_widget(
        Paragraph::new("Choosing a thread will not attach to it"),
        chunks[0],
    );

    let items: Vec<ListItem> = if threads.is_empty() {
        vec![ListItem::new("(no debuggable threads)")]
    } else {
        threads
            .iter()
            .map(|t| ListItem::new(t.to_string()))
            .collect()
    };
    let list = List::new(items)
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .highlight_symbol("> ");
    frame.render_stateful_widget(list, chunks[1], list_state);

    let button = |label: &str, focused: bool| {
        let style = if focused {
            Style::default().add_modifier(Modifier::REVERSED)
        } else {
            Style::default()
        };
        Span::styled(format!("[ {} ]", label), style)
    };
    let buttons = Line::from(vec![
        button("Debug", focus == Focus::Debug),
        Span::raw("   "),
        button("Exit", focus == Focus::Exit),
    ]);
    frame.render_widget(Paragraph::new(buttons), chunks[2]);
}

/// Bridge the client socket to a fresh chooser PTY, run the app, and tear
/// everything down. Returns the socket halves for the next phase and the
/// chosen thread (`None` for Exit or client EOF).
pub async fn run_chooser<R, W>(
    reader: R,
    writer: W,
    config: &TerminalConfig,
    server_config: &ServerConfig,
    shutdown: CancellationToken,
) -> Result<(R, W, Option<ThreadHandle>), ServerError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let threads = registry::live_threads();
    debug!(event = "server.chooser.started", candidates = threads.len());

    let pty = Pty::open()?;
    pty.apply_config(config)?;

    let cancelled = Arc::new(AtomicBool::new(false));
    let scope = CancellationToken::new();

    // Server shutdown must stop a chooser that is sitting idle. The watcher
    // itself ends when this chooser round does.
    {
        let cancelled = cancelled.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    cancelled.store(true, Ordering::Release);
                    scope.cancel();
                }
                _ = scope.cancelled() => {}
            }
        });
    }

    // Chooser output: blocking master reads, forwarded to the client.
    let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
    let mut master_reader = pty.master_reader()?;
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 4096];
        loop {
            match master_reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if out_tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    let out_scope = scope.clone();
    let mut out_task = tokio::spawn(async move {
        let mut writer = writer;
        loop {
            tokio::select! {
                _ = out_scope.cancelled() => {
                    // Drain whatever the app already rendered.
                    while let Ok(chunk) = out_rx.try_recv() {
                        if writer.write_all(&chunk).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
                chunk = out_rx.recv() => match chunk {
                    Some(chunk) => {
                        if writer.write_all(&chunk).await.is_err() {
                            break;
                        }
                        let _ = writer.flush().await;
                    }
                    None => break,
                },
            }
        }
        writer
    });

    // Chooser input: client bytes into the master.
    let mut master_writer = pty.master_writer()?;
    let in_scope = scope.clone();
    let in_cancelled = cancelled.clone();
    let mut in_task = tokio::spawn(async move {
        let mut reader = reader;
        let mut buf = [0u8; 256];
        let mut eof = false;
        loop {
            tokio::select! {
                _ = in_scope.cancelled() => break,
                read = reader.read(&mut buf) => match read {
                    Ok(0) | Err(_) => {
                        eof = true;
                        in_cancelled.store(true, Ordering::Release);
                        break;
                    }
                    Ok(n) => {
                        if master_writer.write_all(&buf[..n]).is_err() {
                            break;
                        }
                        let _ = master_writer.flush();
                    }
                },
            }
        }
        (reader, eof)
    });

    let slave_reader = pty.slave_reader()?;
    let slave_writer = pty.slave_writer()?;
    let app_cancelled = cancelled.clone();
    let (rows, cols) = (config.rows, config.cols);
    let poll_interval = Duration::from_millis(server_config.ui_poll_ms);
    let app = tokio::task::spawn_blocking(move || {
        run_app(
            slave_reader,
            slave_writer,
            threads,
            rows,
            cols,
            app_cancelled,
            poll_interval,
        )
    });

    let choice = app.await.map_err(|e| {
        ServerError::Fatal(format!("chooser task failed: {}", e))
    })?;

    // Tear the bridge down: closing the PTY ends the master reader once the
    // app's slave handles are gone.
    cancelled.store(true, Ordering::Release);
    drop(pty);
    scope.cancel();
    let (reader, eof) = (&mut in_task).await.map_err(|e| {
        ServerError::Fatal(format!("chooser input task failed: {}", e))
    })?;
    let writer = (&mut out_task).await.map_err(|e| {
        ServerError::Fatal(format!("chooser output task failed: {}", e))
    })?;

    let choice = if eof { None } else { choice };
    info!(
        event = "server.chooser.finished",
        chosen = ?choice.as_ref().map(|t| t.to_string()),
        client_eof = eof,
    );
    Ok((reader, writer, choice))
}
