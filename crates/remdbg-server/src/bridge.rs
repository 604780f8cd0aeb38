//! Fan-out of one PTY master to N clients, fan-in of client bytes to the
//! master.
//!
//! A blocking reader task owns the master read side and feeds a broadcast
//! channel plus a scrollback ring; per-client pump tasks subscribe. A slow
//! client lags on its own receiver and skips ahead without stalling anyone
//! else. All writes to the master go through one mutex, merging every
//! client's input into a single ordered stream.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::errors::ServerError;
use crate::pty::Pty;

const CHUNK_SIZE: usize = 4096;

/// Ring of recent master output, replayed to clients attaching mid-session.
pub struct ScrollbackBuffer {
    buffer: VecDeque<u8>,
    capacity: usize,
}

impl ScrollbackBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity.min(CHUNK_SIZE)),
            capacity,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        if data.len() >= self.capacity {
            self.buffer.clear();
            self.buffer.extend(&data[data.len() - self.capacity..]);
            return;
        }
        let overflow = (self.buffer.len() + data.len()).saturating_sub(self.capacity);
        self.buffer.drain(..overflow);
        self.buffer.extend(data);
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buffer.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Why a client's input pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEnd {
    /// The client socket reached EOF.
    Eof,
    /// The scope was cancelled or the master went away.
    Cancelled,
}

pub struct Bridge {
    output_tx: broadcast::Sender<Bytes>,
    scrollback: Arc<Mutex<ScrollbackBuffer>>,
    master_writer: Arc<Mutex<File>>,
}

impl Bridge {
    /// Spawn the blocking master-reader task and return the bridge. The
    /// reader lives until the PTY closes under it.
    pub fn new(
        pty: &Pty,
        master_writer: Arc<Mutex<File>>,
        config: &ServerConfig,
    ) -> Result<Self, ServerError> {
        let (output_tx, _) = broadcast::channel(config.broadcast_capacity);
        let scrollback = Arc::new(Mutex::new(ScrollbackBuffer::new(
            config.scrollback_buffer_size,
        )));
        spawn_master_reader(pty.master_reader()?, output_tx.clone(), scrollback.clone());
        Ok(Self {
            output_tx,
            scrollback,
            master_writer,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.output_tx.subscribe()
    }

    pub fn scrollback_contents(&self) -> Vec<u8> {
        self.scrollback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contents()
    }

    /// Serialised write into the master. Short and buffered by the kernel;
    /// safe to call from the loop thread.
    pub fn write_master(&self, data: &[u8]) -> Result<(), ServerError> {
        let mut writer = self
            .master_writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    pub fn receiver_count(&self) -> usize {
        self.output_tx.receiver_count()
    }
}

fn spawn_master_reader(
    mut reader: File,
    output_tx: broadcast::Sender<Bytes>,
    scrollback: Arc<Mutex<ScrollbackBuffer>>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    debug!(event = "server.bridge.master_eof");
                    break;
                }
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    scrollback
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push(&data);
                    // No receivers just means nobody is attached right now.
                    let _ = output_tx.send(data);
                }
                Err(e) => {
                    // EIO is the normal end: the slave side was closed.
                    debug!(event = "server.bridge.master_read_ended", error = %e);
                    break;
                }
            }
        }
    })
}

/// Forward the master multicast into one client writer until cancelled or
/// the channel closes. Replays `snapshot` (scrollback) first so a client
/// attaching mid-session sees the current screen. Returns the writer.
pub async fn pump_output<W>(
    mut rx: broadcast::Receiver<Bytes>,
    snapshot: Vec<u8>,
    mut writer: W,
    cancel: CancellationToken,
) -> W
where
    W: AsyncWrite + Unpin + Send,
{
    if !snapshot.is_empty() && writer.write_all(&snapshot).await.is_err() {
        return writer;
    }
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Deliver whatever already reached the channel before the
                // scope ended.
                while let Ok(data) = rx.try_recv() {
                    if writer.write_all(&data).await.is_err() {
                        return writer;
                    }
                }
                let _ = writer.flush().await;
                break;
            }
            received = rx.recv() => match received {
                Ok(data) => {
                    if writer.write_all(&data).await.is_err() {
                        break;
                    }
                    let _ = writer.flush().await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(event = "server.bridge.client_lagged", skipped = skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    writer
}

/// Copy client bytes into the master until EOF or cancellation. Everything
/// after the config frame is raw terminal I/O, so bytes are forwarded
/// verbatim; control characters mean whatever the slave's line discipline
/// says they mean.
pub async fn pump_input<R>(
    mut reader: R,
    bridge: Arc<Bridge>,
    cancel: CancellationToken,
) -> (R, InputEnd)
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return (reader, InputEnd::Cancelled),
            read = reader.read(&mut buf) => match read {
                Ok(0) => return (reader, InputEnd::Eof),
                Ok(n) => {
                    if let Err(e) = bridge.write_master(&buf[..n]) {
                        debug!(event = "server.bridge.master_write_failed", error = %e);
                        return (reader, InputEnd::Cancelled);
                    }
                }
                Err(e) => {
                    debug!(event = "server.bridge.client_read_failed", error = %e);
                    return (reader, InputEnd::Eof);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_bridge() -> (Pty, Arc<Bridge>) {
        let pty = Pty::open().unwrap();
        let writer = Arc::new(Mutex::new(pty.master_writer().unwrap()));
        let bridge = Bridge::new(&pty, writer, &ServerConfig::default()).unwrap();
        (pty, Arc::new(bridge))
    }

    #[test]
    fn test_scrollback_keeps_tail() {
        let mut sb = ScrollbackBuffer::new(5);
        sb.push(b"hello world");
        assert_eq!(sb.contents(), b"world");
        sb.push(b"!");
        assert_eq!(sb.contents(), b"orld!");
        assert_eq!(sb.len(), 5);
    }

    #[test]
    fn test_scrollback_incremental() {
        let mut sb = ScrollbackBuffer::new(8);
        sb.push(b"abc");
        sb.push(b"def");
        assert_eq!(sb.contents(), b"abcdef");
        sb.push(b"ghi");
        assert_eq!(sb.contents(), b"bcdefghi");
        assert!(!sb.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_master_output_is_multicast_and_recorded() {
        let (pty, bridge) = test_bridge();
        let mut rx1 = bridge.subscribe();
        let mut rx2 = bridge.subscribe();

        let mut slave = pty.slave_writer().unwrap();
        std::io::Write::write_all(&mut slave, b"prompt> ").unwrap();
        std::io::Write::flush(&mut slave).unwrap();

        let a = tokio::time::timeout(Duration::from_secs(2), rx1.recv())
            .await
            .unwrap()
            .unwrap();
        let b = tokio::time::timeout(Duration::from_secs(2), rx2.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&a[..], b"prompt> ");
        assert_eq!(&b[..], b"prompt> ");

        // Scrollback captured the same bytes for future clients.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while bridge.scrollback_contents().is_empty() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(bridge.scrollback_contents(), b"prompt> ");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pump_input_forwards_bytes_verbatim() {
        let (pty, bridge) = test_bridge();
        // Raw slave so control bytes come back as data, not line-discipline
        // actions.
        let mut slave = pty.slave_reader().unwrap();
        {
            use nix::sys::termios::{self, LocalFlags, SetArg};
            let mut attrs = termios::tcgetattr(&slave).unwrap();
            attrs
                .local_flags
                .remove(LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ISIG);
            termios::tcsetattr(&slave, SetArg::TCSANOW, &attrs).unwrap();
        }

        let (client, mut ours) = tokio::io::duplex(256);
        let (reader, _writer) = tokio::io::split(client);
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(pump_input(reader, bridge.clone(), cancel));

        // Raw terminal I/O: an EOT byte is payload like any other.
        let payload: &[u8] = b"hi\n\x04after";
        ours.write_all(payload).await.unwrap();

        let expected = payload.to_vec();
        let read = tokio::task::spawn_blocking(move || {
            let mut got = Vec::new();
            let mut buf = [0u8; 16];
            while got.len() < expected.len() {
                let n = slave.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                got.extend_from_slice(&buf[..n]);
            }
            got
        });
        let got = tokio::time::timeout(Duration::from_secs(2), read)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, payload);

        // Closing the client socket ends the pump with plain EOF.
        drop(ours);
        let (_reader, end) = tokio::time::timeout(Duration::from_secs(2), pump)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end, InputEnd::Eof);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pump_output_replays_snapshot_then_live() {
        let (_pty, bridge) = test_bridge();
        let rx = bridge.subscribe();
        let (ours, theirs) = tokio::io::duplex(1024);
        let (mut their_read, _their_write) = tokio::io::split(theirs);
        let (_our_read, our_write) = tokio::io::split(ours);

        let cancel = CancellationToken::new();
        let pump = tokio::spawn(pump_output(
            rx,
            b"[scrollback]".to_vec(),
            our_write,
            cancel.clone(),
        ));

        let mut buf = vec![0u8; 12];
        tokio::time::timeout(Duration::from_secs(2), their_read.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"[scrollback]");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), pump)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_write_master_reaches_slave() {
        let (pty, bridge) = test_bridge();
        let mut slave = pty.slave_reader().unwrap();
        bridge.write_master(b"typed\n").unwrap();
        let got = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 16];
            let n = slave.read(&mut buf).unwrap();
            buf[..n].to_vec()
        })
        .await
        .unwrap();
        assert_eq!(got, b"typed\n");
    }
}
