//! Poll-driven byte piping between file descriptors.
//!
//! The client uses this to splice stdin -> socket and socket -> stdout with a
//! single blocking loop. The graph is reader -> {writers}; every writer keeps
//! a pending buffer so a slow destination never blocks the poll loop.

use std::collections::{HashMap, VecDeque};
use std::os::fd::{BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::debug;

use crate::errors::ProtocolError;

const CHUNK_SIZE: usize = 4096;

/// Switch a descriptor to non-blocking mode. Every fd handed to [`Piping`]
/// must be non-blocking.
pub fn set_nonblocking(fd: RawFd) -> Result<(), ProtocolError> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// Fan-in/fan-out copier over non-blocking descriptors.
///
/// Bytes read from one source are appended, in read order, to the buffer of
/// every writer routed from it. A source reaching EOF is removed; any writer
/// left without sources is removed with it. The engine stops once no sources
/// remain. Ownership of the descriptors stays with the caller; the only
/// side effect on removal is a write-side shutdown for sockets, so the peer
/// sees EOF.
pub struct Piping {
    /// reader -> writers routed from it
    routes: HashMap<RawFd, Vec<RawFd>>,
    /// writer -> readers feeding it
    sources: HashMap<RawFd, Vec<RawFd>>,
    /// writer -> bytes accepted from readers but not yet written
    buffers: HashMap<RawFd, VecDeque<u8>>,
}

impl Piping {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            sources: HashMap::new(),
            buffers: HashMap::new(),
        }
    }

    /// Route bytes read from `reader` into `writer`.
    pub fn add_route(&mut self, reader: RawFd, writer: RawFd) -> &mut Self {
        let writers = self.routes.entry(reader).or_default();
        if !writers.contains(&writer) {
            writers.push(writer);
        }
        let readers = self.sources.entry(writer).or_default();
        if !readers.contains(&reader) {
            readers.push(reader);
        }
        self.buffers.entry(writer).or_default();
        self
    }

    /// Run until every source has reached EOF.
    pub fn run(&mut self) -> Result<(), ProtocolError> {
        while !self.routes.is_empty() {
            self.step()?;
        }
        Ok(())
    }

    fn step(&mut self) -> Result<(), ProtocolError> {
        let readers: Vec<RawFd> = self.routes.keys().copied().collect();
        let writers: Vec<RawFd> = self
            .buffers
            .iter()
            .filter(|(_, buf)| !buf.is_empty())
            .map(|(fd, _)| *fd)
            .collect();

        let mut poll_fds: Vec<PollFd> = Vec::with_capacity(readers.len() + writers.len());
        for fd in &readers {
            poll_fds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(*fd) },
                PollFlags::POLLIN,
            ));
        }
        for fd in &writers {
            poll_fds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(*fd) },
                PollFlags::POLLOUT,
            ));
        }

        match poll(&mut poll_fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let events: Vec<PollFlags> = poll_fds
            .iter()
            .map(|p| p.revents().unwrap_or(PollFlags::empty()))
            .collect();
        drop(poll_fds);

        for (i, fd) in readers.iter().enumerate() {
            if events[i].intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
                self.service_reader(*fd);
            }
        }
        for (i, fd) in writers.iter().enumerate() {
            let revents = events[readers.len() + i];
            if revents.intersects(PollFlags::POLLOUT | PollFlags::POLLHUP | PollFlags::POLLERR) {
                self.service_writer(*fd);
            }
        }
        Ok(())
    }

    fn service_reader(&mut self, fd: RawFd) {
        let mut chunk = [0u8; CHUNK_SIZE];
        match nix::unistd::read(fd, &mut chunk) {
            Ok(0) => self.remove_reader(fd),
            Ok(n) => {
                if let Some(writers) = self.routes.get(&fd) {
                    for w in writers.clone() {
                        if let Some(buf) = self.buffers.get_mut(&w) {
                            buf.extend(&chunk[..n]);
                        }
                    }
                }
            }
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => {}
            Err(e) => {
                debug!(event = "protocol.piping.read_failed", fd = fd, error = %e);
                self.remove_reader(fd);
            }
        }
    }

    fn service_writer(&mut self, fd: RawFd) {
        let Some(buf) = self.buffers.get_mut(&fd) else {
            return;
        };
        while !buf.is_empty() {
            let (front, _) = buf.as_slices();
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            match nix::unistd::write(borrowed, front) {
                Ok(n) => {
                    buf.drain(..n);
                }
                Err(Errno::EAGAIN) | Err(Errno::EINTR) => break,
                Err(e) => {
                    debug!(event = "protocol.piping.write_failed", fd = fd, error = %e);
                    self.remove_writer(fd);
                    break;
                }
            }
        }
    }

    /// A source hit EOF or failed: drop it and cascade to writers that have
    /// no remaining sources.
    fn remove_reader(&mut self, fd: RawFd) {
        let Some(writers) = self.routes.remove(&fd) else {
            return;
        };
        debug!(event = "protocol.piping.reader_removed", fd = fd);
        for w in writers {
            if let Some(readers) = self.sources.get_mut(&w) {
                readers.retain(|r| *r != fd);
                if readers.is_empty() {
                    self.remove_writer(w);
                }
            }
        }
    }

    /// Drop a writer. Sources left without any writer are removed too.
    fn remove_writer(&mut self, fd: RawFd) {
        if self.sources.remove(&fd).is_none() {
            return;
        }
        self.buffers.remove(&fd);
        debug!(event = "protocol.piping.writer_removed", fd = fd);
        // Signal EOF to socket peers; harmless ENOTSOCK otherwise.
        let _ = nix::sys::socket::shutdown(fd, nix::sys::socket::Shutdown::Write);

        let mut orphaned: Vec<RawFd> = Vec::new();
        for (r, ws) in self.routes.iter_mut() {
            ws.retain(|w| *w != fd);
            if ws.is_empty() {
                orphaned.push(*r);
            }
        }
        for r in orphaned {
            self.remove_reader(r);
        }
    }
}

impl Default for Piping {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    fn make_pipe() -> (std::os::fd::OwnedFd, std::os::fd::OwnedFd) {
        let (r, w) = nix::unistd::pipe().unwrap();
        set_nonblocking(r.as_raw_fd()).unwrap();
        set_nonblocking(w.as_raw_fd()).unwrap();
        (r, w)
    }

    fn write_all(fd: RawFd, data: &[u8]) {
        let mut written = 0;
        while written < data.len() {
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            written += nix::unistd::write(borrowed, &data[written..]).unwrap();
        }
    }

    fn read_available(fd: RawFd) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match nix::unistd::read(fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(Errno::EAGAIN) => break,
                Err(e) => panic!("read failed: {e}"),
            }
        }
        out
    }

    #[test]
    fn test_single_route_copies_in_order() {
        let (src_r, src_w) = make_pipe();
        let (dst_r, dst_w) = make_pipe();

        write_all(src_w.as_raw_fd(), b"hello ");
        write_all(src_w.as_raw_fd(), b"world");
        drop(src_w); // EOF

        let mut piping = Piping::new();
        piping.add_route(src_r.as_raw_fd(), dst_w.as_raw_fd());
        piping.run().unwrap();
        drop(dst_w);

        assert_eq!(read_available(dst_r.as_raw_fd()), b"hello world");
    }

    #[test]
    fn test_fan_out_preserves_order_to_every_sink() {
        let (src_r, src_w) = make_pipe();
        let (dst1_r, dst1_w) = make_pipe();
        let (dst2_r, dst2_w) = make_pipe();

        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        // Feed incrementally from a thread so the engine interleaves reads
        // and writes rather than seeing one giant buffer.
        let feeder = {
            let payload = payload.clone();
            let fd = src_w.as_raw_fd();
            std::thread::spawn(move || {
                for chunk in payload.chunks(997) {
                    let mut written = 0;
                    while written < chunk.len() {
                        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                        match nix::unistd::write(borrowed, &chunk[written..]) {
                            Ok(n) => written += n,
                            Err(Errno::EAGAIN) => std::thread::yield_now(),
                            Err(e) => panic!("feeder write failed: {e}"),
                        }
                    }
                }
                drop(src_w);
            })
        };

        let collector = |fd: std::os::fd::OwnedFd| {
            std::thread::spawn(move || {
                let mut out = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    match nix::unistd::read(fd.as_raw_fd(), &mut buf) {
                        Ok(0) => break,
                        Ok(n) => out.extend_from_slice(&buf[..n]),
                        Err(Errno::EAGAIN) => std::thread::yield_now(),
                        Err(e) => panic!("collector read failed: {e}"),
                    }
                }
                out
            })
        };
        let c1 = collector(dst1_r);
        let c2 = collector(dst2_r);

        let mut piping = Piping::new();
        piping
            .add_route(src_r.as_raw_fd(), dst1_w.as_raw_fd())
            .add_route(src_r.as_raw_fd(), dst2_w.as_raw_fd());
        piping.run().unwrap();
        drop(dst1_w);
        drop(dst2_w);

        feeder.join().unwrap();
        assert_eq!(c1.join().unwrap(), payload);
        assert_eq!(c2.join().unwrap(), payload);
    }

    #[test]
    fn test_source_eof_cascades_and_engine_stops() {
        let (a_r, a_w) = make_pipe();
        let (b_r, b_w) = make_pipe();
        let (out_r, out_w) = make_pipe();

        write_all(a_w.as_raw_fd(), b"from a");
        write_all(b_w.as_raw_fd(), b"from b");
        drop(a_w);
        drop(b_w);

        let mut piping = Piping::new();
        piping
            .add_route(a_r.as_raw_fd(), out_w.as_raw_fd())
            .add_route(b_r.as_raw_fd(), out_w.as_raw_fd());
        // Both sources EOF after their payloads; run() must return.
        piping.run().unwrap();
        drop(out_w);

        let got = read_available(out_r.as_raw_fd());
        assert_eq!(got.len(), "from a".len() + "from b".len());
    }

    #[test]
    fn test_failed_writer_dropped_without_killing_other_sink() {
        // EPIPE raises SIGPIPE; the test must survive it.
        unsafe {
            let _ = nix::sys::signal::signal(
                nix::sys::signal::Signal::SIGPIPE,
                nix::sys::signal::SigHandler::SigIgn,
            );
        }

        let (src_r, src_w) = make_pipe();
        let (good_r, good_w) = make_pipe();
        let (bad_r, bad_w) = make_pipe();
        drop(bad_r); // Writing to bad_w now fails with EPIPE.

        write_all(src_w.as_raw_fd(), b"payload");
        drop(src_w);

        let mut piping = Piping::new();
        piping
            .add_route(src_r.as_raw_fd(), good_w.as_raw_fd())
            .add_route(src_r.as_raw_fd(), bad_w.as_raw_fd());
        piping.run().unwrap();
        drop(good_w);

        assert_eq!(read_available(good_r.as_raw_fd()), b"payload");
    }
}
