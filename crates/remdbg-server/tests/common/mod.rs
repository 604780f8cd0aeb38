//! Helpers shared by the end-to-end scenario tests: a scripted TCP client
//! that speaks the framing protocol and drives the chooser and shell.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use remdbg_protocol::{send_config, TermAttrs, TerminalConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Grab a port the kernel considers free right now.
pub fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe socket");
    let addr = listener.local_addr().expect("probe addr");
    drop(listener);
    addr
}

/// A terminal config that does not require a real tty.
pub fn test_term_config() -> TerminalConfig {
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

/// Connect with retries (the server thread may still be binding) and send
/// the framed terminal config.
pub async fn connect_and_configure(addr: SocketAddr) -> TcpStream {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let mut stream = loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => break stream,
            Err(_) if std::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => panic!("could not connect to {}: {}", addr, e),
        }
    };
    let mut frame = Vec::new();
    send_config(&mut frame, &test_term_config()).expect("encode config");
    stream.write_all(&frame).await.expect("send config");
    stream
}

/// Read until the accumulated output contains `needle` (or panic after the
/// timeout with what was seen).
pub async fn read_until(stream: &mut TcpStream, needle: &str, collected: &mut Vec<u8>) {
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    let mut buf = [0u8; 4096];
    loop {
        if String::from_utf8_lossy(collected).contains(needle) {
            return;
        }
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            panic!(
                "timed out waiting for {:?}; output so far: {:?}",
                needle,
                String::from_utf8_lossy(collected)
            );
        }
        match tokio::time::timeout(remaining, stream.read(&mut buf)).await {
            Ok(Ok(0)) => panic!(
                "connection closed while waiting for {:?}; output so far: {:?}",
                needle,
                String::from_utf8_lossy(collected)
            ),
            Ok(Ok(n)) => collected.extend_from_slice(&buf[..n]),
            Ok(Err(e)) => panic!("read failed while waiting for {:?}: {}", needle, e),
            Err(_) => panic!(
                "timed out waiting for {:?}; output so far: {:?}",
                needle,
                String::from_utf8_lossy(collected)
            ),
        }
    }
}

/// Read until `needle` has appeared at least `count` times in the
/// accumulated output.
pub async fn read_until_count(
    stream: &mut TcpStream,
    needle: &str,
    count: usize,
    collected: &mut Vec<u8>,
) {
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    let mut buf = [0u8; 4096];
    loop {
        if String::from_utf8_lossy(collected).matches(needle).count() >= count {
            return;
        }
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            panic!(
                "timed out waiting for {} occurrences of {:?}; output so far: {:?}",
                count,
                needle,
                String::from_utf8_lossy(collected)
            );
        }
        match tokio::time::timeout(remaining, stream.read(&mut buf)).await {
            Ok(Ok(0)) => panic!("connection closed waiting for {:?} x{}", needle, count),
            Ok(Ok(n)) => collected.extend_from_slice(&buf[..n]),
            Ok(Err(e)) => panic!("read failed: {}", e),
            Err(_) => panic!(
                "timed out waiting for {} occurrences of {:?}",
                count, needle
            ),
        }
    }
}

/// Read until the server closes the socket, returning everything seen.
pub async fn read_to_eof(stream: &mut TcpStream, collected: &mut Vec<u8>) {
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    let mut buf = [0u8; 4096];
    loop {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        if remaining.is_zero() {
            panic!("server never closed the connection");
        }
        match tokio::time::timeout(remaining, stream.read(&mut buf)).await {
            Ok(Ok(0)) => return,
            Ok(Ok(n)) => collected.extend_from_slice(&buf[..n]),
            Ok(Err(_)) => return,
            Err(_) => panic!("server never closed the connection"),
        }
    }
}
