use crate::transport::{SendStatus};

use mio::net::{TcpListener, TcpStream as MioTcpStream};

use std::net::{SocketAddr, SocketAddrV4, TcpStream, Shutdown};
use std::time::{Duration};
use std::io::{self, ErrorKind, Read, Write};

/// Max bytes accepted from one connection. One connection carries one small packet.
pub const MAX_STREAM_LEN: usize = 64 * 1024;

const INPUT_BUFFER_SIZE: usize = 4096;

/// Connects, writes the whole `data` and closes.
/// Any failure is reported as [`SendStatus::Unreachable`].
pub fn send(addr: SocketAddrV4, data: &[u8], connect_timeout: Duration) -> SendStatus {
    let result = TcpStream::connect_timeout(&SocketAddr::V4(addr), connect_timeout).and_then(
        |mut stream| {
            stream.write_all(data)?;
            stream.flush()?;
            stream.shutdown(Shutdown::Write)
        },
    );

    match result {
        Ok(()) => SendStatus::Sent,
        Err(err) => {
            log::debug!("Stream to {} failed: {}", addr, err);
            SendStatus::Unreachable
        }
    }
}

pub fn bind_listener(addr: SocketAddrV4) -> io::Result<TcpListener> {
    TcpListener::bind(SocketAddr::V4(addr))
}

/// Result of [`Connection::read()`].
#[derive(Debug, PartialEq, Eq)]
pub enum ReadStatus {
    /// The remote still can send data.
    WaitNextEvent,
    /// The remote closed its side: the content is complete.
    Finished,
    /// The connection failed or sent too much data. It must be discarded.
    Discarded,
}

/// An accepted connection that is being read until the remote closes it.
pub struct Connection {
    stream: MioTcpStream,
    peer_addr: SocketAddr,
    content: Vec<u8>,
}

impl Connection {
    pub fn new(stream: MioTcpStream, peer_addr: SocketAddr) -> Self {
        Self { stream, peer_addr, content: Vec::new() }
    }

    pub fn stream_mut(&mut self) -> &mut MioTcpStream {
        &mut self.stream
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Reads what is currently available in the non-blocking stream.
    pub fn read(&mut self) -> ReadStatus {
        let mut input_buffer = [0; INPUT_BUFFER_SIZE];
        loop {
            match self.stream.read(&mut input_buffer) {
                Ok(0) => break ReadStatus::Finished,
                Ok(size) => {
                    self.content.extend_from_slice(&input_buffer[..size]);
                    if self.content.len() > MAX_STREAM_LEN {
                        log::warn!("Stream from {} exceeds {} bytes", self.peer_addr, MAX_STREAM_LEN);
                        break ReadStatus::Discarded
                    }
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
                    break ReadStatus::WaitNextEvent
                }
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::debug!("Stream from {} read error: {}", self.peer_addr, err);
                    break ReadStatus::Discarded
                }
            }
        }
    }

    /// Newline-separated units received. Units that are not valid UTF-8 are dropped.
    pub fn lines(&self) -> Vec<&str> {
        self.content
            .split(|byte| *byte == b'\n')
            .filter_map(|line| std::str::from_utf8(line).ok())
            .filter(|line| !line.trim().is_empty())
            .collect()
    }
}
