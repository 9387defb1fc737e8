//! TCP connection to the mount controller
//!
//! This is the only place that touches the socket. A connection is split into
//! a `FrameReader` owned by the session thread and a `FrameWriter` kept behind
//! the session's single-writer lock.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use log::debug;
use rtcproto::{encode, Endpoint, FrameDecoder, Message, RtcError, RtcResult};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::config::constants::READ_BUFFER_SIZE;

/// An open TCP connection that has not been split yet
pub struct TcpConnection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpConnection {
    /// Connect to the endpoint, trying each resolved address in turn
    pub fn open(endpoint: &Endpoint, timeout: Duration) -> RtcResult<Self> {
        let mut last_error = None;

        for addr in endpoint.resolve()? {
            match Self::open_addr(addr, timeout) {
                Ok(stream) => {
                    debug!("Connected to {} ({})", endpoint, addr);
                    return Ok(Self { stream, peer: addr });
                }
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no address to try".to_string());
        Err(RtcError::Connect(format!("{} unreachable: {}", endpoint, reason)))
    }

    fn open_addr(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.connect_timeout(&SockAddr::from(addr), timeout)?;
        socket.set_nodelay(true)?;
        socket.set_keepalive(true)?;
        Ok(socket.into())
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Split into reader and writer halves
    ///
    /// The reader wakes up every `tick` even when nothing arrives.
    pub fn split(self, tick: Duration) -> RtcResult<(FrameReader, FrameWriter)> {
        self.stream.set_read_timeout(Some(tick))?;
        self.stream.set_write_timeout(Some(tick.max(Duration::from_secs(1))))?;
        let writer = self.stream.try_clone()?;

        Ok((
            FrameReader {
                stream: self.stream,
                decoder: FrameDecoder::new(),
                buffer: vec![0u8; READ_BUFFER_SIZE],
            },
            FrameWriter { stream: writer },
        ))
    }
}

/// What a single read produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Bytes arrived (possibly not yet a whole frame)
    Data,
    /// The read timed out
    Idle,
    /// The peer closed the connection
    Closed,
}

/// Receiving half of a connection; owns the decode buffer
pub struct FrameReader {
    stream: TcpStream,
    decoder: FrameDecoder,
    buffer: Vec<u8>,
}

impl FrameReader {
    /// Read once and push every complete message onto `out`
    ///
    /// Messages decoded before a malformed frame are still pushed before
    /// the `MalformedFrame` error is returned.
    pub fn read_messages(&mut self, out: &mut Vec<Message>) -> RtcResult<ReadStatus> {
        let n = match self.stream.read(&mut self.buffer) {
            Ok(0) => return Ok(ReadStatus::Closed),
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock
                || e.kind() == io::ErrorKind::TimedOut =>
            {
                return Ok(ReadStatus::Idle);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(ReadStatus::Idle),
            Err(e) => return Err(RtcError::Io(e)),
        };

        self.decoder.extend(&self.buffer[..n]);
        while let Some(message) = self.decoder.next_message()? {
            out.push(message);
        }
        Ok(ReadStatus::Data)
    }
}

/// Sending half of a connection
pub struct FrameWriter {
    stream: TcpStream,
}

impl FrameWriter {
    /// Write one whole frame
    pub fn write_message(&mut self, message: &Message) -> RtcResult<()> {
        let frame = encode(message)?;
        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Shut the socket down in both directions, waking the reader
    pub fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
