//! Scripted mount peer
//!
//! Plays the mount's side of the link one step at a time so tests can decide
//! exactly what the controller sees and when.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::debug;
use rtcproto::{
    encode, Ack, Command, Endpoint, FrameDecoder, Heartbeat, Message, RtcResult, TelemetryFrame,
};

const ACCEPT_POLL: Duration = Duration::from_millis(5);

/// Listening side of a scripted peer
pub struct ScriptedPeer {
    listener: TcpListener,
    endpoint: Endpoint,
}

impl ScriptedPeer {
    /// Listen on an ephemeral loopback port
    pub fn bind() -> RtcResult<Self> {
        Self::bind_to(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    pub fn bind_to(addr: SocketAddr) -> RtcResult<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let endpoint = Endpoint::from(listener.local_addr()?);
        Ok(Self { listener, endpoint })
    }

    /// Where the controller should connect
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    /// Wait for the controller to connect
    pub fn accept(&self, timeout: Duration) -> RtcResult<Option<PeerConnection>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    debug!("Scripted peer accepted {}", addr);
                    return PeerConnection::new(stream).map(Some);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

struct HeartbeatPump {
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// One accepted controller connection
pub struct PeerConnection {
    reader: TcpStream,
    writer: Arc<Mutex<TcpStream>>,
    decoder: FrameDecoder,
    buffer: Vec<u8>,
    heartbeats: Option<HeartbeatPump>,
}

impl PeerConnection {
    fn new(stream: TcpStream) -> RtcResult<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: stream,
            writer: Arc::new(Mutex::new(writer)),
            decoder: FrameDecoder::new(),
            buffer: vec![0u8; 4096],
            heartbeats: None,
        })
    }

    /// Next frame from the controller, or `None` if nothing arrives in time
    ///
    /// A closed connection is an error.
    pub fn recv(&mut self, timeout: Duration) -> RtcResult<Option<Message>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.decoder.next_message()? {
                return Ok(Some(message));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.reader
                .set_read_timeout(Some((deadline - now).max(Duration::from_millis(1))))?;

            match self.reader.read(&mut self.buffer) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "controller closed the connection",
                    )
                    .into())
                }
                Ok(n) => self.decoder.extend(&self.buffer[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Next command from the controller, skipping heartbeats
    pub fn expect_command(&mut self, timeout: Duration) -> RtcResult<Option<Command>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.recv(remaining)? {
                Some(Message::Command(command)) => return Ok(Some(command)),
                Some(other) => debug!("Scripted peer skipping {:?}", other.kind()),
                None => return Ok(None),
            }
        }
    }

    /// True once the controller has closed its end
    pub fn wait_closed(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.recv(remaining) {
                Ok(Some(_)) => continue,
                Ok(None) => return false,
                Err(_) => return true,
            }
        }
    }

    pub fn send(&self, message: &Message) -> RtcResult<()> {
        let frame = encode(message)?;
        self.send_raw(&frame)
    }

    pub fn ack(&self, ack: Ack) -> RtcResult<()> {
        self.send(&Message::Ack(ack))
    }

    pub fn telemetry(&self, frame: TelemetryFrame) -> RtcResult<()> {
        self.send(&Message::Telemetry(frame))
    }

    pub fn heartbeat(&self) -> RtcResult<()> {
        self.send(&Message::Heartbeat(Heartbeat::new()))
    }

    /// Write bytes as they are, frame or not
    pub fn send_raw(&self, bytes: &[u8]) -> RtcResult<()> {
        let mut stream = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        stream.write_all(bytes)?;
        stream.flush()?;
        Ok(())
    }

    /// Keep the link alive with a heartbeat every `interval`, starting now
    pub fn start_heartbeats(&mut self, interval: Duration) {
        self.stop_heartbeats();

        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let writer = Arc::clone(&self.writer);
        let thread = thread::spawn(move || {
            while flag.load(Ordering::SeqCst) {
                let frame = match encode(&Message::Heartbeat(Heartbeat::new())) {
                    Ok(frame) => frame,
                    Err(_) => break,
                };
                let written = writer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .write_all(&frame);
                if written.is_err() {
                    break;
                }
                thread::sleep(interval);
            }
        });

        self.heartbeats = Some(HeartbeatPump { running, thread });
    }

    fn stop_heartbeats(&mut self) {
        if let Some(pump) = self.heartbeats.take() {
            pump.running.store(false, Ordering::SeqCst);
            let _ = pump.thread.join();
        }
    }

    /// Close the connection from the mount's side
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop_heartbeats();
        let _ = self.reader.shutdown(Shutdown::Both);
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}
