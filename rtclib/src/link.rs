//! Link session to the mount controller
//!
//! A session owns at most one connection at a time. A dedicated thread
//! connects (with backoff), reads and decodes frames, hands them to the
//! registered observers, watches inbound liveness and sends our own
//! heartbeats when the outbound side has been quiet.
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Degraded
//!       ^              |            |             |
//!       +--------------+------------+-------------+
//! ```

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use rtcproto::{Endpoint, Heartbeat, Message, RtcError, RtcResult};

use crate::config::ControllerConfig;
use crate::connection::{FrameReader, FrameWriter, ReadStatus, TcpConnection};
use crate::lock;

/// Lifecycle state of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Connected, but at least one heartbeat window passed without inbound traffic
    Degraded,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

/// Receiver of inbound traffic and state transitions
///
/// Called on the session thread, in arrival order. Implementations must not
/// block for long; anything slow belongs on a queue.
pub trait LinkObserver: Send + Sync {
    /// An ack or telemetry frame arrived
    fn on_message(&self, _message: &Message) {}

    /// The link changed state
    fn on_state_change(&self, _old: LinkState, _new: LinkState) {}
}

/// Snapshot of the link for health displays
#[derive(Debug, Clone, PartialEq)]
pub struct LinkHealth {
    pub state: LinkState,
    pub endpoint: Option<Endpoint>,
    /// Consecutive failed connect attempts
    pub reconnect_attempts: u32,
    /// Time since the last inbound frame on the current connection
    pub since_last_inbound: Option<Duration>,
    /// Connections established since the session started
    pub connections: u64,
}

#[derive(Debug)]
enum DropReason {
    PeerClosed,
    HeartbeatLost(u32),
    Malformed(String),
    Io(String),
    Panicked,
    Shutdown,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::PeerClosed => f.write_str("connection closed"),
            DropReason::HeartbeatLost(missed) => write!(f, "{} heartbeat windows missed", missed),
            DropReason::Malformed(why) => write!(f, "malformed frame ({})", why),
            DropReason::Io(why) => write!(f, "I/O error ({})", why),
            DropReason::Panicked => f.write_str("session thread panicked"),
            DropReason::Shutdown => f.write_str("shutdown"),
        }
    }
}

struct LinkInner {
    state: LinkState,
    endpoint: Option<Endpoint>,
    last_inbound: Option<Instant>,
    last_outbound: Option<Instant>,
    reconnect_attempts: u32,
    connections: u64,
    started: bool,
    closed: bool,
}

struct LinkShared {
    config: ControllerConfig,
    inner: Mutex<LinkInner>,
    changed: Condvar,
    /// Single-writer slot for the outbound half
    writer: Mutex<Option<FrameWriter>>,
    observers: RwLock<Vec<Arc<dyn LinkObserver>>>,
    listeners: Mutex<Vec<Sender<LinkState>>>,
    running: AtomicBool,
}

/// The link session
pub struct LinkSession {
    shared: Arc<LinkShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl LinkSession {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            shared: Arc::new(LinkShared {
                config,
                inner: Mutex::new(LinkInner {
                    state: LinkState::Disconnected,
                    endpoint: None,
                    last_inbound: None,
                    last_outbound: None,
                    reconnect_attempts: 0,
                    connections: 0,
                    started: false,
                    closed: false,
                }),
                changed: Condvar::new(),
                writer: Mutex::new(None),
                observers: RwLock::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Register a consumer of inbound frames and state changes
    pub fn add_observer(&self, observer: Arc<dyn LinkObserver>) {
        self.shared
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Channel receiving every subsequent state transition
    pub fn state_events(&self) -> Receiver<LinkState> {
        let (tx, rx) = mpsc::channel();
        lock(&self.shared.listeners).push(tx);
        rx
    }

    pub fn state(&self) -> LinkState {
        lock(&self.shared.inner).state
    }

    pub fn health(&self) -> LinkHealth {
        let inner = lock(&self.shared.inner);
        let connected = matches!(inner.state, LinkState::Connected | LinkState::Degraded);
        LinkHealth {
            state: inner.state,
            endpoint: inner.endpoint.clone(),
            reconnect_attempts: inner.reconnect_attempts,
            since_last_inbound: inner
                .last_inbound
                .filter(|_| connected)
                .map(|t| t.elapsed()),
            connections: inner.connections,
        }
    }

    /// Block until the link reaches `state` or the timeout expires
    pub fn wait_for_state(&self, state: LinkState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = lock(&self.shared.inner);
        loop {
            if inner.state == state {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            inner = self
                .shared
                .changed
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Connect now, failing if the mount cannot be reached
    ///
    /// On success the link is `Connected` and the session thread takes over,
    /// reconnecting on its own if the connection is later lost.
    pub fn connect(&self, endpoint: Endpoint) -> RtcResult<()> {
        self.begin(&endpoint)?;

        let reader = match self
            .shared
            .attempt(&endpoint)
            .and_then(|connection| self.shared.activate(connection))
        {
            Ok(reader) => reader,
            Err(e) => {
                self.abandon();
                return Err(e);
            }
        };

        self.spawn(endpoint, Some(reader))
    }

    /// Start connecting in the background
    ///
    /// Never fails for an unreachable mount; attempts continue with backoff
    /// until one succeeds or the session is shut down.
    pub fn start(&self, endpoint: Endpoint) -> RtcResult<()> {
        self.begin(&endpoint)?;
        self.spawn(endpoint, None)
    }

    fn begin(&self, endpoint: &Endpoint) -> RtcResult<()> {
        let mut inner = lock(&self.shared.inner);
        if inner.closed {
            return Err(RtcError::Stopped);
        }
        if inner.started {
            return Err(RtcError::AlreadyStarted);
        }
        inner.started = true;
        inner.endpoint = Some(endpoint.clone());
        self.shared.running.store(true, Ordering::SeqCst);
        info!("Link session starting for {}", endpoint);
        Ok(())
    }

    fn abandon(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        lock(&self.shared.inner).started = false;
    }

    fn spawn(&self, endpoint: Endpoint, reader: Option<FrameReader>) -> RtcResult<()> {
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("rtc-link".to_string())
            .spawn(move || shared.supervise(endpoint, reader));

        match spawned {
            Ok(handle) => {
                *lock(&self.thread) = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.drop_connection(&DropReason::Io(e.to_string()));
                self.abandon();
                Err(RtcError::Io(e))
            }
        }
    }

    /// Write a frame to the mount
    ///
    /// Only accepted while `Connected`. A failed write closes the connection
    /// and is reported as `LinkNotReady`.
    pub fn send(&self, message: &Message) -> RtcResult<()> {
        if self.state() != LinkState::Connected {
            return Err(RtcError::LinkNotReady);
        }
        self.shared.write(message)
    }

    /// Drop the current connection so the session reconnects
    pub fn resync(&self) {
        if let Some(writer) = lock(&self.shared.writer).as_ref() {
            info!("Resynchronizing link");
            writer.close();
        }
    }

    /// Stop the session thread and close the connection for good
    ///
    /// No I/O is attempted once this returns. Safe to call more than once
    /// and from any thread.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        {
            let mut inner = lock(&self.shared.inner);
            inner.closed = true;
            self.shared.changed.notify_all();
        }

        if let Some(writer) = lock(&self.shared.writer).take() {
            writer.close();
        }

        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("Link session thread panicked");
            }
        }

        self.shared.set_state(LinkState::Disconnected);
    }
}

impl Drop for LinkSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl LinkShared {
    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Body of the session thread
    fn supervise(&self, endpoint: Endpoint, mut reader: Option<FrameReader>) {
        while self.running() {
            let current = match reader.take() {
                Some(reader) => reader,
                None => match self.establish(&endpoint) {
                    Some(reader) => reader,
                    None => break,
                },
            };

            let reason = match panic::catch_unwind(AssertUnwindSafe(|| self.pump(current))) {
                Ok(reason) => reason,
                Err(_) => {
                    error!("Panic while serving the link to {}", endpoint);
                    DropReason::Panicked
                }
            };
            self.drop_connection(&reason);

            if self.running() {
                self.sleep(self.config.reconnect_delay_init());
            }
        }
        debug!("Link session thread for {} exiting", endpoint);
    }

    /// Connect with exponential backoff until success or shutdown
    fn establish(&self, endpoint: &Endpoint) -> Option<FrameReader> {
        while self.running() {
            match self.attempt(endpoint).and_then(|c| self.activate(c)) {
                Ok(reader) => return Some(reader),
                Err(RtcError::Stopped) => return None,
                Err(e) => {
                    let attempts = {
                        let mut inner = lock(&self.inner);
                        inner.reconnect_attempts += 1;
                        inner.reconnect_attempts
                    };
                    let delay = self.config.reconnect_delay(attempts - 1);
                    warn!(
                        "Connect attempt {} to {} failed: {}; retrying in {:?}",
                        attempts, endpoint, e, delay
                    );
                    self.sleep(delay);
                }
            }
        }
        None
    }

    fn attempt(&self, endpoint: &Endpoint) -> RtcResult<TcpConnection> {
        self.set_state(LinkState::Connecting);
        match TcpConnection::open(endpoint, self.config.connect_timeout()) {
            Ok(connection) => Ok(connection),
            Err(e) => {
                self.set_state(LinkState::Disconnected);
                Err(e)
            }
        }
    }

    /// Install the writer half and declare the link connected
    fn activate(&self, connection: TcpConnection) -> RtcResult<FrameReader> {
        let peer = connection.peer();
        let (reader, writer) = match connection.split(self.config.tick()) {
            Ok(halves) => halves,
            Err(e) => {
                self.set_state(LinkState::Disconnected);
                return Err(e);
            }
        };

        {
            let mut slot = lock(&self.writer);
            if !self.running() {
                writer.close();
                return Err(RtcError::Stopped);
            }
            *slot = Some(writer);
        }

        {
            let mut inner = lock(&self.inner);
            inner.last_inbound = Some(Instant::now());
            inner.last_outbound = None;
            inner.reconnect_attempts = 0;
            inner.connections += 1;
        }

        info!("Link established with {}", peer);
        self.set_state(LinkState::Connected);
        Ok(reader)
    }

    /// Read, deliver and watch liveness until the connection has to go
    fn pump(&self, mut reader: FrameReader) -> DropReason {
        let mut messages = Vec::new();

        loop {
            if !self.running() {
                return DropReason::Shutdown;
            }

            let status = reader.read_messages(&mut messages);
            if !messages.is_empty() {
                self.mark_inbound();
                for message in messages.drain(..) {
                    self.deliver(message);
                }
            }

            match status {
                Ok(ReadStatus::Closed) => return DropReason::PeerClosed,
                Ok(ReadStatus::Data) | Ok(ReadStatus::Idle) => {}
                Err(RtcError::MalformedFrame(why)) => return DropReason::Malformed(why),
                Err(e) => return DropReason::Io(e.to_string()),
            }

            if let Some(reason) = self.check_liveness() {
                return reason;
            }
            self.heartbeat_if_idle();
        }
    }

    fn mark_inbound(&self) {
        let degraded = {
            let mut inner = lock(&self.inner);
            inner.last_inbound = Some(Instant::now());
            inner.state == LinkState::Degraded
        };

        if degraded && self.transition(LinkState::Degraded, LinkState::Connected) {
            info!("Link recovered");
        }
    }

    fn deliver(&self, message: Message) {
        match &message {
            Message::Heartbeat(heartbeat) => {
                debug!("Heartbeat from mount stamped {}ms", heartbeat.sent_at.as_millis());
            }
            Message::Command(cmd) => {
                warn!("Ignoring {} command {} sent by the mount", cmd.kind(), cmd.correlation);
            }
            Message::Ack(_) | Message::Telemetry(_) => {
                let observers = self.observers.read().unwrap_or_else(PoisonError::into_inner);
                for observer in observers.iter() {
                    observer.on_message(&message);
                }
            }
        }
    }

    fn check_liveness(&self) -> Option<DropReason> {
        let interval_ms = self.config.heartbeat_interval_ms.max(1);
        let (missed, state) = {
            let inner = lock(&self.inner);
            let silent = inner.last_inbound.map(|t| t.elapsed()).unwrap_or_default();
            let missed = (silent.as_millis() / u128::from(interval_ms)).min(u128::from(u32::MAX)) as u32;
            (missed, inner.state)
        };

        if missed >= self.config.max_missed_heartbeats {
            return Some(DropReason::HeartbeatLost(missed));
        }
        if missed >= 1
            && state == LinkState::Connected
            && self.transition(LinkState::Connected, LinkState::Degraded)
        {
            warn!("No traffic from mount for {} heartbeat window(s)", missed);
        }
        None
    }

    fn heartbeat_if_idle(&self) {
        let due = {
            let inner = lock(&self.inner);
            inner
                .last_outbound
                .map_or(true, |t| t.elapsed() >= self.config.heartbeat_interval())
        };

        if due {
            if let Err(e) = self.write(&Message::Heartbeat(Heartbeat::new())) {
                debug!("Heartbeat not sent: {}", e);
            }
        }
    }

    /// Write under the single-writer lock, regardless of link state
    fn write(&self, message: &Message) -> RtcResult<()> {
        {
            let mut slot = lock(&self.writer);
            let writer = slot.as_mut().ok_or(RtcError::LinkNotReady)?;
            match writer.write_message(message) {
                Ok(()) => {}
                Err(RtcError::Io(e)) => {
                    warn!("Write to mount failed: {}", e);
                    writer.close();
                    *slot = None;
                    return Err(RtcError::LinkNotReady);
                }
                Err(e) => return Err(e),
            }
        }

        lock(&self.inner).last_outbound = Some(Instant::now());
        Ok(())
    }

    fn drop_connection(&self, reason: &DropReason) {
        if let Some(writer) = lock(&self.writer).take() {
            writer.close();
        }

        if self.running() {
            warn!("Link to mount lost: {}", reason);
        } else {
            info!("Link closed: {}", reason);
        }
        self.set_state(LinkState::Disconnected);
    }

    /// Wait for `delay`, returning early on shutdown
    fn sleep(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        let mut inner = lock(&self.inner);
        while self.running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            inner = self
                .changed
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn set_state(&self, new: LinkState) {
        self.change_state(None, new);
    }

    fn transition(&self, from: LinkState, to: LinkState) -> bool {
        self.change_state(Some(from), to)
    }

    fn change_state(&self, expected: Option<LinkState>, new: LinkState) -> bool {
        let old = {
            let mut inner = lock(&self.inner);
            let old = inner.state;
            if old == new || expected.map_or(false, |e| e != old) {
                return false;
            }
            if inner.closed && new != LinkState::Disconnected {
                return false;
            }
            inner.state = new;
            if new == LinkState::Disconnected {
                inner.last_inbound = None;
            }
            self.changed.notify_all();
            old
        };

        debug!("Link state {} -> {}", old, new);
        {
            let observers = self.observers.read().unwrap_or_else(PoisonError::into_inner);
            for observer in observers.iter() {
                observer.on_state_change(old, new);
            }
        }
        lock(&self.listeners).retain(|tx| tx.send(new).is_ok());
        true
    }
}
