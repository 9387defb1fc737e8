//! Command dispatch and ack correlation
//!
//! Every issued command gets a fresh correlation id and an entry in the
//! pending table. The entry is resolved exactly once, by whichever of the
//! matching ack, the deadline sweep, link loss or close removes it from the
//! table first.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rtcproto::{
    Command, CommandKind, CommandParams, CorrelationId, FailureReason, Message, RtcError,
    RtcResult,
};

use crate::link::{LinkObserver, LinkSession, LinkState};
use crate::lock;

/// Where a command is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Pending,
    Acknowledged,
    Failed(FailureReason),
}

impl CommandStatus {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, CommandStatus::Pending)
    }

    fn into_result(self) -> Option<RtcResult<()>> {
        match self {
            CommandStatus::Pending => None,
            CommandStatus::Acknowledged => Some(Ok(())),
            CommandStatus::Failed(reason) => Some(Err(RtcError::Command(reason))),
        }
    }
}

struct Resolution {
    status: Mutex<CommandStatus>,
    done: Condvar,
}

impl Resolution {
    fn new() -> Self {
        Self {
            status: Mutex::new(CommandStatus::Pending),
            done: Condvar::new(),
        }
    }

    /// Record the outcome; later calls are ignored
    fn resolve(&self, outcome: CommandStatus) -> bool {
        let mut status = lock(&self.status);
        if status.is_resolved() {
            return false;
        }
        *status = outcome;
        self.done.notify_all();
        true
    }

    fn wait(&self, timeout: Option<Duration>) -> CommandStatus {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut status = lock(&self.status);
        while !status.is_resolved() {
            status = match deadline {
                None => self.done.wait(status).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    self.done
                        .wait_timeout(status, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        *status
    }
}

/// Caller's view of an issued command
///
/// Clones share the same resolution.
#[derive(Clone)]
pub struct CommandHandle {
    command: Arc<Command>,
    resolution: Arc<Resolution>,
}

impl CommandHandle {
    pub fn correlation(&self) -> CorrelationId {
        self.command.correlation
    }

    pub fn kind(&self) -> CommandKind {
        self.command.kind()
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn status(&self) -> CommandStatus {
        *lock(&self.resolution.status)
    }

    pub fn is_resolved(&self) -> bool {
        self.status().is_resolved()
    }

    /// Block until the command is resolved
    pub fn wait(&self) -> RtcResult<()> {
        self.resolution
            .wait(None)
            .into_result()
            .unwrap_or(Err(RtcError::Command(FailureReason::Shutdown)))
    }

    /// Block until the command is resolved or `timeout` passes
    ///
    /// Returns `None` if the command is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<RtcResult<()>> {
        self.resolution.wait(Some(timeout)).into_result()
    }
}

impl std::fmt::Debug for CommandHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandle")
            .field("correlation", &self.correlation())
            .field("kind", &self.kind())
            .field("status", &self.status())
            .finish()
    }
}

struct PendingEntry {
    kind: CommandKind,
    deadline: Instant,
    resolution: Arc<Resolution>,
}

struct PendingTable {
    entries: HashMap<CorrelationId, PendingEntry>,
    next_id: u32,
    closed: bool,
}

impl PendingTable {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
            closed: false,
        }
    }

    /// Next free correlation id, never 0 and never one still pending
    fn allocate(&mut self) -> CorrelationId {
        loop {
            let id = CorrelationId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1);
            if !id.is_none() && !self.entries.contains_key(&id) {
                return id;
            }
        }
    }

    fn conflicts(&self, kind: CommandKind) -> bool {
        kind.is_exclusive() && self.entries.values().any(|entry| entry.kind == kind)
    }

    fn take_expired(&mut self, now: Instant) -> Vec<(CorrelationId, PendingEntry)> {
        let expired: Vec<CorrelationId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.entries.remove(&id).map(|entry| (id, entry)))
            .collect()
    }
}

struct DispatchShared {
    pending: Mutex<PendingTable>,
    sweep: Condvar,
}

impl DispatchShared {
    fn resolve(&self, correlation: CorrelationId, outcome: CommandStatus) -> bool {
        let entry = lock(&self.pending).entries.remove(&correlation);
        match entry {
            Some(entry) => entry.resolution.resolve(outcome),
            None => false,
        }
    }

    fn fail_all(&self, reason: FailureReason) -> usize {
        let drained: Vec<PendingEntry> = lock(&self.pending)
            .entries
            .drain()
            .map(|(_, entry)| entry)
            .collect();

        for entry in &drained {
            entry.resolution.resolve(CommandStatus::Failed(reason));
        }
        drained.len()
    }

    /// Body of the deadline sweep thread
    fn run_sweeper(&self) {
        let mut table = lock(&self.pending);
        while !table.closed {
            let now = Instant::now();
            let expired = table.take_expired(now);
            if !expired.is_empty() {
                drop(table);
                for (correlation, entry) in expired {
                    warn!("{} command {} timed out", entry.kind, correlation);
                    entry.resolution.resolve(CommandStatus::Failed(FailureReason::Timeout));
                }
                table = lock(&self.pending);
                continue;
            }

            let earliest = table.entries.values().map(|entry| entry.deadline).min();
            table = match earliest {
                Some(deadline) => {
                    self.sweep
                        .wait_timeout(table, deadline.saturating_duration_since(now))
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self.sweep.wait(table).unwrap_or_else(PoisonError::into_inner),
            };
        }
        debug!("Command sweep thread exiting");
    }
}

impl LinkObserver for DispatchShared {
    fn on_message(&self, message: &Message) {
        if let Message::Ack(ack) = message {
            let outcome = if ack.code.is_accepted() {
                CommandStatus::Acknowledged
            } else {
                CommandStatus::Failed(FailureReason::Rejected(ack.code))
            };

            if self.resolve(ack.correlation, outcome) {
                debug!("Command {} resolved: {}", ack.correlation, ack.code);
            } else {
                debug!("Ignoring ack for unknown command {}", ack.correlation);
            }
        }
    }

    fn on_state_change(&self, _old: LinkState, new: LinkState) {
        if new == LinkState::Disconnected {
            let failed = self.fail_all(FailureReason::LinkLost);
            if failed > 0 {
                warn!("{} pending command(s) lost with the link", failed);
            }
        }
    }
}

/// Issues commands over a link session and tracks their acks
pub struct Dispatcher {
    link: Arc<LinkSession>,
    shared: Arc<DispatchShared>,
    command_timeout: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Attach to `link` and start the deadline sweep thread
    pub fn new(link: Arc<LinkSession>, command_timeout: Duration) -> RtcResult<Self> {
        let shared = Arc::new(DispatchShared {
            pending: Mutex::new(PendingTable::new()),
            sweep: Condvar::new(),
        });
        link.add_observer(shared.clone());

        let sweeper_shared = Arc::clone(&shared);
        let sweeper = thread::Builder::new()
            .name("rtc-sweeper".to_string())
            .spawn(move || sweeper_shared.run_sweeper())?;

        Ok(Self {
            link,
            shared,
            command_timeout,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Send a command and return a handle to its eventual resolution
    pub fn issue(&self, params: CommandParams) -> RtcResult<CommandHandle> {
        params.validate()?;
        if self.link.state() != LinkState::Connected {
            return Err(RtcError::LinkNotReady);
        }

        let kind = params.kind();
        let (command, resolution) = {
            let mut table = lock(&self.shared.pending);
            if table.closed {
                return Err(RtcError::Stopped);
            }
            if table.conflicts(kind) {
                return Err(RtcError::CommandConflict(kind));
            }

            let correlation = table.allocate();
            let resolution = Arc::new(Resolution::new());
            table.entries.insert(
                correlation,
                PendingEntry {
                    kind,
                    deadline: Instant::now() + self.command_timeout,
                    resolution: Arc::clone(&resolution),
                },
            );
            (Arc::new(Command::new(correlation, params)), resolution)
        };
        self.shared.sweep.notify_all();

        if let Err(e) = self.link.send(&Message::Command((*command).clone())) {
            lock(&self.shared.pending).entries.remove(&command.correlation);
            return Err(e);
        }

        debug!("Issued {} command {}", kind, command.correlation);
        Ok(CommandHandle {
            command,
            resolution,
        })
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.shared.pending).entries.len()
    }

    /// Fail everything pending with `Shutdown` and stop the sweep thread
    pub fn close(&self) {
        let already_closed = {
            let mut table = lock(&self.shared.pending);
            std::mem::replace(&mut table.closed, true)
        };
        self.shared.sweep.notify_all();

        if !already_closed {
            let failed = self.shared.fail_all(FailureReason::Shutdown);
            if failed > 0 {
                info!("Cancelled {} pending command(s)", failed);
            }
        }

        let handle = lock(&self.sweeper).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Command sweep thread panicked");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close();
    }
}
