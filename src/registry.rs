//! Command admission, id allocation and terminal-state bookkeeping.
//!
//! The [`CommandRegistry`] is the single gatekeeper for outgoing commands:
//! it enforces the session state (started and connected), the concurrency
//! cap, correlation-id uniqueness, and keeps a bounded history of recently
//! finished commands so late events can be distinguished from unknown ones.

use crate::frame::NO_RESPONSE_COMMAND_ID;
use crate::tracker::CommandTracker;
use crate::Error;
use log::{debug, info};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Maximum number of concurrently active commands.
///
/// Sends beyond the cap are rejected, never queued.
pub const MAX_ACTIVE_COMMANDS: usize = 20;

/// Number of finished commands retained for late-event classification.
pub const COMPLETED_RING_CAPACITY: usize = 100;

const FIRST_COMMAND_ID: u16 = 0x0001;
const LAST_COMMAND_ID: u16 = 0xfffe;

/// Rotating allocator for correlation ids in `1..=0xfffe`.
///
/// Ids are handed out in a rotating fashion rather than lowest-free so a
/// just-released id is not immediately reused while late events for it
/// may still be in flight.
#[derive(Debug)]
pub struct CommandIdAllocator {
    next: u16,
}

impl CommandIdAllocator {
    /// Constructs an allocator starting at the first valid id.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: FIRST_COMMAND_ID,
        }
    }

    /// Returns the next id not currently in use.
    ///
    /// # Errors
    ///
    /// - [`Error::NoCommandIdsAvailable`] if every id in the range is in use.
    pub fn next(&mut self, in_use: impl Fn(u16) -> bool) -> Result<u16, Error> {
        for _ in FIRST_COMMAND_ID..=LAST_COMMAND_ID {
            let id = self.next;

            self.next = if id == LAST_COMMAND_ID {
                FIRST_COMMAND_ID
            } else {
                id + 1
            };

            if !in_use(id) {
                return Ok(id);
            }
        }

        Err(Error::NoCommandIdsAvailable)
    }
}

impl Default for CommandIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Classification of a correlation id carried by an inbound event.
pub enum Lookup {
    /// The id belongs to an active command.
    Active(Arc<CommandTracker>),
    /// The id belongs to a recently finished command.
    Finished(Arc<CommandTracker>),
    /// The id is not known at all.
    Unknown,
}

struct Inner {
    active: HashMap<u16, Arc<CommandTracker>>,
    finished: VecDeque<Arc<CommandTracker>>,
    allocator: CommandIdAllocator,
    started: bool,
    connected: bool,
}

/// Tracks every active and recently finished command of a session.
pub struct CommandRegistry {
    inner: Mutex<Inner>,
}

impl CommandRegistry {
    /// Constructs an empty registry in the stopped, disconnected state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                active: HashMap::new(),
                finished: VecDeque::with_capacity(COMPLETED_RING_CAPACITY),
                allocator: CommandIdAllocator::new(),
                started: false,
                connected: false,
            }),
        }
    }

    /// Whether the session is both started and connected.
    #[must_use]
    pub fn is_online(&self) -> bool {
        let inner = self.inner.lock().unwrap();

        inner.started && inner.connected
    }

    /// Marks the engine as started or stopped.
    pub fn set_started(&self, started: bool) {
        self.inner.lock().unwrap().started = started;
    }

    /// Marks the link as connected or dropped.
    ///
    /// Dropping the link aborts every active command: each one is moved
    /// to the finished ring and resolved with [`Error::CommandAborted`].
    pub fn set_connected(&self, connected: bool) {
        let orphans = {
            let mut inner = self.inner.lock().unwrap();

            inner.connected = connected;

            if connected {
                return;
            }

            let orphans: Vec<_> = inner.active.drain().map(|(_, tracker)| tracker).collect();

            for tracker in &orphans {
                push_finished(&mut inner.finished, Arc::clone(tracker));
            }

            orphans
        };

        if !orphans.is_empty() {
            info!("connection dropped, aborting {} active commands", orphans.len());
        }

        for tracker in orphans {
            tracker.abort(Error::CommandAborted);
        }
    }

    /// Admits a command, assigning a fresh correlation id when needed.
    ///
    /// Terminal trackers are flushed to the finished ring first, so slots
    /// freed by completed commands are available to the admission check.
    ///
    /// # Errors
    ///
    /// - [`Error::Offline`] if the session is not online or the active
    ///   command cap has been reached.
    /// - [`Error::InvalidCommand`] if the id is the fire-and-forget sentinel.
    /// - [`Error::CommandAlreadyRunning`] if the id is already active.
    /// - [`Error::NoCommandIdsAvailable`] if no free id exists.
    pub fn admit(
        &self,
        id: u16,
        make: impl FnOnce(u16) -> Arc<CommandTracker>,
    ) -> Result<Arc<CommandTracker>, Error> {
        let mut inner = self.inner.lock().unwrap();

        flush(&mut inner);

        if !(inner.started && inner.connected) {
            return Err(Error::Offline);
        }

        if id == NO_RESPONSE_COMMAND_ID {
            return Err(Error::InvalidCommand);
        }

        if id != 0 && inner.active.contains_key(&id) {
            return Err(Error::CommandAlreadyRunning(id));
        }

        if inner.active.len() >= MAX_ACTIVE_COMMANDS {
            debug!(
                "command rejected, {} commands already active",
                inner.active.len()
            );
            return Err(Error::Offline);
        }

        let id = if id == 0 {
            let Inner {
                active, allocator, ..
            } = &mut *inner;

            allocator.next(|id| active.contains_key(&id))?
        } else {
            id
        };

        let tracker = make(id);

        inner.active.insert(id, Arc::clone(&tracker));

        Ok(tracker)
    }

    /// Classifies the correlation id of an inbound event.
    #[must_use]
    pub fn lookup(&self, id: u16) -> Lookup {
        let inner = self.inner.lock().unwrap();

        if let Some(tracker) = inner.active.get(&id) {
            Lookup::Active(Arc::clone(tracker))
        } else if let Some(tracker) = inner.finished.iter().find(|t| t.id() == id) {
            Lookup::Finished(Arc::clone(tracker))
        } else {
            Lookup::Unknown
        }
    }

    /// Moves every terminal tracker from the active map to the finished ring.
    pub fn flush_finished(&self) {
        flush(&mut self.inner.lock().unwrap());
    }

    /// Aborts every active command with the given error.
    pub fn abort_all(&self, error: &Error) {
        let orphans = {
            let mut inner = self.inner.lock().unwrap();
            let orphans: Vec<_> = inner.active.drain().map(|(_, tracker)| tracker).collect();

            for tracker in &orphans {
                push_finished(&mut inner.finished, Arc::clone(tracker));
            }

            orphans
        };

        for tracker in orphans {
            tracker.abort(error.clone());
        }
    }

    /// Number of currently active commands.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().active.len()
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn flush(inner: &mut Inner) {
    let terminal: Vec<u16> = inner
        .active
        .iter()
        .filter(|(_, tracker)| tracker.is_terminal())
        .map(|(id, _)| *id)
        .collect();

    for id in terminal {
        if let Some(tracker) = inner.active.remove(&id) {
            push_finished(&mut inner.finished, tracker);
        }
    }
}

fn push_finished(finished: &mut VecDeque<Arc<CommandTracker>>, tracker: Arc<CommandTracker>) {
    if finished.len() == COMPLETED_RING_CAPACITY {
        finished.pop_front();
    }

    finished.push_back(tracker);
}
