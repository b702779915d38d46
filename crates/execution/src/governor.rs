//! Resource governor: per-class slot pools.
//!
//! All bookkeeping sits behind one lock. A released slot is handed directly
//! to the next waiter while the lock is held, so a freed slot is never lost
//! and never granted twice.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// Slot limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Capacity per analyzer class
    pub class_limits: HashMap<String, usize>,
    /// Capacity of classes without an explicit limit
    pub default_capacity: usize,
    /// How many lower-priority waiters a request may pass, and how many
    /// times one waiter may be passed
    pub max_priority_jump: usize,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            class_limits: HashMap::new(),
            default_capacity: 4,
            max_priority_jump: 2,
        }
    }
}

impl GovernorConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the capacity of one class.
    pub fn with_class_limit(mut self, class: impl Into<String>, capacity: usize) -> Self {
        self.class_limits.insert(class.into(), capacity);
        self
    }

    /// Set the capacity of unlisted classes.
    pub fn with_default_capacity(mut self, capacity: usize) -> Self {
        self.default_capacity = capacity;
        self
    }

    /// Set the priority jump bound.
    pub fn with_max_priority_jump(mut self, jump: usize) -> Self {
        self.max_priority_jump = jump;
        self
    }

    fn capacity_for(&self, class: &str) -> usize {
        let capacity = self
            .class_limits
            .get(class)
            .copied()
            .unwrap_or(self.default_capacity);
        if capacity == 0 {
            warn!(class, "class capacity of 0 raised to 1");
        }
        capacity.max(1)
    }
}

/// Governor errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GovernorError {
    /// The slot was already released
    #[error("slot {ticket} of class '{class}' released twice")]
    DoubleRelease {
        /// Class of the slot
        class: String,
        /// Slot number
        ticket: u64,
    },

    /// The waiter was dropped from the queue without a grant
    #[error("slot request for class '{0}' was abandoned")]
    Abandoned(String),
}

/// Proof of holding one slot of a class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotTicket {
    id: u64,
    class: Arc<str>,
}

impl SlotTicket {
    /// Slot number, unique per governor.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Class the slot belongs to.
    pub fn class(&self) -> &str {
        &self.class
    }
}

impl fmt::Display for SlotTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.class, self.id)
    }
}

struct Waiter {
    id: u64,
    priority: u8,
    overtaken: usize,
    grant: oneshot::Sender<SlotTicket>,
}

struct ClassPool {
    name: Arc<str>,
    capacity: usize,
    held: HashSet<u64>,
    waiters: VecDeque<Waiter>,
}

impl ClassPool {
    fn new(name: &str, capacity: usize) -> Self {
        Self {
            name: Arc::from(name),
            capacity,
            held: HashSet::new(),
            waiters: VecDeque::new(),
        }
    }

    fn has_room(&self) -> bool {
        self.held.len() < self.capacity
    }

    /// Queue a waiter. It moves ahead of lower-priority waiters at the back
    /// of the queue, passing at most `max_jump` of them and none that was
    /// already passed `max_jump` times.
    fn enqueue(&mut self, waiter: Waiter, max_jump: usize) {
        let mut pos = self.waiters.len();
        while pos > 0 && self.waiters.len() - pos < max_jump {
            let ahead = &self.waiters[pos - 1];
            if ahead.priority >= waiter.priority || ahead.overtaken >= max_jump {
                break;
            }
            pos -= 1;
        }
        for passed in self.waiters.range_mut(pos..) {
            passed.overtaken += 1;
        }
        self.waiters.insert(pos, waiter);
    }

    fn remove_waiter(&mut self, id: u64) {
        self.waiters.retain(|w| w.id != id);
    }
}

struct State {
    classes: HashMap<String, ClassPool>,
    next_ticket: u64,
}

impl State {
    fn issue(&mut self, class: &str) -> Option<SlotTicket> {
        self.next_ticket += 1;
        let id = self.next_ticket;
        let pool = self.classes.get_mut(class)?;
        pool.held.insert(id);
        Some(SlotTicket {
            id,
            class: pool.name.clone(),
        })
    }

    /// Hand free capacity to queued waiters, skipping any whose request was
    /// dropped in the meantime.
    fn grant_waiting(&mut self, class: &str) {
        loop {
            let Some(pool) = self.classes.get_mut(class) else {
                return;
            };
            if !pool.has_room() {
                return;
            }
            let Some(waiter) = pool.waiters.pop_front() else {
                return;
            };
            let Some(ticket) = self.issue(class) else {
                return;
            };
            let id = ticket.id;
            match waiter.grant.send(ticket) {
                Ok(()) => debug!(class, ticket = id, "slot handed to waiter"),
                Err(_) => {
                    if let Some(pool) = self.classes.get_mut(class) {
                        pool.held.remove(&id);
                    }
                }
            }
        }
    }
}

/// Per-class slot pools shared by all envelopes.
///
/// Cheap to clone; clones share the pools.
#[derive(Clone)]
pub struct ResourceGovernor {
    config: Arc<GovernorConfig>,
    state: Arc<Mutex<State>>,
}

impl ResourceGovernor {
    /// Create a governor.
    pub fn new(config: GovernorConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(State {
                classes: HashMap::new(),
                next_ticket: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // Nothing panics while the lock is held; recover the data regardless.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pool<'a>(&self, state: &'a mut State, class: &str) -> &'a mut ClassPool {
        state
            .classes
            .entry(class.to_string())
            .or_insert_with(|| ClassPool::new(class, self.config.capacity_for(class)))
    }

    /// Wait for a slot of `class`.
    ///
    /// Cancellation safe: dropping the returned future before it completes
    /// leaves the pool as if the request had never been made.
    pub async fn acquire(&self, class: &str, priority: u8) -> Result<SlotGuard, GovernorError> {
        let (waiter_id, receiver) = {
            let mut state = self.lock();
            let max_jump = self.config.max_priority_jump;
            let pool = self.pool(&mut state, class);

            if pool.has_room() && pool.waiters.is_empty() {
                if let Some(ticket) = state.issue(class) {
                    debug!(class, ticket = ticket.id, "slot acquired");
                    return Ok(SlotGuard::new(self.clone(), ticket));
                }
            }

            let (grant, receiver) = oneshot::channel();
            state.next_ticket += 1;
            let waiter_id = state.next_ticket;
            let pool = self.pool(&mut state, class);
            pool.enqueue(
                Waiter {
                    id: waiter_id,
                    priority,
                    overtaken: 0,
                    grant,
                },
                max_jump,
            );
            debug!(class, priority, waiting = pool.waiters.len(), "waiting for slot");
            (waiter_id, receiver)
        };

        let mut pending = PendingAcquire {
            governor: self,
            class,
            waiter_id,
            receiver: Some(receiver),
        };
        let outcome = match pending.receiver.as_mut() {
            Some(receiver) => receiver.await,
            None => return Err(GovernorError::Abandoned(class.to_string())),
        };
        pending.receiver = None;

        match outcome {
            Ok(ticket) => Ok(SlotGuard::new(self.clone(), ticket)),
            Err(_) => Err(GovernorError::Abandoned(class.to_string())),
        }
    }

    /// Return a slot to its pool.
    ///
    /// Releasing the same ticket twice is an error and is logged.
    pub fn release(&self, ticket: &SlotTicket) -> Result<(), GovernorError> {
        let mut state = self.lock();
        let released = state
            .classes
            .get_mut(ticket.class())
            .map(|pool| pool.held.remove(&ticket.id))
            .unwrap_or(false);

        if !released {
            error!(class = ticket.class(), ticket = ticket.id, "slot released twice");
            return Err(GovernorError::DoubleRelease {
                class: ticket.class().to_string(),
                ticket: ticket.id,
            });
        }

        debug!(class = ticket.class(), ticket = ticket.id, "slot released");
        state.grant_waiting(ticket.class());
        Ok(())
    }

    /// Slots of `class` currently held.
    pub fn in_use(&self, class: &str) -> usize {
        self.lock().classes.get(class).map(|p| p.held.len()).unwrap_or(0)
    }

    /// Requests of `class` currently queued.
    pub fn waiting(&self, class: &str) -> usize {
        self.lock().classes.get(class).map(|p| p.waiters.len()).unwrap_or(0)
    }

    /// Capacity of `class`.
    pub fn capacity(&self, class: &str) -> usize {
        self.lock()
            .classes
            .get(class)
            .map(|p| p.capacity)
            .unwrap_or_else(|| self.config.capacity_for(class))
    }
}

impl Default for ResourceGovernor {
    fn default() -> Self {
        Self::new(GovernorConfig::default())
    }
}

/// Removes an abandoned request from its queue. A grant that raced with the
/// drop is returned to the pool.
struct PendingAcquire<'a> {
    governor: &'a ResourceGovernor,
    class: &'a str,
    waiter_id: u64,
    receiver: Option<oneshot::Receiver<SlotTicket>>,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        let Some(mut receiver) = self.receiver.take() else {
            return;
        };
        receiver.close();
        {
            let mut state = self.governor.lock();
            if let Some(pool) = state.classes.get_mut(self.class) {
                pool.remove_waiter(self.waiter_id);
            }
        }
        if let Ok(ticket) = receiver.try_recv() {
            debug!(class = self.class, ticket = ticket.id, "returning slot of abandoned request");
            let _ = self.governor.release(&ticket);
        }
    }
}

/// Held slot; released when dropped.
pub struct SlotGuard {
    governor: ResourceGovernor,
    ticket: Option<SlotTicket>,
}

impl SlotGuard {
    fn new(governor: ResourceGovernor, ticket: SlotTicket) -> Self {
        Self {
            governor,
            ticket: Some(ticket),
        }
    }

    /// The held slot.
    pub fn ticket(&self) -> Option<&SlotTicket> {
        self.ticket.as_ref()
    }

    /// Release now, reporting errors instead of logging them.
    pub fn release(mut self) -> Result<(), GovernorError> {
        match self.ticket.take() {
            Some(ticket) => self.governor.release(&ticket),
            None => Ok(()),
        }
    }

    /// Stop managing the slot. The caller must pass the ticket to
    /// [`ResourceGovernor::release`].
    pub fn into_ticket(mut self) -> Option<SlotTicket> {
        self.ticket.take()
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            // Errors are already logged by release.
            let _ = self.governor.release(&ticket);
        }
    }
}
