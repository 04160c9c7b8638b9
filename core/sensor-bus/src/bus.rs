//! Core message bus implementation
//!
//! All bus state (mailboxes, subscriber lists, pending futures, stats) sits
//! behind one mutex. Waiters block on a condvar tied to that same mutex and
//! re-check their mailbox after every wake-up.

use crate::config::BusConfig;
use crate::error::{BusError, BusResult};
use crate::future::{Future, PendingSlot, Shared};
use crate::message::{Broadcast, Envelope, Event, EventId, EventToken};
use crate::registry::{Registry, WorkerId};
use parking_lot::{Condvar, Mutex};
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Per message type counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Messages accepted for delivery (one per send, not per recipient)
    pub sent: u64,
    /// Mailbox insertions
    pub delivered: u64,
    /// Events dropped because no subscriber had a mailbox
    pub unroutable: u64,
    /// Events whose future was resolved through `complete`
    pub completed: u64,
    /// Events whose future was abandoned on unregister
    pub abandoned: u64,
}

struct PendingFuture {
    slot: Arc<dyn PendingSlot>,
    routed_to: WorkerId,
    type_name: &'static str,
}

#[derive(Default)]
struct BusState {
    registry: Registry,
    pending: HashMap<EventId, PendingFuture>,
    stats: HashMap<&'static str, DispatchStats>,
}

impl BusState {
    fn stat(&mut self, type_name: &'static str) -> &mut DispatchStats {
        self.stats.entry(type_name).or_default()
    }
}

/// In-process broker shared (via `Arc`) by every worker of one run.
///
/// # Example
/// ```
/// use sensor_bus::{Event, MessageBus, WorkerId};
///
/// #[derive(Debug)]
/// struct Detect(u32);
///
/// impl Event for Detect {
///     type Output = String;
/// }
///
/// let bus = MessageBus::new();
/// let lidar = WorkerId::new("lidar");
/// bus.register(&lidar);
/// bus.subscribe_event::<Detect>(&lidar);
///
/// let future = bus.send_event(Detect(1)).expect("lidar is subscribed");
///
/// let request = bus.await_message(&lidar).unwrap().into_event::<Detect>().unwrap();
/// bus.complete(request.token(), "ok".to_string());
///
/// assert_eq!(future.get().unwrap(), "ok");
/// ```
pub struct MessageBus {
    config: BusConfig,
    state: Mutex<BusState>,
    wake: Condvar,
}

impl MessageBus {
    /// Create a bus with default configuration
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    pub fn with_config(config: BusConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BusState::default()),
            wake: Condvar::new(),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Create a mailbox for `worker`. Calling it again is a no-op.
    pub fn register(&self, worker: &WorkerId) {
        let created = self.state.lock().registry.register(worker);
        if created {
            info!(bus = %self.config.name, worker = %worker, "Worker registered");
        }
    }

    /// Remove `worker`'s mailbox and subscriptions.
    ///
    /// Futures of events routed to this worker and not yet completed are
    /// abandoned: their waiters wake with [`BusError::Abandoned`]. Futures of
    /// events the worker sent to others are left alone. Threads blocked in
    /// `await_message` for this worker wake with [`BusError::NotRegistered`].
    pub fn unregister(&self, worker: &WorkerId) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let removed = state.registry.unregister(worker);

        let mut abandoned = Vec::new();
        state.pending.retain(|id, pending| {
            if pending.routed_to != *worker {
                return true;
            }
            if pending.slot.abandon() {
                abandoned.push((*id, pending.type_name));
            }
            false
        });
        for (_, type_name) in &abandoned {
            state.stat(*type_name).abandoned += 1;
        }
        drop(guard);
        self.wake.notify_all();

        if let Some(mailbox) = removed {
            info!(
                bus = %self.config.name,
                worker = %worker,
                undelivered = mailbox.len(),
                abandoned = abandoned.len(),
                "Worker unregistered"
            );
        }
        for (id, type_name) in abandoned {
            debug!(bus = %self.config.name, event = %id, event_type = type_name, "Future abandoned");
        }
    }

    pub fn is_registered(&self, worker: &WorkerId) -> bool {
        self.state.lock().registry.is_registered(worker)
    }

    /// Add `worker` to the round-robin pool for event type `E`
    pub fn subscribe_event<E: Event>(&self, worker: &WorkerId) {
        self.subscribe(TypeId::of::<E>(), type_name::<E>(), worker);
    }

    /// Add `worker` to the fan-out list for broadcast type `B`
    pub fn subscribe_broadcast<B: Broadcast>(&self, worker: &WorkerId) {
        self.subscribe(TypeId::of::<B>(), type_name::<B>(), worker);
    }

    fn subscribe(&self, type_id: TypeId, type_name: &'static str, worker: &WorkerId) {
        let added = self.state.lock().registry.subscribe(type_id, type_name, worker);
        if added {
            debug!(bus = %self.config.name, worker = %worker, message_type = type_name, "Subscribed");
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Route `event` to exactly one subscriber, rotating the subscriber list.
    ///
    /// Returns `None` if nobody can take the event; in that case no mailbox
    /// is touched and no future is created.
    pub fn send_event<E: Event>(&self, event: E) -> Option<Future<E::Output>> {
        let event_type = type_name::<E>();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(worker) = state.registry.next_in_rotation(TypeId::of::<E>()) else {
            state.stat(event_type).unroutable += 1;
            debug!(bus = %self.config.name, event_type, "Event has no subscriber");
            return None;
        };
        let mailbox = state.registry.mailbox_mut(&worker)?;

        let id = EventId::next();
        let future = Future::with_id(id);
        let depth = mailbox.push(Envelope::event(id, event));
        state.pending.insert(
            id,
            PendingFuture {
                slot: future.slot(),
                routed_to: worker.clone(),
                type_name: event_type,
            },
        );

        let stat = state.stat(event_type);
        stat.sent += 1;
        stat.delivered += 1;
        drop(guard);
        self.wake.notify_all();

        debug!(bus = %self.config.name, event = %id, event_type, worker = %worker, "Event routed");
        self.check_backlog(&worker, depth);
        Some(future)
    }

    /// Deliver `broadcast` to every current subscriber.
    ///
    /// Recipients are the subscribers at the moment of the call. Returns the
    /// number of mailboxes reached; zero subscribers is not an error.
    pub fn send_broadcast<B: Broadcast>(&self, broadcast: B) -> usize {
        let broadcast_type = type_name::<B>();
        let shared = Arc::new(broadcast);

        let mut guard = self.state.lock();
        let state = &mut *guard;

        let recipients = state.registry.subscribers(TypeId::of::<B>()).to_vec();
        let mut backlogs = Vec::with_capacity(recipients.len());
        for worker in &recipients {
            if let Some(mailbox) = state.registry.mailbox_mut(worker) {
                let depth = mailbox.push(Envelope::broadcast(shared.clone()));
                backlogs.push((worker, depth));
            }
        }

        let delivered = backlogs.len();
        let stat = state.stat(broadcast_type);
        stat.sent += 1;
        stat.delivered += delivered as u64;
        drop(guard);

        if delivered > 0 {
            self.wake.notify_all();
        }

        debug!(bus = %self.config.name, broadcast_type, receivers = delivered, "Broadcast sent");
        for (worker, depth) in backlogs {
            self.check_backlog(worker, depth);
        }
        delivered
    }

    /// Resolve the future of the event behind `token` with `result`.
    ///
    /// Only the first completion counts. Returns `false` if the event is
    /// unknown, already completed, or was abandoned.
    pub fn complete<E: Event>(&self, token: EventToken<E>, result: E::Output) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(pending) = state.pending.remove(&token.id()) else {
            return false;
        };
        let resolved = match pending.slot.as_any().downcast_ref::<Shared<E::Output>>() {
            Some(shared) => shared.resolve(result),
            None => {
                warn!(
                    bus = %self.config.name,
                    event = %token.id(),
                    expected = pending.type_name,
                    "Completion result type does not match the pending event"
                );
                state.pending.insert(token.id(), pending);
                return false;
            }
        };
        if resolved {
            state.stat(pending.type_name).completed += 1;
        }
        resolved
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    /// Block until `worker`'s mailbox has a message and return the oldest one.
    ///
    /// # Errors
    /// - [`BusError::NotRegistered`] if the worker has no mailbox, including
    ///   when it is unregistered while waiting
    /// - [`BusError::Interrupted`] if [`interrupt`](Self::interrupt) was called
    ///   while the mailbox was empty; the mailbox is left untouched
    pub fn await_message(&self, worker: &WorkerId) -> BusResult<Envelope> {
        let mut state = self.state.lock();
        loop {
            let mailbox = state
                .registry
                .mailbox_mut(worker)
                .ok_or_else(|| BusError::NotRegistered(worker.clone()))?;
            if let Some(envelope) = mailbox.pop() {
                return Ok(envelope);
            }
            if mailbox.take_interrupt() {
                return Err(BusError::Interrupted(worker.clone()));
            }
            self.wake.wait(&mut state);
        }
    }

    /// Like [`await_message`](Self::await_message) but gives up after
    /// `timeout`, returning `Ok(None)`.
    pub fn await_message_timeout(
        &self,
        worker: &WorkerId,
        timeout: Duration,
    ) -> BusResult<Option<Envelope>> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.await_message(worker).map(Some);
        };
        let mut state = self.state.lock();
        let mut timed_out = false;
        loop {
            let mailbox = state
                .registry
                .mailbox_mut(worker)
                .ok_or_else(|| BusError::NotRegistered(worker.clone()))?;
            if let Some(envelope) = mailbox.pop() {
                return Ok(Some(envelope));
            }
            if mailbox.take_interrupt() {
                return Err(BusError::Interrupted(worker.clone()));
            }
            if timed_out {
                return Ok(None);
            }
            timed_out = self.wake.wait_until(&mut state, deadline).timed_out();
        }
    }

    /// Take the oldest message without blocking
    pub fn try_message(&self, worker: &WorkerId) -> BusResult<Option<Envelope>> {
        self.state
            .lock()
            .registry
            .mailbox_mut(worker)
            .map(|mailbox| mailbox.pop())
            .ok_or_else(|| BusError::NotRegistered(worker.clone()))
    }

    /// Make `worker`'s current (or next) wait on an empty mailbox return
    /// [`BusError::Interrupted`]. Returns `false` if the worker is not
    /// registered.
    pub fn interrupt(&self, worker: &WorkerId) -> bool {
        let interrupted = match self.state.lock().registry.mailbox_mut(worker) {
            Some(mailbox) => {
                mailbox.interrupt();
                true
            }
            None => false,
        };
        if interrupted {
            self.wake.notify_all();
            debug!(bus = %self.config.name, worker = %worker, "Worker interrupted");
        }
        interrupted
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Number of queued messages, `None` if the worker is not registered
    pub fn mailbox_len(&self, worker: &WorkerId) -> Option<usize> {
        self.state.lock().registry.mailbox(worker).map(|m| m.len())
    }

    /// Current subscribers of message type `M`, in rotation order
    pub fn subscribers<M: 'static>(&self) -> Vec<WorkerId> {
        self.state
            .lock()
            .registry
            .subscribers(TypeId::of::<M>())
            .to_vec()
    }

    /// Number of events whose future is still waiting for `complete`
    pub fn pending_futures(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Counters per message type, sorted by type name
    pub fn stats(&self) -> Vec<(String, DispatchStats)> {
        let mut stats: Vec<_> = self
            .state
            .lock()
            .stats
            .iter()
            .map(|(name, stat)| (name.to_string(), stat.clone()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    /// Counters for one message type
    pub fn stats_for<M: 'static>(&self) -> DispatchStats {
        self.state
            .lock()
            .stats
            .get(type_name::<M>())
            .cloned()
            .unwrap_or_default()
    }

    fn check_backlog(&self, worker: &WorkerId, depth: usize) {
        if self.config.backlog_warning_due(depth) {
            warn!(bus = %self.config.name, worker = %worker, depth, "Mailbox backlog growing");
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
