//! Worker runtime
//!
//! A worker owns one [`Service`], registers it with the bus, lets it declare
//! its subscriptions, then drains its mailbox until a handler terminates it.
//!
//! ```text
//! Created ──register──▶ Registered ──initialize ok──▶ Running ──terminate──▶ Terminated
//!                            │                                                 ▲
//!                            └──────────────initialize failed──────────────────┘
//! ```

use crate::bus::MessageBus;
use crate::error::{BusError, BusResult};
use crate::future::Future;
use crate::message::{Broadcast, Envelope, Event, EventToken, Request};
use crate::registry::WorkerId;
use anyhow::anyhow;
use crossbeam::channel;
use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

/// Lifecycle of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Created = 0,
    Registered = 1,
    Running = 2,
    Terminated = 3,
}

impl WorkerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Registered,
            2 => Self::Running,
            _ => Self::Terminated,
        }
    }
}

#[derive(Debug, Clone)]
struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(WorkerState::Created as u8)))
    }

    fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Holds a worker's registration for the duration of its run loop.
///
/// Dropping it unregisters the worker, including when a handler or
/// `initialize` panics and the thread unwinds.
struct Registration {
    bus: Arc<MessageBus>,
    id: WorkerId,
    state: StateCell,
}

impl Registration {
    fn acquire(bus: &Arc<MessageBus>, id: &WorkerId, state: &StateCell) -> Self {
        bus.register(id);
        state.set(WorkerState::Registered);
        Self {
            bus: bus.clone(),
            id: id.clone(),
            state: state.clone(),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if thread::panicking() {
            error!(worker = %self.id, "Worker panicked, unregistering");
        }
        self.bus.unregister(&self.id);
        self.state.set(WorkerState::Terminated);
    }
}

/// Counters collected by one worker over its lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Messages whose handler returned `Ok`
    pub messages_handled: usize,
    /// Messages whose handler returned `Err`
    pub handler_faults: usize,
    /// Messages with no bound handler
    pub unhandled: usize,
}

/// Behaviour plugged into a worker.
///
/// `initialize` runs once on the worker's thread after registration and binds
/// one handler per subscribed message type. Handlers get the service itself,
/// so they can keep state across messages without extra locking.
pub trait Service: Send + Sized + 'static {
    /// Declare subscriptions and bind handlers
    fn initialize(&mut self, setup: &mut Setup<'_, Self>) -> anyhow::Result<()>;

    /// Called after a handler returned an error, right before the worker
    /// terminates. A typical use is broadcasting a crash notice.
    fn on_fault(&mut self, _ctx: &mut Context, _error: &anyhow::Error) {}
}

type Handler<S> = Box<dyn FnMut(&mut S, &mut Context, Envelope) -> anyhow::Result<()>>;

/// The worker's view of the bus while handling messages
pub struct Context {
    bus: Arc<MessageBus>,
    id: WorkerId,
    terminated: bool,
}

impl Context {
    fn new(bus: Arc<MessageBus>, id: WorkerId) -> Self {
        Self {
            bus,
            id,
            terminated: false,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn send_event<E: Event>(&self, event: E) -> Option<Future<E::Output>> {
        self.bus.send_event(event)
    }

    pub fn send_broadcast<B: Broadcast>(&self, broadcast: B) -> usize {
        self.bus.send_broadcast(broadcast)
    }

    pub fn complete<E: Event>(&self, token: EventToken<E>, result: E::Output) -> bool {
        self.bus.complete(token, result)
    }

    /// Stop the run loop once the current handler returns.
    /// Messages still queued are never handled.
    pub fn terminate(&mut self) {
        self.terminated = true;
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}

/// Subscription builder handed to [`Service::initialize`]
pub struct Setup<'a, S> {
    ctx: &'a mut Context,
    handlers: &'a mut HashMap<TypeId, Handler<S>>,
}

impl<'a, S: Service> Setup<'a, S> {
    /// Subscribe to event type `E` and bind `handler` to it.
    ///
    /// Binding the same type twice replaces the earlier handler.
    pub fn on_event<E, F>(&mut self, mut handler: F) -> &mut Self
    where
        E: Event,
        F: FnMut(&mut S, &mut Context, Request<E>) -> anyhow::Result<()> + 'static,
    {
        self.ctx.bus.subscribe_event::<E>(&self.ctx.id);
        self.handlers.insert(
            TypeId::of::<E>(),
            Box::new(move |service: &mut S, ctx: &mut Context, envelope: Envelope| {
                match envelope.into_event::<E>() {
                    Ok(request) => handler(service, ctx, request),
                    Err(envelope) => Err(anyhow!(
                        "expected event {}, got {:?}",
                        type_name::<E>(),
                        envelope
                    )),
                }
            }),
        );
        self
    }

    /// Subscribe to broadcast type `B` and bind `handler` to it
    pub fn on_broadcast<B, F>(&mut self, mut handler: F) -> &mut Self
    where
        B: Broadcast,
        F: FnMut(&mut S, &mut Context, &B) -> anyhow::Result<()> + 'static,
    {
        self.ctx.bus.subscribe_broadcast::<B>(&self.ctx.id);
        self.handlers.insert(
            TypeId::of::<B>(),
            Box::new(move |service: &mut S, ctx: &mut Context, envelope: Envelope| {
                match envelope.broadcast_ref::<B>() {
                    Some(broadcast) => handler(service, ctx, broadcast),
                    None => Err(anyhow!(
                        "expected broadcast {}, got {:?}",
                        type_name::<B>(),
                        envelope
                    )),
                }
            }),
        );
        self
    }

    /// Bus access during initialization, e.g. to send a first message
    pub fn context(&mut self) -> &mut Context {
        &mut *self.ctx
    }
}

/// A service bound to a bus, not yet running
pub struct Worker<S: Service> {
    id: WorkerId,
    bus: Arc<MessageBus>,
    service: S,
    state: StateCell,
}

impl<S: Service> Worker<S> {
    pub fn new(name: impl Into<String>, bus: Arc<MessageBus>, service: S) -> Self {
        Self {
            id: WorkerId::new(name),
            bus,
            service,
            state: StateCell::new(),
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    /// Run the worker on the current thread until it terminates.
    ///
    /// The worker is unregistered on every exit path.
    ///
    /// # Errors
    /// - [`BusError::InitFailed`] if `initialize` failed
    /// - [`BusError::Interrupted`] if the bus interrupted the worker while it
    ///   was waiting for a message
    pub fn run(self) -> BusResult<WorkerStats> {
        self.run_inner(None)
    }

    /// Run the worker on a new named thread.
    ///
    /// Returns once `initialize` has finished, so every subscription is in
    /// place before the caller starts producing messages.
    pub fn spawn(self) -> BusResult<WorkerHandle> {
        let id = self.id.clone();
        let bus = self.bus.clone();
        let state = self.state.clone();
        let (ready_tx, ready_rx) = channel::bounded(1);

        let handle = thread::Builder::new()
            .name(id.name().to_string())
            .spawn(move || self.run_inner(Some(ready_tx)))
            .map_err(|e| BusError::InitFailed(id.clone(), e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(WorkerHandle {
                id,
                bus,
                state,
                handle,
            }),
            Ok(Err(err)) => {
                let _ = handle.join();
                Err(err)
            }
            Err(_) => {
                let _ = handle.join();
                Err(BusError::InitFailed(
                    id,
                    "worker thread exited during initialization".to_string(),
                ))
            }
        }
    }

    fn run_inner(self, ready: Option<channel::Sender<BusResult<()>>>) -> BusResult<WorkerStats> {
        let Worker {
            id,
            bus,
            mut service,
            state,
        } = self;
        let span = tracing::info_span!("worker", worker = %id);
        let _entered = span.enter();

        let registration = Registration::acquire(&bus, &id, &state);

        let mut ctx = Context::new(bus.clone(), id.clone());
        let mut handlers: HashMap<TypeId, Handler<S>> = HashMap::new();
        let initialized = service.initialize(&mut Setup {
            ctx: &mut ctx,
            handlers: &mut handlers,
        });
        if let Err(e) = initialized {
            error!(error = %format!("{e:#}"), "Initialization failed");
            drop(registration);
            let err = BusError::InitFailed(id, format!("{e:#}"));
            if let Some(ready) = ready {
                let _ = ready.send(Err(err.clone()));
            }
            return Err(err);
        }

        state.set(WorkerState::Running);
        if let Some(ready) = ready {
            let _ = ready.send(Ok(()));
        }
        info!(handlers = handlers.len(), "Worker running");

        let mut stats = WorkerStats::default();
        let outcome = loop {
            if ctx.is_terminated() {
                break Ok(());
            }
            let envelope = match bus.await_message(&id) {
                Ok(envelope) => envelope,
                Err(BusError::NotRegistered(_)) => {
                    info!("Worker unregistered externally");
                    break Ok(());
                }
                Err(err) => break Err(err),
            };

            let Some(handler) = handlers.get_mut(&envelope.type_id()) else {
                stats.unhandled += 1;
                warn!(message_type = envelope.type_name(), "No handler bound for message");
                continue;
            };
            let message_type = envelope.type_name();
            match handler(&mut service, &mut ctx, envelope) {
                Ok(()) => stats.messages_handled += 1,
                Err(e) => {
                    stats.handler_faults += 1;
                    error!(message_type, error = %format!("{e:#}"), "Handler failed, terminating");
                    service.on_fault(&mut ctx, &e);
                    ctx.terminate();
                }
            }
        };

        drop(registration);
        match &outcome {
            Ok(()) => info!(
                handled = stats.messages_handled,
                faults = stats.handler_faults,
                "Worker terminated"
            ),
            Err(err) => warn!(error = %err, "Worker stopped"),
        }
        outcome.map(|()| stats)
    }
}

/// Handle to a worker running on its own thread
pub struct WorkerHandle {
    id: WorkerId,
    bus: Arc<MessageBus>,
    state: StateCell,
    handle: JoinHandle<BusResult<WorkerStats>>,
}

impl WorkerHandle {
    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Interrupt the worker's wait on an empty mailbox; [`join`](Self::join)
    /// then reports [`BusError::Interrupted`].
    pub fn interrupt(&self) -> bool {
        self.bus.interrupt(&self.id)
    }

    /// Wait for the worker thread to finish
    pub fn join(self) -> BusResult<WorkerStats> {
        self.handle
            .join()
            .unwrap_or_else(|_| Err(BusError::Panicked(self.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug)]
    struct Ping(u32);

    impl Event for Ping {
        type Output = String;
    }

    #[derive(Debug)]
    struct Stop;

    impl Broadcast for Stop {}

    #[derive(Debug)]
    struct Faulted(String);

    impl Broadcast for Faulted {}

    #[derive(Debug)]
    struct Unbound;

    impl Broadcast for Unbound {}

    /// Answers pings with its name, stops on `Stop`, fails on ping 0
    struct Echo {
        name: &'static str,
    }

    impl Service for Echo {
        fn initialize(&mut self, setup: &mut Setup<'_, Self>) -> anyhow::Result<()> {
            setup
                .on_event::<Ping, _>(|echo, ctx, ping| {
                    if ping.0 == 0 {
                        anyhow::bail!("ping zero is not allowed");
                    }
                    ctx.complete(ping.token(), format!("{}:{}", echo.name, ping.0));
                    Ok(())
                })
                .on_broadcast::<Stop, _>(|_, ctx, _| {
                    ctx.terminate();
                    Ok(())
                });
            Ok(())
        }

        fn on_fault(&mut self, ctx: &mut Context, error: &anyhow::Error) {
            ctx.send_broadcast(Faulted(format!("{}: {}", self.name, error)));
        }
    }

    /// Panics on every ping
    struct Panicky;

    impl Service for Panicky {
        fn initialize(&mut self, setup: &mut Setup<'_, Self>) -> anyhow::Result<()> {
            setup.on_event::<Ping, _>(|_, _, ping| panic!("lost track at ping {}", ping.0));
            Ok(())
        }
    }

    /// Subscribes, then panics before finishing initialization
    struct PanicsDuringInit;

    impl Service for PanicsDuringInit {
        fn initialize(&mut self, setup: &mut Setup<'_, Self>) -> anyhow::Result<()> {
            setup.on_event::<Ping, _>(|_, _, _| Ok(()));
            panic!("calibration data corrupt");
        }
    }

    struct Broken;

    impl Service for Broken {
        fn initialize(&mut self, _setup: &mut Setup<'_, Self>) -> anyhow::Result<()> {
            Err(anyhow!("sensor configuration missing"))
        }
    }

    fn echo(bus: &Arc<MessageBus>, name: &'static str) -> WorkerHandle {
        Worker::new(name, bus.clone(), Echo { name }).spawn().unwrap()
    }

    #[test]
    fn test_worker_lifecycle() {
        let bus = Arc::new(MessageBus::new());
        let worker = Worker::new("echo", bus.clone(), Echo { name: "echo" });
        assert_eq!(worker.state(), WorkerState::Created);

        let handle = worker.spawn().unwrap();
        assert_eq!(handle.state(), WorkerState::Running);
        assert_eq!(bus.subscribers::<Ping>(), vec![handle.id().clone()]);
        assert_eq!(bus.subscribers::<Stop>(), vec![handle.id().clone()]);

        let future = bus.send_event(Ping(3)).unwrap();
        assert_eq!(future.get().unwrap(), "echo:3");

        bus.send_broadcast(Stop);
        let id = handle.id().clone();
        let stats = handle.join().unwrap();

        assert_eq!(stats.messages_handled, 2);
        assert_eq!(stats.handler_faults, 0);
        assert!(!bus.is_registered(&id));
        assert!(bus.subscribers::<Ping>().is_empty());
    }

    #[test]
    fn test_workers_share_events_round_robin() {
        let bus = Arc::new(MessageBus::new());
        let a = echo(&bus, "a");
        let b = echo(&bus, "b");

        let answers: Vec<_> = (1..=4)
            .map(|i| bus.send_event(Ping(i)).unwrap())
            .map(|f| f.get().unwrap())
            .collect();

        assert_eq!(answers, vec!["a:1", "b:2", "a:3", "b:4"]);

        bus.send_broadcast(Stop);
        assert!(a.join().is_ok());
        assert!(b.join().is_ok());
    }

    #[test]
    fn test_handler_fault_terminates_worker() {
        let bus = Arc::new(MessageBus::new());
        let watcher = WorkerId::new("watcher");
        bus.register(&watcher);
        bus.subscribe_broadcast::<Faulted>(&watcher);

        let handle = echo(&bus, "fragile");
        let future = bus.send_event(Ping(0)).unwrap();
        let id = handle.id().clone();
        let stats = handle.join().unwrap();

        assert_eq!(stats.handler_faults, 1);
        assert!(!bus.is_registered(&id));
        // The handler never completed the event, so unregistering abandoned it
        assert!(future.is_abandoned());

        let notice = bus
            .await_message_timeout(&watcher, Duration::from_secs(1))
            .unwrap()
            .unwrap();
        let faulted = notice.broadcast_ref::<Faulted>().unwrap();
        assert!(faulted.0.contains("ping zero"));
    }

    #[test]
    fn test_handler_panic_unregisters_worker() {
        let bus = Arc::new(MessageBus::new());
        let handle = Worker::new("panicky", bus.clone(), Panicky).spawn().unwrap();
        let id = handle.id().clone();
        let state = handle.state.clone();

        let routed = bus.send_event(Ping(1)).unwrap();

        assert_eq!(handle.join(), Err(BusError::Panicked(id.clone())));
        assert_eq!(state.get(), WorkerState::Terminated);
        assert!(!bus.is_registered(&id));
        assert!(bus.subscribers::<Ping>().is_empty());
        assert!(routed.is_abandoned());
        assert!(bus.send_event(Ping(2)).is_none());
    }

    #[test]
    fn test_initialization_panic_unregisters_worker() {
        let bus = Arc::new(MessageBus::new());
        let worker = Worker::new("fragile", bus.clone(), PanicsDuringInit);
        let id = worker.id().clone();

        let err = worker.spawn().err().unwrap();

        assert!(matches!(err, BusError::InitFailed(ref w, _) if *w == id));
        assert!(!bus.is_registered(&id));
        assert!(bus.send_event(Ping(1)).is_none());
    }

    #[test]
    fn test_initialization_failure() {
        let bus = Arc::new(MessageBus::new());
        let worker = Worker::new("broken", bus.clone(), Broken);
        let id = worker.id().clone();

        let err = worker.spawn().err().unwrap();

        assert!(matches!(err, BusError::InitFailed(ref w, ref msg) if *w == id && msg.contains("configuration")));
        assert!(!bus.is_registered(&id));
    }

    #[test]
    fn test_interrupt_propagates_to_join() {
        let bus = Arc::new(MessageBus::new());
        let handle = echo(&bus, "idle");
        let id = handle.id().clone();

        thread::sleep(Duration::from_millis(20));
        assert!(handle.interrupt());

        assert_eq!(handle.join(), Err(BusError::Interrupted(id.clone())));
        assert!(!bus.is_registered(&id));
    }

    #[test]
    fn test_unbound_message_is_counted() {
        let bus = Arc::new(MessageBus::new());
        let handle = echo(&bus, "picky");
        bus.subscribe_broadcast::<Unbound>(handle.id());

        bus.send_broadcast(Unbound);
        bus.send_broadcast(Stop);
        let stats = handle.join().unwrap();

        assert_eq!(stats.unhandled, 1);
        assert_eq!(stats.messages_handled, 1);
    }

    #[test]
    fn test_run_on_current_thread() {
        let bus = Arc::new(MessageBus::new());
        let worker = Worker::new("inline", bus.clone(), Echo { name: "inline" });
        let id = worker.id().clone();

        let runner = thread::spawn(move || worker.run());
        while bus.subscribers::<Stop>().is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        bus.send_broadcast(Stop);

        assert_eq!(runner.join().unwrap().unwrap().messages_handled, 1);
        assert!(!bus.is_registered(&id));
    }
}
