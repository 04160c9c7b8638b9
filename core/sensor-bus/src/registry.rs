//! Worker identities, mailboxes and the subscription registry
//!
//! Nothing in here locks: the registry is plain data owned by the bus and is
//! only touched while the bus lock is held.

use crate::message::Envelope;
use std::any::TypeId;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use uuid::Uuid;

/// Handle identifying one worker on the bus.
///
/// Equality and hashing use the generated id only; the name is for logs.
#[derive(Clone)]
pub struct WorkerId {
    id: Uuid,
    name: Arc<str>,
}

impl WorkerId {
    /// Create a fresh identity. Two calls with the same name are distinct workers.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: Arc::from(name.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> &Uuid {
        &self.id
    }
}

impl PartialEq for WorkerId {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for WorkerId {}

impl Hash for WorkerId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, &self.id.simple().to_string()[..8])
    }
}

impl fmt::Debug for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkerId({})", self)
    }
}

/// Private FIFO inbox of one registered worker
#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    queue: VecDeque<Envelope>,

    /// Pending interrupt, consumed by the next (or current) wait
    interrupted: bool,
}

impl Mailbox {
    pub(crate) fn push(&mut self, envelope: Envelope) -> usize {
        self.queue.push_back(envelope);
        self.queue.len()
    }

    pub(crate) fn pop(&mut self) -> Option<Envelope> {
        self.queue.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn interrupt(&mut self) {
        self.interrupted = true;
    }

    /// Clears the flag and reports whether it was set
    pub(crate) fn take_interrupt(&mut self) -> bool {
        std::mem::take(&mut self.interrupted)
    }
}

/// Ordered subscriber list for one message type.
///
/// For event types the order is the round-robin rotation state.
#[derive(Debug)]
struct Subscription {
    type_name: &'static str,
    workers: Vec<WorkerId>,
}

/// Mailboxes plus the type → subscribers mapping
#[derive(Debug, Default)]
pub(crate) struct Registry {
    mailboxes: HashMap<WorkerId, Mailbox>,
    subscriptions: HashMap<TypeId, Subscription>,
}

impl Registry {
    /// Returns `true` if a new mailbox was created
    pub(crate) fn register(&mut self, worker: &WorkerId) -> bool {
        if self.mailboxes.contains_key(worker) {
            return false;
        }
        self.mailboxes.insert(worker.clone(), Mailbox::default());
        true
    }

    /// Drop the worker's mailbox and remove it from every subscriber list.
    ///
    /// Returns the mailbox that was removed, if the worker was registered.
    pub(crate) fn unregister(&mut self, worker: &WorkerId) -> Option<Mailbox> {
        for subscription in self.subscriptions.values_mut() {
            subscription.workers.retain(|w| w != worker);
        }
        self.subscriptions.retain(|_, s| !s.workers.is_empty());
        self.mailboxes.remove(worker)
    }

    pub(crate) fn is_registered(&self, worker: &WorkerId) -> bool {
        self.mailboxes.contains_key(worker)
    }

    /// Append `worker` to the list for `type_id` unless already present.
    /// Returns `true` if it was added.
    pub(crate) fn subscribe(
        &mut self,
        type_id: TypeId,
        type_name: &'static str,
        worker: &WorkerId,
    ) -> bool {
        let subscription = self.subscriptions.entry(type_id).or_insert_with(|| Subscription {
            type_name,
            workers: Vec::new(),
        });
        if subscription.workers.contains(worker) {
            return false;
        }
        subscription.workers.push(worker.clone());
        true
    }

    pub(crate) fn subscribers(&self, type_id: TypeId) -> &[WorkerId] {
        self.subscriptions
            .get(&type_id)
            .map(|s| s.workers.as_slice())
            .unwrap_or(&[])
    }

    /// Pick the next event recipient for `type_id` and rotate the list.
    ///
    /// The front worker moves to the back. Subscribers without a mailbox are
    /// rotated past; `None` if no subscriber currently has one.
    pub(crate) fn next_in_rotation(&mut self, type_id: TypeId) -> Option<WorkerId> {
        let subscription = self.subscriptions.get_mut(&type_id)?;
        for _ in 0..subscription.workers.len() {
            let worker = subscription.workers.remove(0);
            subscription.workers.push(worker.clone());
            if self.mailboxes.contains_key(&worker) {
                return Some(worker);
            }
            tracing::debug!(
                worker = %worker,
                event_type = subscription.type_name,
                "Skipping subscriber without mailbox"
            );
        }
        None
    }

    pub(crate) fn mailbox(&self, worker: &WorkerId) -> Option<&Mailbox> {
        self.mailboxes.get(worker)
    }

    pub(crate) fn mailbox_mut(&mut self, worker: &WorkerId) -> Option<&mut Mailbox> {
        self.mailboxes.get_mut(worker)
    }
}
