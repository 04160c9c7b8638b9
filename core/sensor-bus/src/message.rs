//! Message taxonomy for the bus
//!
//! The bus only cares about two things: the runtime type of a message (its
//! dispatch key) and whether it is an [`Event`] (one consumer, one result) or a
//! [`Broadcast`] (every subscriber, no result). Payloads are opaque.

use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;
use uuid::Uuid;

/// A message with exactly one consumer and one asynchronous result.
pub trait Event: Send + fmt::Debug + 'static {
    /// Type of the value the sender's future resolves to
    type Output: Clone + Send + 'static;
}

/// A message delivered to every current subscriber, with no result.
pub trait Broadcast: Send + Sync + fmt::Debug + 'static {}

/// Event vs. broadcast, decided by which trait the sender used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Event,
    Broadcast,
}

/// Identity of one sent event instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    pub(crate) fn next() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        // Counter-backed ids keep the hot send path free of RNG calls
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(Uuid::from_u128(seq as u128))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evt-{}", self.0.as_u128())
    }
}

/// Typed handle used to complete one specific event.
pub struct EventToken<E> {
    id: EventId,
    _event: PhantomData<fn() -> E>,
}

impl<E> EventToken<E> {
    pub(crate) fn new(id: EventId) -> Self {
        Self {
            id,
            _event: PhantomData,
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }
}

impl<E> Clone for EventToken<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for EventToken<E> {}

impl<E> fmt::Debug for EventToken<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventToken").field(&self.id).finish()
    }
}

/// An event as seen by the worker it was routed to
#[derive(Debug)]
pub struct Request<E: Event> {
    event: E,
    token: EventToken<E>,
}

impl<E: Event> Request<E> {
    /// Token to pass to `complete` once the result is known
    pub fn token(&self) -> EventToken<E> {
        self.token
    }

    pub fn into_parts(self) -> (E, EventToken<E>) {
        (self.event, self.token)
    }
}

impl<E: Event> Deref for Request<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.event
    }
}

enum Payload {
    Event(Box<dyn Any + Send>),
    Broadcast(Arc<dyn Any + Send + Sync>),
}

/// A message sitting in (or just taken from) a worker's mailbox
pub struct Envelope {
    type_id: TypeId,
    type_name: &'static str,
    event_id: Option<EventId>,

    /// Enqueue time (nanoseconds since the Unix epoch)
    pub enqueued_ns: i64,

    payload: Payload,
}

impl Envelope {
    pub(crate) fn event<E: Event>(id: EventId, event: E) -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            type_name: std::any::type_name::<E>(),
            event_id: Some(id),
            enqueued_ns: now_ns(),
            payload: Payload::Event(Box::new(event)),
        }
    }

    pub(crate) fn broadcast<B: Broadcast>(shared: Arc<B>) -> Self {
        Self {
            type_id: TypeId::of::<B>(),
            type_name: std::any::type_name::<B>(),
            event_id: None,
            enqueued_ns: now_ns(),
            payload: Payload::Broadcast(shared),
        }
    }

    /// Runtime type of the payload (the dispatch key)
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn kind(&self) -> MessageKind {
        match self.payload {
            Payload::Event(_) => MessageKind::Event,
            Payload::Broadcast(_) => MessageKind::Broadcast,
        }
    }

    /// Set for events, `None` for broadcasts
    pub fn event_id(&self) -> Option<EventId> {
        self.event_id
    }

    /// Whether the payload is an `M`
    pub fn is<M: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<M>()
    }

    /// Take the payload out as an event of type `E`.
    ///
    /// Gives the envelope back unchanged if it holds something else.
    pub fn into_event<E: Event>(self) -> Result<Request<E>, Envelope> {
        let id = match self.event_id {
            Some(id) if self.is::<E>() => id,
            _ => return Err(self),
        };
        let Envelope {
            type_id,
            type_name,
            event_id,
            enqueued_ns,
            payload,
        } = self;
        match payload {
            Payload::Event(boxed) => match boxed.downcast::<E>() {
                Ok(event) => Ok(Request {
                    event: *event,
                    token: EventToken::new(id),
                }),
                Err(boxed) => Err(Envelope {
                    type_id,
                    type_name,
                    event_id,
                    enqueued_ns,
                    payload: Payload::Event(boxed),
                }),
            },
            payload => Err(Envelope {
                type_id,
                type_name,
                event_id,
                enqueued_ns,
                payload,
            }),
        }
    }

    /// Borrow the payload as a broadcast of type `B`
    pub fn broadcast_ref<B: Broadcast>(&self) -> Option<&B> {
        match &self.payload {
            Payload::Broadcast(shared) => shared.downcast_ref::<B>(),
            Payload::Event(_) => None,
        }
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("type", &self.type_name)
            .field("kind", &self.kind())
            .field("event_id", &self.event_id)
            .field("enqueued_ns", &self.enqueued_ns)
            .finish()
    }
}

fn now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Ping(u32);

    impl Event for Ping {
        type Output = u32;
    }

    #[derive(Debug, PartialEq)]
    struct Tick(u32);

    impl Broadcast for Tick {}

    #[test]
    fn test_event_ids_are_unique() {
        let a = EventId::next();
        let b = EventId::next();
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn test_event_envelope_roundtrip() {
        let id = EventId::next();
        let envelope = Envelope::event(id, Ping(3));

        assert_eq!(envelope.kind(), MessageKind::Event);
        assert_eq!(envelope.event_id(), Some(id));
        assert!(envelope.is::<Ping>());
        assert!(envelope.broadcast_ref::<Tick>().is_none());

        let request = envelope.into_event::<Ping>().unwrap();
        assert_eq!(request.0, 3);
        assert_eq!(request.token().id(), id);
    }

    #[test]
    fn test_wrong_type_returns_envelope() {
        let envelope = Envelope::broadcast(Arc::new(Tick(1)));
        assert_eq!(envelope.kind(), MessageKind::Broadcast);
        assert_eq!(envelope.event_id(), None);

        let envelope = envelope.into_event::<Ping>().unwrap_err();
        assert_eq!(envelope.broadcast_ref::<Tick>(), Some(&Tick(1)));
    }

    #[test]
    fn test_shared_broadcast_payload() {
        let shared = Arc::new(Tick(5));
        let a = Envelope::broadcast(shared.clone());
        let b = Envelope::broadcast(shared.clone());

        assert_eq!(Arc::strong_count(&shared), 3);
        assert_eq!(a.broadcast_ref::<Tick>(), b.broadcast_ref::<Tick>());
    }
}
