//! One-shot promise for event results
//!
//! A [`Future`] is handed to the sender of an event and resolved by whichever
//! worker handles it. Waiting and resolving share a single mutex/condvar pair,
//! so a resolution that lands between a waiter's check and its sleep is never
//! lost.

use crate::error::{BusError, BusResult};
use crate::message::EventId;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

enum Slot<T> {
    Pending,
    Resolved(T),
    Abandoned,
}

pub(crate) struct Shared<T> {
    id: EventId,
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T: Send + 'static> Shared<T> {
    /// Returns `true` only for the call that moved the slot out of `Pending`
    pub(crate) fn resolve(&self, value: T) -> bool {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Pending) {
            return false;
        }
        *slot = Slot::Resolved(value);
        self.ready.notify_all();
        true
    }
}

/// Type-erased view of a pending future, as stored in the bus table.
pub(crate) trait PendingSlot: Send + Sync {
    fn abandon(&self) -> bool;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Send + 'static> PendingSlot for Shared<T> {
    fn abandon(&self) -> bool {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Pending) {
            return false;
        }
        *slot = Slot::Abandoned;
        self.ready.notify_all();
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Eventually-available result of an event.
///
/// Cloning yields another handle to the same promise. The value is cloned out
/// on every successful `get`, so any number of threads may wait on it.
///
/// # Example
/// ```
/// use sensor_bus::Future;
/// use std::time::Duration;
///
/// let future = Future::<u32>::new();
/// assert_eq!(future.get_timeout(Duration::from_millis(1)), None);
///
/// future.resolve(7);
/// future.resolve(8); // ignored
/// assert_eq!(future.get().unwrap(), 7);
/// ```
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> Future<T> {
    /// Create an unresolved future with a fresh identity
    pub fn new() -> Self {
        Self::with_id(EventId::next())
    }

    pub(crate) fn with_id(id: EventId) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                slot: Mutex::new(Slot::Pending),
                ready: Condvar::new(),
            }),
        }
    }

    pub(crate) fn slot(&self) -> Arc<dyn PendingSlot> {
        self.shared.clone()
    }

    /// Identity of the event this future belongs to
    pub fn id(&self) -> EventId {
        self.shared.id
    }

    /// Block until the future is resolved and return its value.
    ///
    /// Fails with [`BusError::Abandoned`] if the handler the event was routed
    /// to unregistered before completing it.
    pub fn get(&self) -> BusResult<T> {
        let mut slot = self.shared.slot.lock();
        loop {
            match &*slot {
                Slot::Resolved(value) => return Ok(value.clone()),
                Slot::Abandoned => return Err(BusError::Abandoned(self.shared.id)),
                Slot::Pending => self.shared.ready.wait(&mut slot),
            }
        }
    }

    /// Wait at most `timeout` for the value.
    ///
    /// Returns `None` if the future is still unresolved at the deadline, or if
    /// it was abandoned.
    pub fn get_timeout(&self, timeout: Duration) -> Option<T> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            // Past the clock's range: no deadline can ever be reached
            return self.get().ok();
        };
        let mut slot = self.shared.slot.lock();
        loop {
            match &*slot {
                Slot::Resolved(value) => return Some(value.clone()),
                Slot::Abandoned => return None,
                Slot::Pending => {
                    if self.shared.ready.wait_until(&mut slot, deadline).timed_out() {
                        return match &*slot {
                            Slot::Resolved(value) => Some(value.clone()),
                            _ => None,
                        };
                    }
                }
            }
        }
    }

    /// Set the value and wake every waiter. Only the first call has an effect.
    pub fn resolve(&self, value: T) -> bool {
        self.shared.resolve(value)
    }

    /// Non-blocking check for a resolved value
    pub fn is_done(&self) -> bool {
        matches!(*self.shared.slot.lock(), Slot::Resolved(_))
    }

    /// Non-blocking check for abandonment
    pub fn is_abandoned(&self) -> bool {
        matches!(*self.shared.slot.lock(), Slot::Abandoned)
    }
}

impl<T: Clone + Send + 'static> Default for Future<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.shared.slot.lock() {
            Slot::Pending => "pending",
            Slot::Resolved(_) => "resolved",
            Slot::Abandoned => "abandoned",
        };
        f.debug_struct("Future")
            .field("id", &self.shared.id)
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_resolve_then_get() {
        let future = Future::new();
        assert!(!future.is_done());

        assert!(future.resolve("ok".to_string()));
        assert!(future.is_done());
        assert_eq!(future.get().unwrap(), "ok");
    }

    #[test]
    fn test_second_resolve_is_ignored() {
        let future = Future::new();

        assert!(future.resolve(1));
        assert!(!future.resolve(2));

        assert_eq!(future.get().unwrap(), 1);
        assert_eq!(future.get_timeout(Duration::ZERO), Some(1));
    }

    #[test]
    fn test_get_blocks_until_resolved() {
        let future = Future::<u64>::new();
        let resolver = future.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            resolver.resolve(42);
        });

        assert_eq!(future.get().unwrap(), 42);
        handle.join().unwrap();
    }

    #[test]
    fn test_get_timeout_expires() {
        let future = Future::<u64>::new();
        let started = Instant::now();

        assert_eq!(future.get_timeout(Duration::from_millis(30)), None);
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(!future.is_done());
    }

    #[test]
    fn test_get_timeout_without_deadline() {
        let future = Future::<u64>::new();
        future.resolve(1);
        assert_eq!(future.get_timeout(Duration::MAX), Some(1));

        let abandoned = Future::<u64>::new();
        abandoned.shared.abandon();
        assert_eq!(abandoned.get_timeout(Duration::MAX), None);
    }

    #[test]
    fn test_get_timeout_returns_value_resolved_in_window() {
        let future = Future::<u64>::new();
        let resolver = future.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            resolver.resolve(5);
        });

        assert_eq!(future.get_timeout(Duration::from_secs(5)), Some(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_many_waiters_all_wake() {
        let future = Future::<u32>::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let f = future.clone();
                thread::spawn(move || f.get().unwrap())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        future.resolve(9);

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), 9);
        }
    }

    #[test]
    fn test_abandon_wakes_waiter_with_error() {
        let future = Future::<u32>::new();
        let slot = future.slot();
        let waiter = {
            let f = future.clone();
            thread::spawn(move || f.get())
        };

        thread::sleep(Duration::from_millis(20));
        assert!(slot.abandon());

        assert_eq!(waiter.join().unwrap(), Err(BusError::Abandoned(future.id())));
        assert!(future.is_abandoned());
        assert!(!future.is_done());
        assert!(!future.resolve(1));
        assert_eq!(future.get_timeout(Duration::ZERO), None);
    }
}
