//! Error types for bus operations

use crate::message::EventId;
use crate::registry::WorkerId;
use thiserror::Error;

/// Errors surfaced by the message bus and its futures.
///
/// Routing failures are not errors: `send_event` returns `None` when an event
/// type has no subscriber, and duplicate completions are silently ignored.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The worker has no mailbox (never registered, or already unregistered)
    #[error("worker {0} is not registered with the bus")]
    NotRegistered(WorkerId),

    /// A blocking wait was interrupted through `MessageBus::interrupt`
    #[error("worker {0} was interrupted while waiting for a message")]
    Interrupted(WorkerId),

    /// The worker the event was routed to unregistered before completing it
    #[error("event {0} was abandoned by its handler")]
    Abandoned(EventId),

    /// A worker failed to start: its thread could not be spawned or
    /// `Service::initialize` returned an error
    #[error("worker {0} failed to initialize: {1}")]
    InitFailed(WorkerId, String),

    /// A worker thread panicked
    #[error("worker {0} panicked")]
    Panicked(WorkerId),

    /// Bus configuration could not be read or parsed
    #[error("invalid bus configuration: {0}")]
    Config(String),
}

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;
