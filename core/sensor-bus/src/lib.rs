//! # Sensor Bus
//!
//! In-process message bus for independently scheduled workers.
//!
//! ## Features
//!
//! - **Events**: one consumer per message, picked round-robin among the
//!   subscribers of its type, with a [`Future`] for the result
//! - **Broadcasts**: delivered to every current subscriber of their type
//! - **Mailboxes**: one FIFO queue per registered worker, blocking receive
//! - **Workers**: a thread-per-service runtime that binds handlers by type
//!   and drains its mailbox until terminated
//!
//! ## Example
//!
//! ```rust
//! use sensor_bus::{Broadcast, Event, MessageBus, Service, Setup, Worker};
//! use std::sync::Arc;
//!
//! #[derive(Debug)]
//! struct Detect(u32);
//!
//! impl Event for Detect {
//!     type Output = u32;
//! }
//!
//! #[derive(Debug)]
//! struct Shutdown;
//!
//! impl Broadcast for Shutdown {}
//!
//! struct Doubler;
//!
//! impl Service for Doubler {
//!     fn initialize(&mut self, setup: &mut Setup<'_, Self>) -> anyhow::Result<()> {
//!         setup
//!             .on_event::<Detect, _>(|_, ctx, detect| {
//!                 ctx.complete(detect.token(), detect.0 * 2);
//!                 Ok(())
//!             })
//!             .on_broadcast::<Shutdown, _>(|_, ctx, _| {
//!                 ctx.terminate();
//!                 Ok(())
//!             });
//!         Ok(())
//!     }
//! }
//!
//! let bus = Arc::new(MessageBus::new());
//! let worker = Worker::new("doubler", bus.clone(), Doubler).spawn().unwrap();
//!
//! let future = bus.send_event(Detect(21)).unwrap();
//! assert_eq!(future.get().unwrap(), 42);
//!
//! bus.send_broadcast(Shutdown);
//! worker.join().unwrap();
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod future;
pub mod message;
pub mod messages;
pub mod registry;
pub mod worker;

// Re-exports
pub use bus::{DispatchStats, MessageBus};
pub use config::BusConfig;
pub use error::{BusError, BusResult};
pub use future::Future;
pub use message::{Broadcast, Envelope, Event, EventId, EventToken, MessageKind, Request};
pub use registry::WorkerId;
pub use worker::{Context, Service, Setup, Worker, WorkerHandle, WorkerState, WorkerStats};
