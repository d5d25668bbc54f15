//! Event bus contract used to invoke remote operations.
//!
//! Delivery is at-least-once. A successful [`EventBus::publish`] means the
//! invocation was accepted by the bus, not that the remote service
//! completed its business logic.

pub mod bus;
pub mod envelope;
pub mod error;
pub mod memory;

pub use bus::EventBus;
pub use envelope::{EventEnvelope, EventEnvelopeBuilder, EventId};
pub use error::{EventBusError, Result};
pub use memory::InMemoryEventBus;
