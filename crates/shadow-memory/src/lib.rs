//! In-memory transport and simulated shadow service for the shadow sync crate.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// A simulated cloud shadow service that answers requests on the transport.
pub mod service;

/// A process-local pub/sub transport with topic filters and fault injection.
pub mod transport;

pub use service::{MemoryShadowService, Replica};
pub use transport::{MemorySubscription, MemoryTransport};
