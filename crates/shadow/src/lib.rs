//! Keeps a device's properties in sync with a cloud-resident, versioned
//! shadow document over a publish/subscribe transport.
//!
//! Requests are published fire-and-forget and answered on separate
//! `accepted`/`rejected` channels; the [`correlation`] registry pairs them back
//! up by client token. The [`engine`] reacts to `delta` notifications by
//! reporting the desired value, guarded by the [`version`] policy.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod client;
mod config;
mod error;

/// Typed documents and the envelope codec.
pub mod codec;

/// Request/response correlation.
pub mod correlation;

/// The convergence state machine and its driver.
pub mod engine;

/// Job execution envelopes.
pub mod jobs;

/// Shadow envelopes.
pub mod shadow;

/// Channel naming.
pub mod topic;

/// The publish/subscribe collaborator.
pub mod transport;

/// Optimistic-concurrency version policy.
pub mod version;

pub use client::{
    DeleteOutcome, DescribeJobExecutionOutcome, GetOutcome, RequestHandle, RequestKind,
    ShadowClient,
};
pub use config::{EngineConfig, ShadowClientConfig};
pub use engine::{EngineState, ShadowSync, SyncEvent, SyncFailure, SyncObserver, SyncStatus, UpdateOutcome};
pub use error::{Error, HandlerError, Result};
