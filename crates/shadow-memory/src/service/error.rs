use proven_shadow::transport::SubscriptionHandlerError;
use thiserror::Error;

/// Errors raised by the simulated shadow service.
#[derive(Debug, Error)]
pub enum Error {
    /// Subscribing to request channels failed.
    #[error("failed to subscribe to {0}: {1}")]
    Subscribe(String, crate::transport::Error),

    /// Publishing a response failed.
    #[error(transparent)]
    Publish(#[from] crate::transport::Error),
}

impl SubscriptionHandlerError for Error {}
