use proven_shadow::transport::TransportError;
use thiserror::Error;

/// An error that can occur on the in-memory transport.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The filter is not a valid subscription filter.
    #[error("invalid filter `{0}` - '#' may only appear as the last level")]
    InvalidFilter(String),

    /// A subscription was refused by fault injection.
    #[error("subscription to `{0}` refused")]
    SubscribeRefused(String),

    /// A publish was refused by fault injection.
    #[error("publish to `{0}` refused")]
    PublishRefused(String),
}

impl TransportError for Error {}
