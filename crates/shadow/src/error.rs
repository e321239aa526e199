use crate::codec::DecodeError;
use crate::correlation::DuplicateToken;
use crate::topic::TopicError;
use crate::transport::SubscriptionHandlerError;

use thiserror::Error;

/// Errors returned by the shadow client.
#[derive(Debug, Error)]
pub enum Error {
    /// A channel could not be built from the given ids.
    #[error(transparent)]
    Topic(#[from] TopicError),

    /// The correlation token is already pending.
    #[error(transparent)]
    DuplicateToken(#[from] DuplicateToken),

    /// A document could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The transport failed to subscribe or publish.
    #[error("transport error: {0}")]
    Transport(String),

    /// The outcome channel closed before a result arrived.
    #[error("outcome channel closed")]
    ChannelClosed,
}

/// Convenience alias for results from the shadow client.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised by the subscription handlers this crate installs.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The delivered payload could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The engine the delivery was meant for has stopped.
    #[error("engine mailbox closed")]
    MailboxClosed,
}

impl SubscriptionHandlerError for HandlerError {}
