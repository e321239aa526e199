use super::CorrelationToken;

use thiserror::Error;

/// A token was registered while an earlier request with the same token is
/// still pending.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("correlation token {0} is already pending")]
pub struct DuplicateToken(pub CorrelationToken);
