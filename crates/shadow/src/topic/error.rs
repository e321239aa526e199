use thiserror::Error;

/// Errors raised while building a channel name.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    /// An identifier was empty.
    #[error("{0} must not be empty")]
    Empty(&'static str),

    /// An identifier contained the `/` level separator.
    #[error("{0} must not contain '/'")]
    ContainsSeparator(&'static str),

    /// An identifier contained a `+` or `#` wildcard.
    #[error("{0} must not contain wildcard characters")]
    ContainsWildcard(&'static str),
}
