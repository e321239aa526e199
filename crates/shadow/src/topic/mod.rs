mod error;

pub use error::TopicError;

use std::fmt;

/// Default namespace under which things publish and subscribe.
pub const DEFAULT_NAMESPACE: &str = "$aws/things";

const SEPARATOR: char = '/';

/// Which leg of an operation a channel carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Where the device publishes its requests.
    Request,
    /// Where the service publishes successful responses.
    Accepted,
    /// Where the service publishes error responses.
    Rejected,
    /// Where the service publishes desired-vs-reported differences.
    Delta,
}

impl ChannelKind {
    /// The trailing path segment for this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Delta => "delta",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operation exposed by the service.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Change desired and/or reported state.
    UpdateShadow,
    /// Fetch the whole document.
    GetShadow,
    /// Delete the document.
    DeleteShadow,
    /// Describe one job execution.
    DescribeJobExecution {
        /// The job being described.
        job_id: String,
    },
}

impl Operation {
    fn segments(&self) -> String {
        match self {
            Self::UpdateShadow => "shadow/update".to_string(),
            Self::GetShadow => "shadow/get".to_string(),
            Self::DeleteShadow => "shadow/delete".to_string(),
            Self::DescribeJobExecution { job_id } => format!("jobs/{job_id}/get"),
        }
    }

    fn validate(&self) -> Result<(), TopicError> {
        match self {
            Self::DescribeJobExecution { job_id } => validate_segment("job id", job_id),
            _ => Ok(()),
        }
    }
}

/// A fully rendered channel name (or subscription filter).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(String);

impl Channel {
    /// Wraps an already rendered name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The channel name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

fn validate_segment(what: &'static str, value: &str) -> Result<(), TopicError> {
    if value.is_empty() {
        return Err(TopicError::Empty(what));
    }

    if value.contains(SEPARATOR) {
        return Err(TopicError::ContainsSeparator(what));
    }

    if value.contains(['+', '#']) {
        return Err(TopicError::ContainsWildcard(what));
    }

    Ok(())
}

/// Maps `(resource, operation, kind)` to channel names of the form
/// `<namespace>/<resource>/<operation>/<kind>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicRouter {
    namespace: String,
}

impl Default for TopicRouter {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl TopicRouter {
    /// Creates a router for the given namespace.
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// The namespace prefix.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Renders the channel for one resource.
    ///
    /// # Errors
    ///
    /// Returns a `TopicError` if the resource or job id is empty or contains
    /// `/`, `+` or `#`.
    pub fn channel_for(
        &self,
        resource_id: &str,
        operation: &Operation,
        kind: ChannelKind,
    ) -> Result<Channel, TopicError> {
        validate_segment("resource id", resource_id)?;
        operation.validate()?;

        Ok(Channel(format!(
            "{}/{resource_id}/{}/{kind}",
            self.namespace,
            operation.segments()
        )))
    }

    /// Renders a filter matching the channel of every resource.
    ///
    /// For job operations the job id is matched with a wildcard too.
    #[must_use]
    pub fn wildcard_filter(&self, operation: &Operation, kind: ChannelKind) -> Channel {
        let segments = match operation {
            Operation::DescribeJobExecution { .. } => "jobs/+/get".to_string(),
            other => other.segments(),
        };

        Channel(format!("{}/+/{segments}/{kind}", self.namespace))
    }

    /// Extracts the resource id from a channel rendered by this router.
    #[must_use]
    pub fn resource_of<'a>(&self, channel: &'a str) -> Option<&'a str> {
        channel
            .strip_prefix(self.namespace.as_str())?
            .strip_prefix(SEPARATOR)?
            .split(SEPARATOR)
            .next()
            .filter(|resource| !resource.is_empty())
    }

    /// Extracts the job id from a describe-execution channel.
    #[must_use]
    pub fn job_of<'a>(&self, channel: &'a str) -> Option<&'a str> {
        let rest = channel
            .strip_prefix(self.namespace.as_str())?
            .strip_prefix(SEPARATOR)?;

        let mut parts = rest.split(SEPARATOR).skip(1);
        match (parts.next(), parts.next(), parts.next()) {
            (Some("jobs"), Some(job_id), Some("get")) => Some(job_id),
            _ => None,
        }
    }
}
