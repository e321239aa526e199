//! Client and engine configuration

use crate::topic::DEFAULT_NAMESPACE;
use crate::transport::QoS;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Shadow client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowClientConfig {
    /// Channel namespace prefix
    pub namespace: String,

    /// How long a request may stay pending before it times out
    pub request_timeout: Duration,

    /// Delivery guarantee for requests and response subscriptions
    pub qos: QoS,
}

impl Default for ShadowClientConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            request_timeout: Duration::from_secs(10),
            qos: QoS::AtLeastOnce,
        }
    }
}

/// Convergence engine configuration
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Value to converge to when a delta deletes the watched property.
    /// Such deltas are ignored when unset.
    pub default_value: Option<Value>,
}

impl EngineConfig {
    /// Sets the value to converge to when the property is deleted.
    #[must_use]
    pub fn with_default_value(mut self, value: impl Into<Value>) -> Self {
        self.default_value = Some(value.into());
        self
    }
}
