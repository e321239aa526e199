use crate::topic::Channel;

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Marker trait for transport errors
pub trait TransportError: Error + Send + Sync + 'static {}

/// Marker trait for subscription handler errors
pub trait SubscriptionHandlerError: Error + Send + Sync + 'static {}

/// Delivery guarantee requested for a publish or subscription.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce,
    /// Delivered one or more times.
    #[default]
    AtLeastOnce,
}

/// Receives every payload delivered on a subscribed channel.
#[async_trait]
pub trait SubscriptionHandler
where
    Self: Clone + Send + Sync + 'static,
{
    /// The error type for the handler.
    type Error: SubscriptionHandlerError;

    /// Handles one delivery. `channel` is the concrete channel the payload
    /// was published on, which may differ from a wildcard filter.
    async fn handle(&self, channel: String, payload: Bytes) -> Result<(), Self::Error>;
}

/// A publish/subscribe connection.
///
/// Payloads on one channel are delivered in publish order; nothing is assumed
/// about ordering across channels.
#[async_trait]
pub trait Transport
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the transport.
    type Error: TransportError;

    /// Keeps a subscription alive; dropping it unsubscribes.
    type Subscription: Debug + Send + Sync + 'static;

    /// Subscribes `handler` to a channel or wildcard filter. Resolves once
    /// the subscription is acknowledged.
    async fn subscribe<X>(
        &self,
        filter: &Channel,
        qos: QoS,
        handler: X,
    ) -> Result<Self::Subscription, Self::Error>
    where
        X: SubscriptionHandler;

    /// Publishes a payload. Resolves once the transport accepted it, not when
    /// any response arrives.
    async fn publish(&self, channel: &Channel, payload: Bytes, qos: QoS) -> Result<(), Self::Error>;
}
