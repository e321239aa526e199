use crate::codec::{Correlated, Envelope};
use crate::correlation::{CorrelationRegistry, CorrelationToken, Outcome, OutcomeHandler, RegistrationHandle};
use crate::error::{Error, HandlerError, Result};
use crate::topic::{Channel, ChannelKind, Operation, TopicRouter};
use crate::transport::{QoS, SubscriptionHandler, Transport};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// One request/response operation: a registry of pending requests plus the
/// accepted/rejected subscriptions that feed it.
pub struct RequestChannel<T, A, R>
where
    T: Transport,
{
    transport: T,
    router: TopicRouter,
    qos: QoS,
    registry: Arc<CorrelationRegistry<A, R>>,
    subscriptions: Mutex<HashMap<Channel, T::Subscription>>,
}

impl<T, A, R> fmt::Debug for RequestChannel<T, A, R>
where
    T: Transport,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestChannel")
            .field("router", &self.router)
            .field("qos", &self.qos)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl<T, A, R> RequestChannel<T, A, R>
where
    T: Transport,
    A: Envelope + Correlated + Send + Sync + 'static,
    R: Envelope + Correlated + Send + Sync + 'static,
{
    pub fn new(transport: T, router: TopicRouter, qos: QoS, registry: CorrelationRegistry<A, R>) -> Self {
        Self {
            transport,
            router,
            qos,
            registry: Arc::new(registry),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribes to one response channel of `resource` unless already
    /// subscribed.
    pub async fn ensure_subscribed(
        &self,
        resource: &str,
        operation: &Operation,
        kind: ChannelKind,
    ) -> Result<()> {
        let channel = self.router.channel_for(resource, operation, kind)?;

        // Held across the subscribe so concurrent callers don't double up.
        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.contains_key(&channel) {
            return Ok(());
        }

        let handler = ResponseHandler {
            registry: Arc::clone(&self.registry),
            kind,
        };

        let subscription = self
            .transport
            .subscribe(&channel, self.qos, handler)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        debug!(%channel, "subscribed to responses");
        subscriptions.insert(channel, subscription);

        Ok(())
    }

    /// Subscribes to responses, registers `handler` under `token`, then
    /// publishes `request`.
    ///
    /// Registration happens before the publish so a fast response cannot
    /// race past it. If the publish fails the registration is cancelled.
    pub async fn send<Q>(
        &self,
        resource: &str,
        operation: &Operation,
        token: CorrelationToken,
        request: &Q,
        handler: impl OutcomeHandler<A, R>,
    ) -> Result<RegistrationHandle>
    where
        Q: Envelope + Sync,
    {
        let channel = self
            .router
            .channel_for(resource, operation, ChannelKind::Request)?;

        self.ensure_subscribed(resource, operation, ChannelKind::Accepted)
            .await?;
        self.ensure_subscribed(resource, operation, ChannelKind::Rejected)
            .await?;

        let handle = self.registry.register(token, handler)?;

        if let Err(e) = self
            .transport
            .publish(&channel, request.to_payload(), self.qos)
            .await
        {
            warn!(%channel, error = %e, "publish failed");
            self.registry.cancel(&handle);
            return Err(Error::Transport(e.to_string()));
        }

        debug!(%channel, token = %handle.token(), "published request");
        Ok(handle)
    }

    pub fn cancel(&self, handle: &RegistrationHandle) -> bool {
        self.registry.cancel(handle)
    }

    pub fn expire(&self, now: Instant) -> usize {
        self.registry.expire(now)
    }

    pub fn pending(&self) -> usize {
        self.registry.len()
    }
}

/// Decodes responses from an accepted or rejected channel and resolves the
/// matching registration.
struct ResponseHandler<A, R> {
    registry: Arc<CorrelationRegistry<A, R>>,
    kind: ChannelKind,
}

impl<A, R> Clone for ResponseHandler<A, R> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            kind: self.kind,
        }
    }
}

impl<A, R> ResponseHandler<A, R>
where
    A: Envelope + Correlated,
    R: Envelope + Correlated,
{
    fn decode(&self, payload: &[u8]) -> Result<(Option<String>, Outcome<A, R>), HandlerError> {
        if self.kind == ChannelKind::Rejected {
            let rejection = R::from_payload(payload)?;
            let token = rejection.client_token().map(ToString::to_string);
            Ok((token, Outcome::Rejected(rejection)))
        } else {
            let response = A::from_payload(payload)?;
            let token = response.client_token().map(ToString::to_string);
            Ok((token, Outcome::Accepted(response)))
        }
    }
}

#[async_trait]
impl<A, R> SubscriptionHandler for ResponseHandler<A, R>
where
    A: Envelope + Correlated + Send + Sync + 'static,
    R: Envelope + Correlated + Send + Sync + 'static,
{
    type Error = HandlerError;

    async fn handle(&self, channel: String, payload: Bytes) -> Result<(), Self::Error> {
        let (token, outcome) = self.decode(&payload).inspect_err(|e| {
            warn!(%channel, error = %e, "dropping undecodable response");
        })?;

        match token {
            Some(token) => {
                self.registry.resolve(&token, outcome);
            }
            None => debug!(%channel, "dropping response without client token"),
        }

        Ok(())
    }
}
