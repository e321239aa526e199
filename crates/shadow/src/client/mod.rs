//! The caller-facing shadow API.

mod request_channel;

use request_channel::RequestChannel;

use crate::codec::{Correlated, Document, Envelope};
use crate::config::{EngineConfig, ShadowClientConfig};
use crate::correlation::{CorrelationRegistry, CorrelationToken, Outcome, OutcomeHandler, RegistrationHandle, completion};
use crate::engine::{ConvergenceEngine, ShadowSync, SyncObserver, UpdateOutcome};
use crate::error::{Error, Result};
use crate::jobs::{DescribeJobExecutionRequest, DescribeJobExecutionResponse, JobsError};
use crate::shadow::{
    DeleteShadowRequest, DeleteShadowResponse, ErrorResponse, GetShadowRequest, GetShadowResponse,
    ShadowState, UpdateShadowRequest, UpdateShadowResponse,
};
use crate::topic::{ChannelKind, Operation, TopicRouter};
use crate::transport::Transport;

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info, instrument};

pub(crate) type UpdateChannel<T> = RequestChannel<T, UpdateShadowResponse, ErrorResponse>;

/// Outcome of a get request.
pub type GetOutcome = Outcome<GetShadowResponse, ErrorResponse>;

/// Outcome of a delete request.
pub type DeleteOutcome = Outcome<DeleteShadowResponse, ErrorResponse>;

/// Outcome of a describe-job-execution request.
pub type DescribeJobExecutionOutcome = Outcome<DescribeJobExecutionResponse, JobsError>;

/// Which operation a [`RequestHandle`] belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// An update.
    Update,
    /// A get.
    Get,
    /// A delete.
    Delete,
    /// A job execution describe.
    DescribeJobExecution,
}

/// Identifies an issued request so it can be cancelled.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestHandle {
    kind: RequestKind,
    registration: RegistrationHandle,
}

impl RequestHandle {
    /// The operation the request belongs to.
    #[must_use]
    pub const fn kind(&self) -> RequestKind {
        self.kind
    }

    /// The request's correlation token.
    #[must_use]
    pub const fn token(&self) -> &CorrelationToken {
        self.registration.token()
    }
}

/// Shadow client over a publish/subscribe transport.
///
/// Every operation has one correlation registry shared by all callers and
/// all watched properties, and subscribes to each thing's accepted and
/// rejected channels at most once.
pub struct ShadowClient<T>
where
    T: Transport,
{
    transport: T,
    router: TopicRouter,
    config: ShadowClientConfig,
    updates: Arc<UpdateChannel<T>>,
    gets: Arc<RequestChannel<T, GetShadowResponse, ErrorResponse>>,
    deletes: Arc<RequestChannel<T, DeleteShadowResponse, ErrorResponse>>,
    job_descriptions: Arc<RequestChannel<T, DescribeJobExecutionResponse, JobsError>>,
}

impl<T> Clone for ShadowClient<T>
where
    T: Transport,
{
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            router: self.router.clone(),
            config: self.config.clone(),
            updates: Arc::clone(&self.updates),
            gets: Arc::clone(&self.gets),
            deletes: Arc::clone(&self.deletes),
            job_descriptions: Arc::clone(&self.job_descriptions),
        }
    }
}

impl<T> std::fmt::Debug for ShadowClient<T>
where
    T: Transport,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowClient")
            .field("transport", &self.transport)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<T> ShadowClient<T>
where
    T: Transport,
{
    /// Creates a client.
    pub fn new(transport: T, config: ShadowClientConfig) -> Self {
        let router = TopicRouter::new(config.namespace.clone());

        Self {
            updates: Arc::new(Self::request_channel(&transport, &router, &config)),
            gets: Arc::new(Self::request_channel(&transport, &router, &config)),
            deletes: Arc::new(Self::request_channel(&transport, &router, &config)),
            job_descriptions: Arc::new(Self::request_channel(&transport, &router, &config)),
            transport,
            router,
            config,
        }
    }

    fn request_channel<A, R>(
        transport: &T,
        router: &TopicRouter,
        config: &ShadowClientConfig,
    ) -> RequestChannel<T, A, R>
    where
        A: Envelope + Correlated + Send + Sync + 'static,
        R: Envelope + Correlated + Send + Sync + 'static,
    {
        RequestChannel::new(
            transport.clone(),
            router.clone(),
            config.qos,
            CorrelationRegistry::new(config.request_timeout),
        )
    }

    /// The client's configuration.
    #[must_use]
    pub const fn config(&self) -> &ShadowClientConfig {
        &self.config
    }

    /// The router used to name channels.
    #[must_use]
    pub const fn router(&self) -> &TopicRouter {
        &self.router
    }

    /// Starts keeping `property` of `thing_name` converged with its desired
    /// value.
    ///
    /// # Errors
    ///
    /// Returns `Error::Topic` if `thing_name` cannot be used in a channel name.
    pub fn watch(
        &self,
        thing_name: &str,
        property: &str,
        config: EngineConfig,
        observer: impl SyncObserver,
    ) -> Result<ShadowSync> {
        self.watch_with(thing_name, ConvergenceEngine::new(property, config), observer)
    }

    /// Like [`watch`](Self::watch), with a pre-seeded engine.
    ///
    /// # Errors
    ///
    /// Returns `Error::Topic` if `thing_name` cannot be used in a channel name.
    pub fn watch_with(
        &self,
        thing_name: &str,
        engine: ConvergenceEngine,
        observer: impl SyncObserver,
    ) -> Result<ShadowSync> {
        let delta_channel =
            self.router
                .channel_for(thing_name, &Operation::UpdateShadow, ChannelKind::Delta)?;

        info!(thing = thing_name, property = engine.property(), "watching shadow property");

        Ok(ShadowSync::spawn(
            thing_name.to_string(),
            engine,
            self.transport.clone(),
            delta_channel,
            self.config.qos,
            Arc::clone(&self.updates),
            observer,
        ))
    }

    /// Publishes an update of the desired state, delivering the outcome to
    /// `handler`.
    ///
    /// The handler sees exactly one outcome unless the request is cancelled.
    /// Timeouts are delivered by [`expire`](Self::expire).
    ///
    /// # Errors
    ///
    /// Returns an error if the request could not be registered or published;
    /// the handler is then never invoked.
    #[instrument(skip(self, desired, handler))]
    pub async fn request_update(
        &self,
        thing_name: &str,
        desired: Document,
        expected_version: Option<u64>,
        handler: impl OutcomeHandler<UpdateShadowResponse, ErrorResponse>,
    ) -> Result<RequestHandle> {
        let token = CorrelationToken::generate();
        let request = UpdateShadowRequest {
            client_token: token.to_string(),
            state: ShadowState {
                desired: Some(Value::Object(desired)),
                reported: None,
                delta: None,
            },
            version: expected_version,
        };

        self.send_update(thing_name, token, &request, handler).await
    }

    /// Publishes an arbitrary update document, e.g. one that reports state.
    /// The request's `client_token` is replaced with a fresh token.
    ///
    /// # Errors
    ///
    /// Returns an error if the request could not be registered or published.
    #[instrument(skip(self, request, handler))]
    pub async fn request_raw_update(
        &self,
        thing_name: &str,
        mut request: UpdateShadowRequest,
        handler: impl OutcomeHandler<UpdateShadowResponse, ErrorResponse>,
    ) -> Result<RequestHandle> {
        let token = CorrelationToken::generate();
        request.client_token = token.to_string();

        self.send_update(thing_name, token, &request, handler).await
    }

    async fn send_update(
        &self,
        thing_name: &str,
        token: CorrelationToken,
        request: &UpdateShadowRequest,
        handler: impl OutcomeHandler<UpdateShadowResponse, ErrorResponse>,
    ) -> Result<RequestHandle> {
        let registration = self
            .updates
            .send(thing_name, &Operation::UpdateShadow, token, request, handler)
            .await?;

        Ok(RequestHandle {
            kind: RequestKind::Update,
            registration,
        })
    }

    /// Publishes an update of the desired state and waits for its outcome.
    ///
    /// The returned future only completes when a response arrives or when
    /// [`expire`](Self::expire) times the request out. Callers must drive
    /// `expire` on a schedule, or a lost response leaves it pending forever.
    ///
    /// # Errors
    ///
    /// Returns an error if the request could not be published.
    pub async fn update(
        &self,
        thing_name: &str,
        desired: Document,
        expected_version: Option<u64>,
    ) -> Result<UpdateOutcome> {
        let (handler, outcome) = completion::<UpdateShadowResponse, ErrorResponse>();
        self.request_update(thing_name, desired, expected_version, handler)
            .await?;

        outcome.await.map_err(|_| Error::ChannelClosed)
    }

    /// Fetches the whole shadow document.
    ///
    /// The returned future only completes when a response arrives or when
    /// [`expire`](Self::expire) times the request out. Callers must drive
    /// `expire` on a schedule, or a lost response leaves it pending forever.
    ///
    /// # Errors
    ///
    /// Returns an error if the request could not be published.
    #[instrument(skip(self))]
    pub async fn get_shadow(&self, thing_name: &str) -> Result<GetOutcome> {
        let token = CorrelationToken::generate();
        let request = GetShadowRequest {
            client_token: Some(token.to_string()),
        };

        let (handler, outcome) = completion::<GetShadowResponse, ErrorResponse>();
        self.gets
            .send(thing_name, &Operation::GetShadow, token, &request, handler)
            .await?;

        outcome.await.map_err(|_| Error::ChannelClosed)
    }

    /// Deletes the shadow document.
    ///
    /// The returned future only completes when a response arrives or when
    /// [`expire`](Self::expire) times the request out. Callers must drive
    /// `expire` on a schedule, or a lost response leaves it pending forever.
    ///
    /// # Errors
    ///
    /// Returns an error if the request could not be published.
    #[instrument(skip(self))]
    pub async fn delete_shadow(
        &self,
        thing_name: &str,
        expected_version: Option<u64>,
    ) -> Result<DeleteOutcome> {
        let token = CorrelationToken::generate();
        let request = DeleteShadowRequest {
            client_token: Some(token.to_string()),
            version: expected_version,
        };

        let (handler, outcome) = completion::<DeleteShadowResponse, ErrorResponse>();
        self.deletes
            .send(thing_name, &Operation::DeleteShadow, token, &request, handler)
            .await?;

        outcome.await.map_err(|_| Error::ChannelClosed)
    }

    /// Describes a job execution on `thing_name`.
    ///
    /// The returned future only completes when a response arrives or when
    /// [`expire`](Self::expire) times the request out. Callers must drive
    /// `expire` on a schedule, or a lost response leaves it pending forever.
    ///
    /// # Errors
    ///
    /// Returns an error if the ids are invalid or the request could not be
    /// published.
    #[instrument(skip(self, request))]
    pub async fn describe_job_execution(
        &self,
        thing_name: &str,
        job_id: &str,
        mut request: DescribeJobExecutionRequest,
    ) -> Result<DescribeJobExecutionOutcome> {
        let token = CorrelationToken::generate();
        request.client_token = Some(token.to_string());

        let operation = Operation::DescribeJobExecution {
            job_id: job_id.to_string(),
        };

        let (handler, outcome) = completion::<DescribeJobExecutionResponse, JobsError>();
        self.job_descriptions
            .send(thing_name, &operation, token, &request, handler)
            .await?;

        outcome.await.map_err(|_| Error::ChannelClosed)
    }

    /// Cancels a pending request. Its handler will not be invoked.
    ///
    /// Returns `false` if the request already completed.
    pub fn cancel(&self, handle: &RequestHandle) -> bool {
        let cancelled = match handle.kind {
            RequestKind::Update => self.updates.cancel(&handle.registration),
            RequestKind::Get => self.gets.cancel(&handle.registration),
            RequestKind::Delete => self.deletes.cancel(&handle.registration),
            RequestKind::DescribeJobExecution => {
                self.job_descriptions.cancel(&handle.registration)
            }
        };

        debug!(token = %handle.token(), cancelled, "cancel requested");
        cancelled
    }

    /// Times out every request across all operations whose deadline is at or
    /// before `now`. Returns how many timed out.
    ///
    /// Nothing in the client schedules this; the embedder calls it, e.g. from
    /// an interval task.
    pub fn expire(&self, now: Instant) -> usize {
        self.updates.expire(now)
            + self.gets.expire(now)
            + self.deletes.expire(now)
            + self.job_descriptions.expire(now)
    }

    /// Number of requests still awaiting an outcome.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.updates.pending()
            + self.gets.pending()
            + self.deletes.pending()
            + self.job_descriptions.pending()
    }
}
