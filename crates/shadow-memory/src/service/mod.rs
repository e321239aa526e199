mod error;

pub use error::Error;

use crate::transport::{MemorySubscription, MemoryTransport};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use proven_shadow::codec::{self, Document, Envelope};
use proven_shadow::jobs::{
    DescribeJobExecutionRequest, DescribeJobExecutionResponse, JobExecutionData, JobsError,
    JobsErrorCode,
};
use proven_shadow::shadow::{
    DeleteShadowRequest, DeleteShadowResponse, ErrorResponse, GetShadowRequest, GetShadowResponse,
    ShadowDeltaUpdatedEvent, ShadowState, UpdateShadowRequest, UpdateShadowResponse,
};
use proven_shadow::topic::{Channel, ChannelKind, Operation, TopicRouter};
use proven_shadow::transport::{QoS, SubscriptionHandler, Transport};
use serde_json::Value;
use tracing::{debug, info, warn};

/// One shadow document as held by the service.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Replica {
    /// Desired partition.
    pub desired: Document,
    /// Reported partition.
    pub reported: Document,
    /// Incremented by every accepted update.
    pub version: u64,
}

impl Replica {
    /// Desired entries that differ from their reported counterpart.
    #[must_use]
    pub fn delta(&self) -> Document {
        self.desired
            .iter()
            .filter(|(key, value)| self.reported.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// The delta caused by applying `fragment` to the desired partition.
    /// Deleting a desired key that is still reported yields a `null` entry.
    fn change_delta(&self, fragment: &Document) -> Document {
        let mut delta = Document::new();

        for key in fragment.keys() {
            match self.desired.get(key) {
                Some(value) if self.reported.get(key) != Some(value) => {
                    delta.insert(key.clone(), value.clone());
                }
                None if self.reported.contains_key(key) => {
                    delta.insert(key.clone(), Value::Null);
                }
                _ => {}
            }
        }

        delta
    }
}

/// Applies a state fragment: `null` removes a key, objects merge recursively.
fn merge(target: &mut Document, fragment: &Document) {
    for (key, value) in fragment {
        match value {
            Value::Null => {
                target.remove(key);
            }
            Value::Object(nested) => {
                if let Some(Value::Object(existing)) = target.get_mut(key) {
                    merge(existing, nested);
                } else {
                    let mut fresh = Document::new();
                    merge(&mut fresh, nested);
                    target.insert(key.clone(), Value::Object(fresh));
                }
            }
            other => {
                target.insert(key.clone(), other.clone());
            }
        }
    }
}

fn apply_partition(target: &mut Document, partition: Option<&Value>) {
    match partition {
        Some(Value::Object(fragment)) => merge(target, fragment),
        Some(Value::Null) => target.clear(),
        _ => {}
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

fn token_of(payload: &[u8]) -> Option<String> {
    codec::from_payload(payload)
        .ok()?
        .get("clientToken")?
        .as_str()
        .map(ToString::to_string)
}

type Reply = (Channel, Bytes);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Endpoint {
    Update,
    Get,
    Delete,
    DescribeJobExecution,
}

impl Endpoint {
    fn operation(self) -> Operation {
        match self {
            Self::Update => Operation::UpdateShadow,
            Self::Get => Operation::GetShadow,
            Self::Delete => Operation::DeleteShadow,
            Self::DescribeJobExecution => Operation::DescribeJobExecution {
                job_id: String::new(),
            },
        }
    }
}

#[derive(Debug)]
struct Inner {
    transport: MemoryTransport,
    router: TopicRouter,
    replicas: parking_lot::Mutex<HashMap<String, Replica>>,
    jobs: parking_lot::Mutex<HashMap<(String, String), JobExecutionData>>,
}

impl Inner {
    fn reply(&self, thing: &str, operation: &Operation, kind: ChannelKind, payload: Bytes) -> Vec<Reply> {
        match self.router.channel_for(thing, operation, kind) {
            Ok(channel) => vec![(channel, payload)],
            Err(e) => {
                warn!(thing, error = %e, "cannot address reply");
                Vec::new()
            }
        }
    }

    fn rejected(&self, thing: &str, operation: &Operation, error: &ErrorResponse) -> Vec<Reply> {
        debug!(thing, code = error.code, message = ?error.message, "rejecting request");
        self.reply(thing, operation, ChannelKind::Rejected, error.to_payload())
    }

    fn update(&self, thing: &str, payload: &[u8]) -> Vec<Reply> {
        let operation = Operation::UpdateShadow;

        let request = match UpdateShadowRequest::from_payload(payload) {
            Ok(request) => request,
            Err(e) => {
                let error = ErrorResponse::new(400, e.to_string()).with_client_token(token_of(payload));
                return self.rejected(thing, &operation, &error);
            }
        };

        if request.state.desired.is_none() && request.state.reported.is_none() {
            let error = ErrorResponse::new(400, "Missing required node: state")
                .with_client_token(Some(request.client_token));
            return self.rejected(thing, &operation, &error);
        }

        let timestamp = now();
        let (version, delta) = {
            let mut replicas = self.replicas.lock();
            let replica = replicas.entry(thing.to_string()).or_default();

            if let Some(expected) = request.version {
                if expected != replica.version {
                    let error = ErrorResponse::new(409, "Version conflict")
                        .with_client_token(Some(request.client_token));
                    return self.rejected(thing, &operation, &error);
                }
            }

            apply_partition(&mut replica.desired, request.state.desired.as_ref());
            apply_partition(&mut replica.reported, request.state.reported.as_ref());
            replica.version += 1;

            let delta = match &request.state.desired {
                Some(Value::Object(fragment)) => replica.change_delta(fragment),
                _ => Document::new(),
            };

            (replica.version, delta)
        };

        debug!(thing, version, "update accepted");

        let accepted = UpdateShadowResponse {
            version,
            state: Some(ShadowState {
                desired: request.state.desired,
                reported: request.state.reported,
                delta: None,
            }),
            metadata: None,
            client_token: Some(request.client_token.clone()),
            timestamp: Some(timestamp),
        };

        let mut replies = self.reply(thing, &operation, ChannelKind::Accepted, accepted.to_payload());

        if !delta.is_empty() {
            let event = ShadowDeltaUpdatedEvent {
                state: delta,
                version,
                timestamp: Some(timestamp),
                metadata: None,
                client_token: Some(request.client_token),
            };
            replies.extend(self.reply(thing, &operation, ChannelKind::Delta, event.to_payload()));
        }

        replies
    }

    fn get(&self, thing: &str, payload: &[u8]) -> Vec<Reply> {
        let operation = Operation::GetShadow;

        let request = match GetShadowRequest::from_payload(payload) {
            Ok(request) => request,
            Err(e) => {
                let error = ErrorResponse::new(400, e.to_string()).with_client_token(token_of(payload));
                return self.rejected(thing, &operation, &error);
            }
        };

        let Some(replica) = self.replicas.lock().get(thing).cloned() else {
            let error = ErrorResponse::new(404, format!("No shadow exists with name: '{thing}'"))
                .with_client_token(request.client_token);
            return self.rejected(thing, &operation, &error);
        };

        let delta = replica.delta();
        let accepted = GetShadowResponse {
            state: Some(ShadowState {
                desired: Some(Value::Object(replica.desired)),
                reported: Some(Value::Object(replica.reported)),
                delta: (!delta.is_empty()).then_some(Value::Object(delta)),
            }),
            metadata: None,
            version: Some(replica.version),
            client_token: request.client_token,
            timestamp: Some(now()),
        };

        self.reply(thing, &operation, ChannelKind::Accepted, accepted.to_payload())
    }

    fn delete(&self, thing: &str, payload: &[u8]) -> Vec<Reply> {
        let operation = Operation::DeleteShadow;

        let request = match DeleteShadowRequest::from_payload(payload) {
            Ok(request) => request,
            Err(e) => {
                let error = ErrorResponse::new(400, e.to_string()).with_client_token(token_of(payload));
                return self.rejected(thing, &operation, &error);
            }
        };

        let removed = {
            let mut replicas = self.replicas.lock();
            match (replicas.get(thing), request.version) {
                (None, _) => Err(ErrorResponse::new(
                    404,
                    format!("No shadow exists with name: '{thing}'"),
                )),
                (Some(replica), Some(expected)) if replica.version != expected => {
                    Err(ErrorResponse::new(409, "Version conflict"))
                }
                (Some(_), _) => replicas
                    .remove(thing)
                    .map(|replica| replica.version)
                    .ok_or_else(|| ErrorResponse::new(500, "Internal service failure")),
            }
        };

        match removed {
            Ok(version) => {
                info!(thing, version, "shadow deleted");
                let accepted = DeleteShadowResponse {
                    version: Some(version),
                    client_token: request.client_token,
                    timestamp: Some(now()),
                };
                self.reply(thing, &operation, ChannelKind::Accepted, accepted.to_payload())
            }
            Err(error) => {
                let error = error.with_client_token(request.client_token);
                self.rejected(thing, &operation, &error)
            }
        }
    }

    fn describe_job_execution(&self, thing: &str, job_id: &str, payload: &[u8]) -> Vec<Reply> {
        let operation = Operation::DescribeJobExecution {
            job_id: job_id.to_string(),
        };

        let rejected = |code: JobsErrorCode, message: &str, client_token: Option<String>| {
            let error = JobsError {
                code,
                message: Some(message.to_string()),
                client_token,
                timestamp: Some(now()),
            };
            self.reply(thing, &operation, ChannelKind::Rejected, error.to_payload())
        };

        let request = match DescribeJobExecutionRequest::from_payload(payload) {
            Ok(request) => request,
            Err(e) => return rejected(JobsErrorCode::InvalidRequest, &e.to_string(), token_of(payload)),
        };

        let execution = self
            .jobs
            .lock()
            .get(&(thing.to_string(), job_id.to_string()))
            .cloned();

        let Some(mut execution) = execution else {
            return rejected(
                JobsErrorCode::ResourceNotFound,
                &format!("Job execution {job_id} not found for thing {thing}"),
                request.client_token,
            );
        };

        if request.include_job_document != Some(true) {
            execution.job_document = None;
        }

        let accepted = DescribeJobExecutionResponse {
            client_token: request.client_token,
            execution: Some(execution),
            timestamp: Some(now()),
        };

        self.reply(thing, &operation, ChannelKind::Accepted, accepted.to_payload())
    }

    fn set_desired(&self, thing: &str, fragment: &Document) -> (u64, Vec<Reply>) {
        let (version, delta) = {
            let mut replicas = self.replicas.lock();
            let replica = replicas.entry(thing.to_string()).or_default();

            merge(&mut replica.desired, fragment);
            replica.version += 1;

            (replica.version, replica.change_delta(fragment))
        };

        if delta.is_empty() {
            return (version, Vec::new());
        }

        let event = ShadowDeltaUpdatedEvent {
            state: delta,
            version,
            timestamp: Some(now()),
            metadata: None,
            client_token: None,
        };

        let replies = self.reply(
            thing,
            &Operation::UpdateShadow,
            ChannelKind::Delta,
            event.to_payload(),
        );

        (version, replies)
    }

    async fn send(&self, replies: Vec<Reply>) -> Result<(), Error> {
        for (channel, payload) in replies {
            self.transport
                .publish(&channel, payload, QoS::AtLeastOnce)
                .await?;
        }

        Ok(())
    }
}

#[derive(Clone)]
struct RequestHandler {
    inner: Arc<Inner>,
    endpoint: Endpoint,
}

#[async_trait]
impl SubscriptionHandler for RequestHandler {
    type Error = Error;

    async fn handle(&self, channel: String, payload: Bytes) -> Result<(), Self::Error> {
        let Some(thing) = self.inner.router.resource_of(&channel) else {
            warn!(%channel, "request on unexpected channel");
            return Ok(());
        };

        let replies = match self.endpoint {
            Endpoint::Update => self.inner.update(thing, &payload),
            Endpoint::Get => self.inner.get(thing, &payload),
            Endpoint::Delete => self.inner.delete(thing, &payload),
            Endpoint::DescribeJobExecution => {
                let Some(job_id) = self.inner.router.job_of(&channel) else {
                    warn!(%channel, "job request without job id");
                    return Ok(());
                };
                self.inner.describe_job_execution(thing, job_id, &payload)
            }
        };

        self.inner.send(replies).await
    }
}

/// A simulated cloud shadow service answering requests published on a
/// [`MemoryTransport`].
///
/// It subscribes to the request channels of every thing in its namespace,
/// owns the replicas and job executions, and publishes responses and deltas
/// the way the real service does.
#[derive(Clone, Debug)]
pub struct MemoryShadowService {
    inner: Arc<Inner>,
    subscriptions: Arc<Vec<MemorySubscription>>,
}

impl MemoryShadowService {
    /// Subscribes to every request channel and starts answering.
    ///
    /// # Errors
    ///
    /// Returns `Error::Subscribe` if any request channel cannot be subscribed.
    pub async fn start(transport: MemoryTransport, router: TopicRouter) -> Result<Self, Error> {
        let inner = Arc::new(Inner {
            transport,
            router,
            replicas: parking_lot::Mutex::new(HashMap::new()),
            jobs: parking_lot::Mutex::new(HashMap::new()),
        });

        let mut subscriptions = Vec::new();
        for endpoint in [
            Endpoint::Update,
            Endpoint::Get,
            Endpoint::Delete,
            Endpoint::DescribeJobExecution,
        ] {
            let filter = inner
                .router
                .wildcard_filter(&endpoint.operation(), ChannelKind::Request);

            let handler = RequestHandler {
                inner: Arc::clone(&inner),
                endpoint,
            };

            let subscription = inner
                .transport
                .subscribe(&filter, QoS::AtLeastOnce, handler)
                .await
                .map_err(|e| Error::Subscribe(filter.to_string(), e))?;

            subscriptions.push(subscription);
        }

        info!(namespace = inner.router.namespace(), "shadow service started");

        Ok(Self {
            inner,
            subscriptions: Arc::new(subscriptions),
        })
    }

    /// The request filters being served.
    #[must_use]
    pub fn served_filters(&self) -> Vec<&str> {
        self.subscriptions.iter().map(MemorySubscription::filter).collect()
    }

    /// Replaces a replica outright, without publishing anything.
    pub fn put_replica(&self, thing_name: &str, replica: Replica) {
        self.inner
            .replicas
            .lock()
            .insert(thing_name.to_string(), replica);
    }

    /// A snapshot of a replica.
    #[must_use]
    pub fn replica(&self, thing_name: &str) -> Option<Replica> {
        self.inner.replicas.lock().get(thing_name).cloned()
    }

    /// Changes the desired state the way an owner would from outside the
    /// device, publishing a delta if desired and reported now differ.
    /// Returns the new version.
    ///
    /// # Errors
    ///
    /// Returns `Error::Publish` if the delta could not be published.
    pub async fn set_desired(&self, thing_name: &str, fragment: Document) -> Result<u64, Error> {
        let (version, replies) = self.inner.set_desired(thing_name, &fragment);
        info!(thing = thing_name, version, "desired state changed");

        self.inner.send(replies).await?;
        Ok(version)
    }

    /// Registers a job execution for `describe` requests.
    pub fn seed_job(&self, thing_name: &str, job_id: &str, execution: JobExecutionData) {
        self.inner
            .jobs
            .lock()
            .insert((thing_name.to_string(), job_id.to_string()), execution);
    }
}
