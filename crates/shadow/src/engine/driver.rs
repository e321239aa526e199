use super::{ConvergenceEngine, Effect, EngineEvent, EngineState, SyncEvent, UpdateOutcome};
use crate::client::UpdateChannel;
use crate::codec::Envelope;
use crate::correlation::{CorrelationToken, RegistrationHandle};
use crate::error::HandlerError;
use crate::shadow::{ShadowDeltaUpdatedEvent, UpdateShadowRequest};
use crate::topic::{Channel, ChannelKind, Operation};
use crate::transport::{QoS, SubscriptionHandler, Transport};

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Receives convergence notifications for one watched property.
pub trait SyncObserver: Send + Sync + 'static {
    /// Called from the engine's actor for every notification.
    fn on_event(&self, thing_name: &str, event: &SyncEvent);
}

impl<F> SyncObserver for F
where
    F: Fn(&str, &SyncEvent) + Send + Sync + 'static,
{
    fn on_event(&self, thing_name: &str, event: &SyncEvent) {
        self(thing_name, event);
    }
}

/// A snapshot of an engine, published after every event it handles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncStatus {
    /// Lifecycle state.
    pub state: EngineState,
    /// Last observed replica version.
    pub version: Option<u64>,
    /// Last value known to be reported.
    pub reported: Option<Value>,
}

impl SyncStatus {
    fn of(engine: &ConvergenceEngine) -> Self {
        Self {
            state: engine.state(),
            version: engine.version(),
            reported: engine.reported().cloned(),
        }
    }
}

/// Handle to a running convergence engine.
///
/// The engine runs on its own task; every delivery and resolution reaches it
/// as a message, so its state is only ever touched from that task.
#[derive(Debug)]
pub struct ShadowSync {
    thing_name: String,
    property: String,
    mailbox: mpsc::UnboundedSender<EngineEvent>,
    status: watch::Receiver<SyncStatus>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl ShadowSync {
    pub(crate) fn spawn<T, O>(
        thing_name: String,
        engine: ConvergenceEngine,
        transport: T,
        delta_channel: Channel,
        qos: QoS,
        updates: Arc<UpdateChannel<T>>,
        observer: O,
    ) -> Self
    where
        T: Transport,
        O: SyncObserver,
    {
        let property = engine.property().to_string();
        let (mailbox, inbox) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(SyncStatus::of(&engine));
        let shutdown_token = CancellationToken::new();
        let task_tracker = TaskTracker::new();

        let actor = Actor {
            thing_name: thing_name.clone(),
            engine,
            transport,
            delta_channel,
            qos,
            updates,
            observer,
            mailbox: mailbox.clone(),
            status: status_tx,
            delta_subscription: None,
            in_flight: None,
        };

        task_tracker.spawn(actor.run(inbox, shutdown_token.clone()));
        task_tracker.close();

        Self {
            thing_name,
            property,
            mailbox,
            status,
            shutdown_token,
            task_tracker,
        }
    }

    /// The watched thing.
    #[must_use]
    pub fn thing_name(&self) -> &str {
        &self.thing_name
    }

    /// The watched property.
    #[must_use]
    pub fn property(&self) -> &str {
        &self.property
    }

    /// The latest status snapshot.
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// A receiver that sees every status change.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Waits until the engine reaches `state`, or returns `None` if the
    /// engine stopped first.
    pub async fn wait_for_state(&self, state: EngineState) -> Option<SyncStatus> {
        let mut status = self.status.clone();
        status
            .wait_for(|status| status.state == state)
            .await
            .ok()
            .map(|status| status.clone())
    }

    /// Injects an event as though it had been delivered by the transport.
    ///
    /// Returns `false` if the engine has stopped.
    pub fn inject(&self, event: EngineEvent) -> bool {
        self.mailbox.send(event).is_ok()
    }

    /// Stops the engine and cancels its in-flight update, if any.
    pub async fn shutdown(&self) {
        info!(thing = %self.thing_name, property = %self.property, "shutting down shadow sync");
        self.shutdown_token.cancel();
        self.task_tracker.wait().await;
    }

    /// Whether the engine task has stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.task_tracker.is_closed() && self.task_tracker.is_empty()
    }
}

struct Actor<T, O>
where
    T: Transport,
{
    thing_name: String,
    engine: ConvergenceEngine,
    transport: T,
    delta_channel: Channel,
    qos: QoS,
    updates: Arc<UpdateChannel<T>>,
    observer: O,
    mailbox: mpsc::UnboundedSender<EngineEvent>,
    status: watch::Sender<SyncStatus>,
    delta_subscription: Option<T::Subscription>,
    in_flight: Option<RegistrationHandle>,
}

impl<T, O> Actor<T, O>
where
    T: Transport,
    O: SyncObserver,
{
    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<EngineEvent>,
        shutdown_token: CancellationToken,
    ) {
        let mut queue = VecDeque::from([EngineEvent::Start]);

        loop {
            while let Some(event) = queue.pop_front() {
                self.step(event, &mut queue).await;
            }

            tokio::select! {
                () = shutdown_token.cancelled() => break,
                event = inbox.recv() => match event {
                    Some(event) => queue.push_back(event),
                    None => break,
                },
            }
        }

        if let Some(handle) = self.in_flight.take() {
            self.updates.cancel(&handle);
        }
        self.delta_subscription = None;

        debug!(thing = %self.thing_name, "shadow sync stopped");
    }

    /// Runs one event through the engine. Events produced synchronously by
    /// effects (subscription results, publish failures) go to `queue`.
    async fn step(&mut self, event: EngineEvent, queue: &mut VecDeque<EngineEvent>) {
        if let EngineEvent::UpdateResolved { token, .. } = &event {
            if self.in_flight.as_ref().is_some_and(|h| h.token() == token) {
                self.in_flight = None;
            }
        }

        let mut notifications = Vec::new();

        for effect in self.engine.handle(event) {
            match effect {
                Effect::Subscribe(kind) => match self.subscribe(kind).await {
                    Ok(()) => queue.push_back(EngineEvent::SubscriptionConfirmed(kind)),
                    Err(reason) => queue.push_back(EngineEvent::SubscriptionFailed { kind, reason }),
                },
                Effect::PublishUpdate { token, request } => {
                    if let Err(reason) = self.publish(token, &request).await {
                        queue.push_back(EngineEvent::TransportFault(reason));
                    }
                }
                Effect::Abandon(token) => {
                    if let Some(handle) = self.in_flight.take_if(|h| h.token() == &token) {
                        self.updates.cancel(&handle);
                    }
                }
                Effect::Notify(event) => notifications.push(event),
            }
        }

        self.status.send_replace(SyncStatus::of(&self.engine));

        for event in &notifications {
            self.observer.on_event(&self.thing_name, event);
        }
    }

    async fn subscribe(&mut self, kind: ChannelKind) -> Result<(), String> {
        if kind == ChannelKind::Delta {
            let handler = DeltaHandler {
                mailbox: self.mailbox.clone(),
            };

            let subscription = self
                .transport
                .subscribe(&self.delta_channel, self.qos, handler)
                .await
                .map_err(|e| e.to_string())?;

            self.delta_subscription = Some(subscription);
            return Ok(());
        }

        self.updates
            .ensure_subscribed(&self.thing_name, &Operation::UpdateShadow, kind)
            .await
            .map_err(|e| e.to_string())
    }

    async fn publish(&mut self, token: CorrelationToken, request: &UpdateShadowRequest) -> Result<(), String> {
        let mailbox = self.mailbox.clone();
        let resolved = token.clone();

        let handler = move |outcome: UpdateOutcome| {
            if mailbox
                .send(EngineEvent::UpdateResolved {
                    token: resolved,
                    outcome,
                })
                .is_err()
            {
                debug!("engine stopped before its update resolved");
            }
        };

        let handle = self
            .updates
            .send(&self.thing_name, &Operation::UpdateShadow, token, request, handler)
            .await
            .map_err(|e| e.to_string())?;

        self.in_flight = Some(handle);
        Ok(())
    }
}

#[derive(Clone)]
struct DeltaHandler {
    mailbox: mpsc::UnboundedSender<EngineEvent>,
}

#[async_trait]
impl SubscriptionHandler for DeltaHandler {
    type Error = HandlerError;

    async fn handle(&self, channel: String, payload: Bytes) -> Result<(), Self::Error> {
        let delta = ShadowDeltaUpdatedEvent::from_payload(&payload).inspect_err(|e| {
            warn!(%channel, error = %e, "dropping undecodable delta");
        })?;

        self.mailbox
            .send(EngineEvent::Delta(delta))
            .map_err(|_| HandlerError::MailboxClosed)
    }
}
