//! Delta-driven convergence of one watched property.
//!
//! [`ConvergenceEngine`] is a plain state machine: it consumes [`EngineEvent`]s
//! and returns the [`Effect`]s the caller must carry out. It never touches the
//! transport itself, which keeps every transition testable without a runtime.
//! [`ShadowSync`] is the actor that owns an engine and executes its effects.

mod driver;

pub use driver::{ShadowSync, SyncObserver, SyncStatus};

use crate::config::EngineConfig;
use crate::correlation::{CorrelationToken, Outcome};
use crate::shadow::{ErrorResponse, ShadowDeltaUpdatedEvent, UpdateShadowRequest, UpdateShadowResponse};
use crate::topic::ChannelKind;
use crate::version::{TrackedVersion, VersionDecision};

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

/// Outcome of an update request.
pub type UpdateOutcome = Outcome<UpdateShadowResponse, ErrorResponse>;

/// Channels that must be subscribed before deltas can be acted on.
const REQUIRED_CHANNELS: [ChannelKind; 3] = [
    ChannelKind::Delta,
    ChannelKind::Accepted,
    ChannelKind::Rejected,
];

/// Lifecycle state of a convergence engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineState {
    /// Created but not started.
    Idle,
    /// Waiting for the delta, accepted and rejected subscriptions.
    AwaitingSubscriptions,
    /// Reported state matches the last known desired state.
    Synced,
    /// An update is in flight.
    Converging,
    /// A subscribe or publish failed. Terminal.
    Faulted,
}

/// Input to the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    /// Begin subscribing.
    Start,
    /// A subscription was acknowledged.
    SubscriptionConfirmed(ChannelKind),
    /// A subscription failed.
    SubscriptionFailed {
        /// Which subscription.
        kind: ChannelKind,
        /// Transport error text.
        reason: String,
    },
    /// A delta notification arrived.
    Delta(ShadowDeltaUpdatedEvent),
    /// The registry resolved an update this engine issued.
    UpdateResolved {
        /// Token of the resolved update.
        token: CorrelationToken,
        /// What happened to it.
        outcome: UpdateOutcome,
    },
    /// The transport failed while publishing.
    TransportFault(String),
}

/// Work the engine asks its driver to perform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    /// Subscribe to one of the required channels.
    Subscribe(ChannelKind),
    /// Register `token` with the update registry, then publish `request`.
    PublishUpdate {
        /// Correlation token of the request.
        token: CorrelationToken,
        /// The update to publish.
        request: UpdateShadowRequest,
    },
    /// Cancel the registration for `token`; its outcome is no longer wanted.
    Abandon(CorrelationToken),
    /// Tell the observer something happened.
    Notify(SyncEvent),
}

/// Why a convergence attempt did not succeed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncFailure {
    /// The service rejected the update.
    Rejected(ErrorResponse),
    /// No response arrived in time.
    Timeout,
}

/// Notifications delivered to a [`SyncObserver`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    /// All subscriptions are in place.
    Ready,
    /// The reported value now matches the desired value.
    Converged {
        /// The reported value.
        value: Value,
        /// The version after the update.
        version: u64,
    },
    /// An update attempt failed. It is not retried.
    Failed {
        /// The value that could not be reported.
        desired: Value,
        /// Why.
        failure: SyncFailure,
    },
    /// The engine stopped for good.
    Faulted {
        /// Transport error text.
        reason: String,
    },
}

#[derive(Debug)]
struct InFlight {
    token: CorrelationToken,
    desired: Value,
}

/// State machine keeping one property of one replica converged.
#[derive(Debug)]
pub struct ConvergenceEngine {
    property: String,
    config: EngineConfig,
    state: EngineState,
    version: TrackedVersion,
    reported: Option<Value>,
    confirmed: HashSet<ChannelKind>,
    in_flight: Option<InFlight>,
    superseding: Option<Value>,
}

impl ConvergenceEngine {
    /// Creates an idle engine watching `property`.
    #[must_use]
    pub fn new(property: impl Into<String>, config: EngineConfig) -> Self {
        Self {
            property: property.into(),
            config,
            state: EngineState::Idle,
            version: TrackedVersion::default(),
            reported: None,
            confirmed: HashSet::new(),
            in_flight: None,
            superseding: None,
        }
    }

    /// Seeds the engine with a version and reported value learned elsewhere,
    /// e.g. from a get.
    #[must_use]
    pub fn with_known_state(mut self, version: u64, reported: Option<Value>) -> Self {
        self.version = TrackedVersion::at(version);
        self.reported = reported;
        self
    }

    /// The watched property.
    #[must_use]
    pub fn property(&self) -> &str {
        &self.property
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> EngineState {
        self.state
    }

    /// Last observed replica version.
    #[must_use]
    pub const fn version(&self) -> Option<u64> {
        self.version.current()
    }

    /// Last value this engine knows to be reported.
    #[must_use]
    pub const fn reported(&self) -> Option<&Value> {
        self.reported.as_ref()
    }

    /// Feeds one event through the state machine.
    pub fn handle(&mut self, event: EngineEvent) -> Vec<Effect> {
        if self.state == EngineState::Faulted {
            debug!(?event, "engine faulted; ignoring event");
            return Vec::new();
        }

        match event {
            EngineEvent::Start => self.start(),
            EngineEvent::SubscriptionConfirmed(kind) => self.confirm(kind),
            EngineEvent::SubscriptionFailed { kind, reason } => {
                self.fault(format!("subscription to {kind} channel failed: {reason}"))
            }
            EngineEvent::Delta(delta) => self.on_delta(delta),
            EngineEvent::UpdateResolved { token, outcome } => self.on_resolved(&token, outcome),
            EngineEvent::TransportFault(reason) => self.fault(reason),
        }
    }

    fn start(&mut self) -> Vec<Effect> {
        if self.state != EngineState::Idle {
            warn!(state = ?self.state, "engine already started");
            return Vec::new();
        }

        self.state = EngineState::AwaitingSubscriptions;
        REQUIRED_CHANNELS.into_iter().map(Effect::Subscribe).collect()
    }

    fn confirm(&mut self, kind: ChannelKind) -> Vec<Effect> {
        if self.state != EngineState::AwaitingSubscriptions {
            return Vec::new();
        }

        self.confirmed.insert(kind);
        if !REQUIRED_CHANNELS.iter().all(|k| self.confirmed.contains(k)) {
            return Vec::new();
        }

        info!(property = %self.property, "subscriptions in place");
        self.state = EngineState::Synced;
        vec![Effect::Notify(SyncEvent::Ready)]
    }

    fn on_delta(&mut self, delta: ShadowDeltaUpdatedEvent) -> Vec<Effect> {
        if !matches!(self.state, EngineState::Synced | EngineState::Converging) {
            debug!(state = ?self.state, "delta before subscriptions completed; ignoring");
            return Vec::new();
        }

        let Some(value) = delta.state.get(&self.property) else {
            debug!(version = delta.version, "delta does not touch watched property");
            return Vec::new();
        };

        if self.version.observe(delta.version) == VersionDecision::StaleIgnore {
            debug!(
                version = delta.version,
                current = ?self.version.current(),
                "ignoring stale delta"
            );
            return Vec::new();
        }

        let desired = if value.is_null() {
            if let Some(default) = &self.config.default_value {
                info!(property = %self.property, %default, "property deleted; restoring default");
                default.clone()
            } else {
                warn!(property = %self.property, "property deleted and no default configured");
                return Vec::new();
            }
        } else {
            value.clone()
        };

        match &self.in_flight {
            Some(in_flight) => {
                debug!(%desired, "update in flight; coalescing delta");
                self.superseding = (in_flight.desired != desired).then_some(desired);
                Vec::new()
            }
            None => self.converge(desired),
        }
    }

    fn converge(&mut self, desired: Value) -> Vec<Effect> {
        if self.reported.as_ref() == Some(&desired) {
            debug!(%desired, "already reported; nothing to do");
            self.state = EngineState::Synced;
            return Vec::new();
        }

        let token = CorrelationToken::generate();
        let request = UpdateShadowRequest::mirrored(token.as_str(), &self.property, desired.clone());

        info!(property = %self.property, %desired, %token, "reporting desired value");
        self.state = EngineState::Converging;
        self.in_flight = Some(InFlight {
            token: token.clone(),
            desired,
        });

        vec![Effect::PublishUpdate { token, request }]
    }

    fn on_resolved(&mut self, token: &CorrelationToken, outcome: UpdateOutcome) -> Vec<Effect> {
        let Some(in_flight) = self
            .in_flight
            .take_if(|in_flight| &in_flight.token == token)
        else {
            debug!(%token, "resolution for an update this engine is not waiting on");
            return Vec::new();
        };

        let notification = match outcome {
            Outcome::Accepted(response) => {
                if self.version.observe(response.version) == VersionDecision::StaleIgnore {
                    debug!(version = response.version, "accepted response carries stale version");
                }

                let value = response
                    .state
                    .as_ref()
                    .and_then(|state| state.reported_property(&self.property))
                    .cloned()
                    .unwrap_or(in_flight.desired);

                info!(property = %self.property, %value, version = response.version, "converged");
                self.reported = Some(value.clone());

                SyncEvent::Converged {
                    value,
                    version: self.version.current().unwrap_or(response.version),
                }
            }
            Outcome::Rejected(rejection) => {
                warn!(code = rejection.code, message = ?rejection.message, "update rejected");
                SyncEvent::Failed {
                    desired: in_flight.desired,
                    failure: SyncFailure::Rejected(rejection),
                }
            }
            Outcome::Timeout => {
                warn!(%token, "update timed out");
                SyncEvent::Failed {
                    desired: in_flight.desired,
                    failure: SyncFailure::Timeout,
                }
            }
        };

        self.state = EngineState::Synced;
        let mut effects = vec![Effect::Notify(notification)];

        if let Some(next) = self.superseding.take() {
            effects.extend(self.converge(next));
        }

        effects
    }

    fn fault(&mut self, reason: String) -> Vec<Effect> {
        error!(property = %self.property, %reason, "engine faulted");
        self.state = EngineState::Faulted;
        self.superseding = None;

        let mut effects = Vec::new();
        if let Some(in_flight) = self.in_flight.take() {
            effects.push(Effect::Abandon(in_flight.token));
        }
        effects.push(Effect::Notify(SyncEvent::Faulted { reason }));
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::shadow::ShadowState;

    use serde_json::json;

    fn delta(fragment: Value, version: u64) -> EngineEvent {
        let Value::Object(state) = fragment else {
            panic!("delta state must be an object");
        };

        EngineEvent::Delta(ShadowDeltaUpdatedEvent {
            state,
            version,
            timestamp: None,
            metadata: None,
            client_token: None,
        })
    }

    fn accepted(version: u64, reported: Option<Value>) -> UpdateOutcome {
        Outcome::Accepted(UpdateShadowResponse {
            version,
            state: reported.map(|reported| ShadowState {
                desired: None,
                reported: Some(reported),
                delta: None,
            }),
            metadata: None,
            client_token: None,
            timestamp: None,
        })
    }

    fn synced(property: &str, version: u64, reported: Option<Value>) -> ConvergenceEngine {
        let mut engine =
            ConvergenceEngine::new(property, EngineConfig::default()).with_known_state(version, reported);

        engine.handle(EngineEvent::Start);
        for kind in REQUIRED_CHANNELS {
            engine.handle(EngineEvent::SubscriptionConfirmed(kind));
        }
        assert_eq!(engine.state(), EngineState::Synced);

        engine
    }

    fn published(effects: &[Effect]) -> (CorrelationToken, UpdateShadowRequest) {
        match effects {
            [Effect::PublishUpdate { token, request }] => (token.clone(), request.clone()),
            other => panic!("expected one publish, got {other:?}"),
        }
    }

    #[test]
    fn test_start_subscribes_to_all_channels() {
        let mut engine = ConvergenceEngine::new("power", EngineConfig::default());

        let effects = engine.handle(EngineEvent::Start);
        assert_eq!(
            effects,
            vec![
                Effect::Subscribe(ChannelKind::Delta),
                Effect::Subscribe(ChannelKind::Accepted),
                Effect::Subscribe(ChannelKind::Rejected),
            ]
        );
        assert_eq!(engine.state(), EngineState::AwaitingSubscriptions);

        assert!(engine.handle(EngineEvent::Start).is_empty());
    }

    #[test]
    fn test_synced_only_after_all_confirmations() {
        let mut engine = ConvergenceEngine::new("power", EngineConfig::default());
        engine.handle(EngineEvent::Start);

        assert!(
            engine
                .handle(EngineEvent::SubscriptionConfirmed(ChannelKind::Delta))
                .is_empty()
        );
        assert!(
            engine
                .handle(EngineEvent::SubscriptionConfirmed(ChannelKind::Delta))
                .is_empty()
        );
        assert!(
            engine
                .handle(EngineEvent::SubscriptionConfirmed(ChannelKind::Rejected))
                .is_empty()
        );
        assert_eq!(engine.state(), EngineState::AwaitingSubscriptions);

        let effects = engine.handle(EngineEvent::SubscriptionConfirmed(ChannelKind::Accepted));
        assert_eq!(effects, vec![Effect::Notify(SyncEvent::Ready)]);
        assert_eq!(engine.state(), EngineState::Synced);
    }

    #[test]
    fn test_delta_ignored_while_awaiting_subscriptions() {
        let mut engine = ConvergenceEngine::new("power", EngineConfig::default());
        engine.handle(EngineEvent::Start);

        assert!(engine.handle(delta(json!({"power": "on"}), 6)).is_empty());
        assert_eq!(engine.version(), None);
    }

    #[test]
    fn test_power_scenario() {
        let mut engine = synced("power", 5, Some(json!("off")));

        let effects = engine.handle(delta(json!({"power": "on"}), 6));
        let (token, request) = published(&effects);

        assert_eq!(engine.state(), EngineState::Converging);
        assert_eq!(request.client_token, token.as_str());
        assert_eq!(request.state.desired_property("power"), Some(&json!("on")));
        assert_eq!(request.state.reported_property("power"), Some(&json!("on")));
        assert_eq!(request.version, None);

        let effects = engine.handle(EngineEvent::UpdateResolved {
            token,
            outcome: accepted(6, Some(json!({"power": "on"}))),
        });

        assert_eq!(
            effects,
            vec![Effect::Notify(SyncEvent::Converged {
                value: json!("on"),
                version: 6,
            })]
        );
        assert_eq!(engine.state(), EngineState::Synced);
        assert_eq!(engine.version(), Some(6));
        assert_eq!(engine.reported(), Some(&json!("on")));
    }

    #[test]
    fn test_accepted_with_newer_version_advances() {
        let mut engine = synced("power", 5, None);

        let (token, _) = published(&engine.handle(delta(json!({"power": "on"}), 6)));
        engine.handle(EngineEvent::UpdateResolved {
            token,
            outcome: accepted(7, None),
        });

        assert_eq!(engine.version(), Some(7));
        assert_eq!(engine.reported(), Some(&json!("on")));
    }

    #[test]
    fn test_stale_delta_is_ignored() {
        let mut engine = synced("power", 5, Some(json!("off")));

        assert!(engine.handle(delta(json!({"power": "on"}), 5)).is_empty());
        assert!(engine.handle(delta(json!({"power": "on"}), 3)).is_empty());
        assert_eq!(engine.state(), EngineState::Synced);
        assert_eq!(engine.version(), Some(5));
    }

    #[test]
    fn test_unwatched_property_is_ignored() {
        let mut engine = synced("power", 5, Some(json!("off")));

        assert!(engine.handle(delta(json!({"color": "red"}), 6)).is_empty());
        assert_eq!(engine.state(), EngineState::Synced);
        assert_eq!(engine.version(), Some(5));
    }

    #[test]
    fn test_delta_matching_reported_is_noop() {
        let mut engine = synced("power", 5, Some(json!("on")));

        assert!(engine.handle(delta(json!({"power": "on"}), 6)).is_empty());
        assert_eq!(engine.state(), EngineState::Synced);
        assert_eq!(engine.version(), Some(6));
    }

    #[test]
    fn test_deltas_coalesce_while_converging() {
        let mut engine = synced("power", 5, Some(json!("off")));

        let (first, _) = published(&engine.handle(delta(json!({"power": "on"}), 6)));
        assert!(engine.handle(delta(json!({"power": "dim"}), 7)).is_empty());
        assert!(engine.handle(delta(json!({"power": "max"}), 8)).is_empty());

        let effects = engine.handle(EngineEvent::UpdateResolved {
            token: first,
            outcome: accepted(9, Some(json!({"power": "on"}))),
        });

        let [Effect::Notify(SyncEvent::Converged { .. }), follow_up] = effects.as_slice() else {
            panic!("expected a notification and one follow-up, got {effects:?}");
        };
        let (_, request) = published(std::slice::from_ref(follow_up));
        assert_eq!(request.state.desired_property("power"), Some(&json!("max")));
        assert_eq!(engine.state(), EngineState::Converging);
    }

    #[test]
    fn test_coalesced_value_equal_to_in_flight_is_dropped() {
        let mut engine = synced("power", 5, Some(json!("off")));

        let (token, _) = published(&engine.handle(delta(json!({"power": "on"}), 6)));
        engine.handle(delta(json!({"power": "dim"}), 7));
        engine.handle(delta(json!({"power": "on"}), 8));

        let effects = engine.handle(EngineEvent::UpdateResolved {
            token,
            outcome: Outcome::Timeout,
        });

        assert_eq!(
            effects,
            vec![Effect::Notify(SyncEvent::Failed {
                desired: json!("on"),
                failure: SyncFailure::Timeout,
            })]
        );
        assert_eq!(engine.state(), EngineState::Synced);
    }

    #[test]
    fn test_rejection_returns_to_synced_without_retry() {
        let mut engine = synced("power", 5, Some(json!("off")));

        let (token, _) = published(&engine.handle(delta(json!({"power": "on"}), 6)));
        let rejection = ErrorResponse::new(409, "Version conflict");

        let effects = engine.handle(EngineEvent::UpdateResolved {
            token,
            outcome: Outcome::Rejected(rejection.clone()),
        });

        assert_eq!(
            effects,
            vec![Effect::Notify(SyncEvent::Failed {
                desired: json!("on"),
                failure: SyncFailure::Rejected(rejection),
            })]
        );
        assert_eq!(engine.state(), EngineState::Synced);
        assert_eq!(engine.reported(), Some(&json!("off")));
    }

    #[test]
    fn test_foreign_resolution_is_ignored() {
        let mut engine = synced("power", 5, Some(json!("off")));
        published(&engine.handle(delta(json!({"power": "on"}), 6)));

        let effects = engine.handle(EngineEvent::UpdateResolved {
            token: CorrelationToken::from("someone-else"),
            outcome: accepted(7, None),
        });

        assert!(effects.is_empty());
        assert_eq!(engine.state(), EngineState::Converging);
    }

    #[test]
    fn test_deleted_property_restores_default() {
        let mut engine = ConvergenceEngine::new("power", EngineConfig::default().with_default_value("off"))
            .with_known_state(5, Some(json!("on")));
        engine.handle(EngineEvent::Start);
        for kind in REQUIRED_CHANNELS {
            engine.handle(EngineEvent::SubscriptionConfirmed(kind));
        }

        let (_, request) = published(&engine.handle(delta(json!({"power": null}), 6)));
        assert_eq!(request.state.reported_property("power"), Some(&json!("off")));
    }

    #[test]
    fn test_deleted_property_without_default_is_ignored() {
        let mut engine = synced("power", 5, Some(json!("on")));

        assert!(engine.handle(delta(json!({"power": null}), 6)).is_empty());
        assert_eq!(engine.state(), EngineState::Synced);
    }

    #[test]
    fn test_fault_is_terminal() {
        let mut engine = synced("power", 5, Some(json!("off")));
        let (token, _) = published(&engine.handle(delta(json!({"power": "on"}), 6)));

        let effects = engine.handle(EngineEvent::TransportFault("connection lost".to_string()));
        assert_eq!(
            effects,
            vec![
                Effect::Abandon(token.clone()),
                Effect::Notify(SyncEvent::Faulted {
                    reason: "connection lost".to_string()
                }),
            ]
        );
        assert_eq!(engine.state(), EngineState::Faulted);

        assert!(engine.handle(delta(json!({"power": "dim"}), 7)).is_empty());
        assert!(
            engine
                .handle(EngineEvent::UpdateResolved {
                    token,
                    outcome: accepted(7, None)
                })
                .is_empty()
        );
        assert_eq!(engine.state(), EngineState::Faulted);
    }

    #[test]
    fn test_subscription_failure_faults() {
        let mut engine = ConvergenceEngine::new("power", EngineConfig::default());
        engine.handle(EngineEvent::Start);

        let effects = engine.handle(EngineEvent::SubscriptionFailed {
            kind: ChannelKind::Delta,
            reason: "denied".to_string(),
        });

        assert!(matches!(
            effects.as_slice(),
            [Effect::Notify(SyncEvent::Faulted { reason })] if reason.contains("delta")
        ));
        assert_eq!(engine.state(), EngineState::Faulted);
    }
}
