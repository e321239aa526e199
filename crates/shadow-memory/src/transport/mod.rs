mod error;

pub use error::Error;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use proven_shadow::topic::Channel;
use proven_shadow::transport::{QoS, SubscriptionHandler, Transport};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, trace, warn};

const CHANNEL_CAPACITY: usize = 1024;

type Delivery = (String, Bytes);

/// Whether `channel` matches `filter`. `+` matches exactly one level and a
/// trailing `#` matches any number of remaining levels.
#[must_use]
pub fn filter_matches(filter: &str, channel: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut channel_levels = channel.split('/');

    loop {
        match (filter_levels.next(), channel_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(c)) if f == c => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn validate_filter(filter: &str) -> Result<(), Error> {
    let levels: Vec<&str> = filter.split('/').collect();
    let misplaced_hash = levels
        .iter()
        .enumerate()
        .any(|(i, level)| level.contains('#') && (*level != "#" || i + 1 != levels.len()));

    if filter.is_empty() || misplaced_hash {
        return Err(Error::InvalidFilter(filter.to_string()));
    }

    Ok(())
}

#[derive(Debug, Default)]
struct FilterState {
    filters: Mutex<HashMap<String, broadcast::Sender<Delivery>>>,
    refused_subscriptions: parking_lot::Mutex<HashSet<String>>,
    refused_publishes: parking_lot::Mutex<HashSet<String>>,
    duplicate_deliveries: AtomicBool,
}

/// An in-process publish/subscribe transport.
///
/// Each distinct subscription filter owns a broadcast channel; a publish is
/// fanned out to every filter matching its channel. Clones share state.
#[derive(Clone, Debug, Default)]
pub struct MemoryTransport {
    state: Arc<FilterState>,
}

impl MemoryTransport {
    /// Creates an empty transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subscriptions to exactly `filter` fail.
    pub fn fail_subscribe(&self, filter: impl Into<String>) {
        self.state.refused_subscriptions.lock().insert(filter.into());
    }

    /// Makes publishes to any channel matching `filter` fail.
    pub fn fail_publish(&self, filter: impl Into<String>) {
        self.state.refused_publishes.lock().insert(filter.into());
    }

    /// Clears all injected faults.
    pub fn heal(&self) {
        self.state.refused_subscriptions.lock().clear();
        self.state.refused_publishes.lock().clear();
    }

    /// When enabled, every at-least-once publish is delivered twice.
    pub fn duplicate_deliveries(&self, enabled: bool) {
        self.state
            .duplicate_deliveries
            .store(enabled, Ordering::SeqCst);
    }

    fn publish_refused(&self, channel: &str) -> bool {
        self.state
            .refused_publishes
            .lock()
            .iter()
            .any(|filter| filter_matches(filter, channel))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Error = Error;
    type Subscription = MemorySubscription;

    #[allow(clippy::significant_drop_tightening)]
    async fn subscribe<X>(
        &self,
        filter: &Channel,
        _qos: QoS,
        handler: X,
    ) -> Result<MemorySubscription, Error>
    where
        X: SubscriptionHandler,
    {
        let filter = filter.as_str();
        validate_filter(filter)?;

        if self.state.refused_subscriptions.lock().contains(filter) {
            warn!(filter, "refusing subscription");
            return Err(Error::SubscribeRefused(filter.to_string()));
        }

        // Subscribe before returning so nothing published afterwards is missed.
        let mut receiver = {
            let mut filters = self.state.filters.lock().await;
            filters
                .entry(filter.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };

        let (stop_sender, mut stop_receiver) = watch::channel(());
        let filter_name = filter.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_receiver.changed() => break,
                    delivery = receiver.recv() => match delivery {
                        Ok((channel, payload)) => {
                            if let Err(e) = handler.handle(channel.clone(), payload).await {
                                warn!(%channel, error = %e, "subscription handler failed");
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(filter = %filter_name, skipped, "subscriber lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }

            trace!(filter = %filter_name, "subscription task stopped");
        });

        debug!(filter, "subscribed");

        Ok(MemorySubscription {
            filter: filter.to_string(),
            stop_sender,
        })
    }

    #[allow(clippy::significant_drop_tightening)]
    async fn publish(&self, channel: &Channel, payload: Bytes, qos: QoS) -> Result<(), Error> {
        let channel = channel.as_str();

        if self.publish_refused(channel) {
            warn!(channel, "refusing publish");
            return Err(Error::PublishRefused(channel.to_string()));
        }

        let copies = if qos == QoS::AtLeastOnce
            && self.state.duplicate_deliveries.load(Ordering::SeqCst)
        {
            2
        } else {
            1
        };

        let filters = self.state.filters.lock().await;
        for (filter, sender) in filters.iter() {
            if !filter_matches(filter, channel) {
                continue;
            }

            for _ in 0..copies {
                // No receivers left is not an error for fire-and-forget.
                let _ = sender.send((channel.to_string(), payload.clone()));
            }
        }

        trace!(channel, bytes = payload.len(), "published");
        Ok(())
    }
}

/// A live subscription on a [`MemoryTransport`]. Dropping it unsubscribes.
#[derive(Debug)]
pub struct MemorySubscription {
    filter: String,
    stop_sender: watch::Sender<()>,
}

impl MemorySubscription {
    /// The subscribed filter.
    #[must_use]
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Stops delivery to the handler.
    pub fn unsubscribe(self) {
        // The task also stops when the sender is dropped.
        let _ = self.stop_sender.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use proven_shadow::transport::SubscriptionHandlerError;
    use tokio::sync::mpsc;
    use tokio::time::{Duration, timeout};

    #[derive(Clone, Debug)]
    struct TestSubscriptionHandler {
        sender: mpsc::Sender<Delivery>,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("test handler closed")]
    struct TestSubscriptionHandlerError;

    impl SubscriptionHandlerError for TestSubscriptionHandlerError {}

    #[async_trait]
    impl SubscriptionHandler for TestSubscriptionHandler {
        type Error = TestSubscriptionHandlerError;

        async fn handle(&self, channel: String, payload: Bytes) -> Result<(), Self::Error> {
            self.sender
                .send((channel, payload))
                .await
                .map_err(|_| TestSubscriptionHandlerError)
        }
    }

    fn setup_test_handler() -> (TestSubscriptionHandler, mpsc::Receiver<Delivery>) {
        let (sender, receiver) = mpsc::channel(10);
        (TestSubscriptionHandler { sender }, receiver)
    }

    async fn next(receiver: &mut mpsc::Receiver<Delivery>) -> Delivery {
        timeout(Duration::from_secs(1), receiver.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_filter_matching() {
        assert!(filter_matches("a/b/c", "a/b/c"));
        assert!(filter_matches("a/+/c", "a/b/c"));
        assert!(filter_matches("a/#", "a/b/c"));
        assert!(filter_matches("#", "a"));
        assert!(!filter_matches("a/+", "a/b/c"));
        assert!(!filter_matches("a/b/c", "a/b"));
        assert!(!filter_matches("a/+/d", "a/b/c"));
    }

    #[test]
    fn test_hash_must_be_last() {
        assert_eq!(
            validate_filter("a/#/c"),
            Err(Error::InvalidFilter("a/#/c".to_string()))
        );
        assert!(validate_filter("a/x#").is_err());
        assert!(validate_filter("a/+/#").is_ok());
    }

    #[tokio::test]
    async fn test_publish_reaches_exact_and_wildcard_subscribers() {
        let transport = MemoryTransport::new();
        let (exact, mut exact_rx) = setup_test_handler();
        let (wildcard, mut wildcard_rx) = setup_test_handler();

        let _exact = transport
            .subscribe(&Channel::new("things/lamp/delta"), QoS::AtLeastOnce, exact)
            .await
            .unwrap();
        let _wildcard = transport
            .subscribe(&Channel::new("things/+/delta"), QoS::AtLeastOnce, wildcard)
            .await
            .unwrap();

        transport
            .publish(
                &Channel::new("things/lamp/delta"),
                Bytes::from("message1"),
                QoS::AtLeastOnce,
            )
            .await
            .unwrap();
        transport
            .publish(
                &Channel::new("things/fan/delta"),
                Bytes::from("message2"),
                QoS::AtLeastOnce,
            )
            .await
            .unwrap();

        assert_eq!(
            next(&mut exact_rx).await,
            ("things/lamp/delta".to_string(), Bytes::from("message1"))
        );
        assert_eq!(next(&mut wildcard_rx).await.1, Bytes::from("message1"));
        assert_eq!(
            next(&mut wildcard_rx).await,
            ("things/fan/delta".to_string(), Bytes::from("message2"))
        );
        assert!(
            timeout(Duration::from_millis(50), exact_rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_dropping_subscription_stops_delivery() {
        let transport = MemoryTransport::new();
        let (handler, mut receiver) = setup_test_handler();
        let channel = Channel::new("things/lamp/delta");

        let subscription = transport
            .subscribe(&channel, QoS::AtMostOnce, handler)
            .await
            .unwrap();
        subscription.unsubscribe();

        // Let the subscription task observe the stop signal.
        tokio::task::yield_now().await;
        transport
            .publish(&channel, Bytes::from("late"), QoS::AtMostOnce)
            .await
            .unwrap();

        assert!(matches!(
            timeout(Duration::from_millis(100), receiver.recv()).await,
            Err(_) | Ok(None)
        ));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let transport = MemoryTransport::new();
        let (handler, _receiver) = setup_test_handler();

        transport.fail_subscribe("things/lamp/delta");
        transport.fail_publish("things/+/update");

        assert_eq!(
            transport
                .subscribe(&Channel::new("things/lamp/delta"), QoS::AtLeastOnce, handler)
                .await
                .unwrap_err(),
            Error::SubscribeRefused("things/lamp/delta".to_string())
        );
        assert_eq!(
            transport
                .publish(&Channel::new("things/lamp/update"), Bytes::new(), QoS::AtLeastOnce)
                .await
                .unwrap_err(),
            Error::PublishRefused("things/lamp/update".to_string())
        );

        transport.heal();
        assert!(
            transport
                .publish(&Channel::new("things/lamp/update"), Bytes::new(), QoS::AtLeastOnce)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_duplicate_delivery_only_for_at_least_once() {
        let transport = MemoryTransport::new();
        let (handler, mut receiver) = setup_test_handler();
        let channel = Channel::new("things/lamp/accepted");

        let _subscription = transport
            .subscribe(&channel, QoS::AtLeastOnce, handler)
            .await
            .unwrap();
        transport.duplicate_deliveries(true);

        transport
            .publish(&channel, Bytes::from("once"), QoS::AtMostOnce)
            .await
            .unwrap();
        transport
            .publish(&channel, Bytes::from("twice"), QoS::AtLeastOnce)
            .await
            .unwrap();

        assert_eq!(next(&mut receiver).await.1, Bytes::from("once"));
        assert_eq!(next(&mut receiver).await.1, Bytes::from("twice"));
        assert_eq!(next(&mut receiver).await.1, Bytes::from("twice"));
    }
}
