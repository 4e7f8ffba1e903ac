//! Receive-only subscription socket

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::warn;

use crate::endpoint::{EndpointId, EndpointState, RECONNECT_DELAY};
use crate::socket::{EndpointRegistry, Inbound, SendError, SocketBase, SocketPolicy};
use crate::transport::Connector;

/// Control frame prefix announcing a subscription
const SUBSCRIBE_PREFIX: char = '1';
/// Control frame prefix withdrawing a subscription
const UNSUBSCRIBE_PREFIX: char = '0';

/// Subscription bookkeeping behind a [`Subscriber`].
///
/// Topics are held in subscription order and replayed to every endpoint that
/// activates, so a subscription survives reconnects.
pub(crate) struct SubscriberPolicy {
    subscriptions: Vec<String>,
    attached: Vec<EndpointId>,
}

impl SubscriberPolicy {
    fn new() -> Self {
        Self {
            subscriptions: Vec::new(),
            attached: Vec::new(),
        }
    }

    fn control_frame(prefix: char, topic: &str) -> String {
        let mut frame = String::with_capacity(topic.len() + 1);
        frame.push(prefix);
        frame.push_str(topic);
        frame
    }

    fn announce(
        &self,
        prefix: char,
        topic: &str,
        registry: &mut EndpointRegistry,
    ) {
        let frame = Self::control_frame(prefix, topic);
        for id in &self.attached {
            if let Err(e) = registry.write(*id, &frame, false) {
                warn!(endpoint = %id, topic = %topic, error = %e, "Subscription frame not sent");
            }
        }
    }

    /// Record a topic and announce it to every attached endpoint.
    /// Idempotent: a topic already held is neither stored nor re-sent.
    fn subscribe(&mut self, topic: &str, registry: &mut EndpointRegistry) -> bool {
        if self.subscriptions.iter().any(|t| t == topic) {
            return false;
        }
        self.subscriptions.push(topic.to_string());
        self.announce(SUBSCRIBE_PREFIX, topic, registry);
        true
    }

    /// Drop a topic and withdraw it from every attached endpoint
    fn unsubscribe(&mut self, topic: &str, registry: &mut EndpointRegistry) -> bool {
        let Some(index) = self.subscriptions.iter().position(|t| t == topic) else {
            return false;
        };
        self.subscriptions.remove(index);
        self.announce(UNSUBSCRIBE_PREFIX, topic, registry);
        true
    }
}

impl SocketPolicy for SubscriberPolicy {
    fn attach(&mut self, id: EndpointId, registry: &mut EndpointRegistry) -> bool {
        // Replay held subscriptions to the new endpoint, in subscription
        // order, before any other traffic reaches it
        for topic in &self.subscriptions {
            let frame = Self::control_frame(SUBSCRIBE_PREFIX, topic);
            if let Err(e) = registry.write(id, &frame, false) {
                warn!(endpoint = %id, topic = %topic, error = %e, "Subscription replay failed");
            }
        }
        self.attached.push(id);
        false
    }

    fn detach(&mut self, id: EndpointId) {
        self.attached.retain(|e| *e != id);
    }

    fn send(
        &mut self,
        _frame: &str,
        _more: bool,
        _registry: &mut EndpointRegistry,
    ) -> Result<(), SendError> {
        Err(SendError::Unsupported)
    }

    fn has_out(&self) -> bool {
        false
    }
}

/// Receive-only socket holding topic subscriptions.
///
/// There is no public send; subscriptions are the only outbound traffic, and
/// they are replayed whenever an endpoint (re)activates. Cloning shares the
/// socket.
#[derive(Clone)]
pub struct Subscriber {
    base: SocketBase<SubscriberPolicy>,
}

impl Subscriber {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_reconnect_delay(connector, RECONNECT_DELAY)
    }

    pub fn with_reconnect_delay(connector: Arc<dyn Connector>, delay: Duration) -> Self {
        Self {
            base: SocketBase::new(connector, SubscriberPolicy::new(), delay),
        }
    }

    /// Open one endpoint to `address`; it reconnects on loss until
    /// [`Subscriber::disconnect`] or [`Subscriber::close`]
    pub fn connect(&self, address: &str) -> EndpointId {
        self.base.connect(address)
    }

    /// Close every endpoint opened for `address`, cancelling reconnects
    pub fn disconnect(&self, address: &str) -> usize {
        self.base.disconnect(address)
    }

    /// Tear down all endpoints and end the inbound stream
    pub fn close(&self) {
        self.base.close();
    }

    /// The stream of inbound messages; single consumer
    pub fn incoming(&self) -> Option<mpsc::UnboundedReceiver<Inbound>> {
        self.base.incoming()
    }

    /// Record a topic and announce it to every attached endpoint; returns
    /// false when the topic was already held
    pub fn subscribe(&self, topic: &str) -> bool {
        self.base.with_policy(|policy, registry| policy.subscribe(topic, registry))
    }

    /// Drop a topic and withdraw it from every attached endpoint; returns
    /// false when the topic was not held
    pub fn unsubscribe(&self, topic: &str) -> bool {
        self.base
            .with_policy(|policy, registry| policy.unsubscribe(topic, registry))
    }

    /// Currently held topics, in subscription order
    pub fn subscriptions(&self) -> Vec<String> {
        self.base
            .with_policy(|policy, _| policy.subscriptions.clone())
    }

    pub fn state(&self) -> EndpointState {
        self.base.state()
    }

    pub fn active_endpoints(&self) -> usize {
        self.base.active_endpoints()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockConnector;
    use tokio::time::{advance, sleep, Duration};

    async fn wait_active(subscriber: &Subscriber, count: usize) {
        while subscriber.active_endpoints() < count {
            sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscriptions_replayed_on_attach_in_order() {
        let (connector, mut accepted) = MockConnector::new();
        let subscriber = Subscriber::new(Arc::new(connector));
        assert!(subscriber.subscribe("a"));
        assert!(subscriber.subscribe("b"));

        subscriber.connect("mock://bridge");
        let mut remote = accepted.recv().await.unwrap();
        wait_active(&subscriber, 1).await;

        // Subscribe frames for "a" then "b" arrive before anything else
        assert_eq!(remote.sent().await.unwrap(), "01a");
        assert_eq!(remote.sent().await.unwrap(), "01b");
        assert_eq!(remote.try_sent(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_announced_to_attached_endpoints() {
        let (connector, mut accepted) = MockConnector::new();
        let subscriber = Subscriber::new(Arc::new(connector));
        subscriber.connect("mock://bridge");
        let mut remote = accepted.recv().await.unwrap();
        wait_active(&subscriber, 1).await;

        assert!(subscriber.subscribe("motion"));
        assert_eq!(remote.sent().await.unwrap(), "01motion");

        assert!(subscriber.unsubscribe("motion"));
        assert_eq!(remote.sent().await.unwrap(), "00motion");
        assert!(subscriber.subscriptions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_subscribe_is_idempotent() {
        let (connector, mut accepted) = MockConnector::new();
        let subscriber = Subscriber::new(Arc::new(connector));
        subscriber.connect("mock://bridge");
        let mut remote = accepted.recv().await.unwrap();
        wait_active(&subscriber, 1).await;

        assert!(subscriber.subscribe("log"));
        assert!(!subscriber.subscribe("log"));
        assert_eq!(remote.sent().await.unwrap(), "01log");
        assert_eq!(remote.try_sent(), None);
        assert_eq!(subscriber.subscriptions(), vec!["log"]);

        assert!(!subscriber.unsubscribe("absent"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_survives_reconnect() {
        let (connector, mut accepted) = MockConnector::new();
        let subscriber = Subscriber::new(Arc::new(connector));
        subscriber.subscribe("status");
        subscriber.connect("mock://bridge");

        let mut remote = accepted.recv().await.unwrap();
        wait_active(&subscriber, 1).await;
        assert_eq!(remote.sent().await.unwrap(), "01status");

        remote.hang_up();
        advance(RECONNECT_DELAY).await;

        let mut remote = accepted.recv().await.unwrap();
        assert_eq!(remote.sent().await.unwrap(), "01status");
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_messages_delivered() {
        let (connector, mut accepted) = MockConnector::new();
        let subscriber = Subscriber::new(Arc::new(connector));
        let mut incoming = subscriber.incoming().unwrap();
        subscriber.connect("mock://bridge");

        let remote = accepted.recv().await.unwrap();
        wait_active(&subscriber, 1).await;

        // Topic frame followed by the payload frame
        remote.push("1status");
        remote.push("0{\"type\":297}");
        let inbound = incoming.recv().await.unwrap();
        assert_eq!(inbound.message.frames, vec!["status", "{\"type\":297}"]);
        assert_eq!(inbound.message.payload(), Some("{\"type\":297}"));
    }
}
