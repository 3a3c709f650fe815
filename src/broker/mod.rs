//! Embedded MQTT broker
//!
//! Accepts downstream connections over raw TCP and over WebSocket and runs
//! every decision through [`BrokerHooks`]. Subscriptions and the retained
//! table live in the global topic space produced by the subscribe hook;
//! each delivery is passed through the forward hook of its subscriber.
//!
//! Client publishes are handed to the publish hook and are not routed
//! locally. Local delivery only happens through [`LocalBroker::publish`].

mod listener;
mod session;

pub use listener::{Listener, ListenerKind};

use crate::error::{GatewayError, Result};
use crate::mqtt::{Message, Outgoing, Subscription, TopicMatcher};
use crate::qos::QosPolicy;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace, warn};

/// Pending outbound packets per session
const SESSION_QUEUE: usize = 256;

/// A downstream connection as seen by the hooks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// MQTT client identifier
    pub id: String,
    pub remote_addr: SocketAddr,
    pub listener: ListenerKind,
}

/// Decision points of the embedded broker.
///
/// An `Err` from `authenticate`, `authorize_publish` or `authorize_subscribe`
/// drops the connection.
#[async_trait]
pub trait BrokerHooks: Send + Sync {
    /// Gate evaluated before credentials are read
    async fn pre_connect(&self, conn: &ConnectionInfo) -> bool;

    async fn authenticate(
        &self,
        conn: &ConnectionInfo,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> Result<()>;

    /// Accept a client publish, returning the message as accepted
    async fn authorize_publish(&self, conn: &ConnectionInfo, message: Message) -> Result<Message>;

    /// Accept a subscription, `Ok(None)` refuses this filter only
    async fn authorize_subscribe(
        &self,
        conn: &ConnectionInfo,
        sub: Subscription,
    ) -> Result<Option<Subscription>>;

    /// Shape a delivery for one subscriber, `None` suppresses it
    fn authorize_forward(&self, conn: &ConnectionInfo, message: &Message) -> Option<Message>;

    /// A message was accepted; `conn` is `None` for broker-injected messages
    async fn published(&self, _message: &Message, _conn: Option<&ConnectionInfo>) -> Result<()> {
        Ok(())
    }

    async fn subscribed(&self, _subs: &[Subscription], _conn: &ConnectionInfo) {}

    async fn client_disconnect(&self, conn: &ConnectionInfo);

    fn client_error(&self, conn: &ConnectionInfo, error: &GatewayError) {
        debug!(client_id = %conn.id, error = %error, "Client error");
    }
}

#[derive(Debug, Clone)]
struct ActiveSubscription {
    /// Filter as requested by the client
    requested: String,
    /// Filter after the subscribe hook
    filter: String,
    qos: u8,
}

/// Routing handle of a live session
struct SessionHandle {
    key: u64,
    info: Arc<ConnectionInfo>,
    outbound: mpsc::Sender<Outgoing>,
    subscriptions: RwLock<Vec<ActiveSubscription>>,
    /// Signalled when a QoS 1 delivery could not be queued
    evict: Arc<Notify>,
}

impl SessionHandle {
    fn matching_qos(&self, matcher: &TopicMatcher, topic: &str) -> Option<u8> {
        self.subscriptions
            .read()
            .iter()
            .filter(|s| matcher.matches(topic, &s.filter))
            .map(|s| s.qos)
            .max()
    }

    /// Queue a delivery. A QoS 0 message that does not fit is dropped, a
    /// QoS 1 message that does not fit evicts the session.
    fn deliver(&self, message: Message) {
        let qos = message.qos;
        let Err(e) = self.outbound.try_send(Outgoing::Publish {
            message,
            packet_id: None,
        }) else {
            return;
        };

        if qos > 0 {
            warn!(client_id = %self.info.id, error = %e, "Outbound queue full, evicting session");
            self.evict.notify_one();
        } else {
            warn!(client_id = %self.info.id, error = %e, "Dropping delivery");
        }
    }
}

/// Receiving side of a registered session
struct Registration {
    key: u64,
    outbound: mpsc::Receiver<Outgoing>,
    evict: Arc<Notify>,
}

/// Embedded broker core shared by all listeners
pub struct LocalBroker {
    hooks: RwLock<Option<Arc<dyn BrokerHooks>>>,
    sessions: DashMap<String, SessionHandle>,
    retained: RwLock<HashMap<String, Message>>,
    matcher: TopicMatcher,
    qos: QosPolicy,
    max_packet_size: usize,
    next_key: AtomicU64,
}

impl LocalBroker {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            hooks: RwLock::new(None),
            sessions: DashMap::new(),
            retained: RwLock::new(HashMap::new()),
            matcher: TopicMatcher::new(),
            qos: QosPolicy::default(),
            max_packet_size,
            next_key: AtomicU64::new(1),
        }
    }

    /// Install the decision hooks. Without hooks every connection is refused.
    pub fn set_hooks(&self, hooks: Arc<dyn BrokerHooks>) {
        *self.hooks.write() = Some(hooks);
    }

    pub fn clear_hooks(&self) {
        *self.hooks.write() = None;
    }

    pub fn has_hooks(&self) -> bool {
        self.hooks.read().is_some()
    }

    fn hooks(&self) -> Option<Arc<dyn BrokerHooks>> {
        self.hooks.read().clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn retained_count(&self) -> usize {
        self.retained.read().len()
    }

    /// Drop every retained message
    pub fn clear_retained(&self) {
        let mut retained = self.retained.write();
        debug!(count = retained.len(), "Clearing retained messages");
        retained.clear();
    }

    /// Inject a message as the broker itself
    pub async fn publish(&self, message: Message) {
        if message.retain {
            let mut retained = self.retained.write();
            if message.payload.is_empty() {
                retained.remove(&message.topic);
            } else {
                retained.insert(message.topic.clone(), message.clone());
            }
        }

        self.route(&message);

        if let Some(hooks) = self.hooks() {
            if let Err(e) = hooks.published(&message, None).await {
                warn!(topic = %message.topic, error = %e, "Published hook failed");
            }
        }
    }

    /// Deliver a message to every matching session through the forward hook
    fn route(&self, message: &Message) {
        let Some(hooks) = self.hooks() else {
            return;
        };

        for session in self.sessions.iter() {
            let Some(granted) = session.matching_qos(&self.matcher, &message.topic) else {
                continue;
            };
            let Some(mut forwarded) = hooks.authorize_forward(&session.info, message) else {
                trace!(client_id = %session.info.id, topic = %message.topic, "Forward suppressed");
                continue;
            };

            forwarded.qos = self.qos.delivery_qos(message.qos, granted);
            forwarded.retain = false;
            session.deliver(forwarded);
        }
    }

    /// Register an authenticated session, replacing any session with the
    /// same client id
    fn register(&self, info: Arc<ConnectionInfo>) -> Registration {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let (outbound, outbound_rx) = mpsc::channel(SESSION_QUEUE);
        let evict = Arc::new(Notify::new());

        let previous = self.sessions.insert(
            info.id.clone(),
            SessionHandle {
                key,
                info,
                outbound,
                subscriptions: RwLock::new(Vec::new()),
                evict: evict.clone(),
            },
        );
        if let Some(previous) = previous {
            debug!(client_id = %previous.info.id, "Session taken over");
        }

        Registration {
            key,
            outbound: outbound_rx,
            evict,
        }
    }

    fn unregister(&self, id: &str, key: u64) {
        self.sessions.remove_if(id, |_, session| session.key == key);
    }

    /// Record accepted subscriptions and replay matching retained messages
    fn add_subscriptions(&self, id: &str, accepted: &[(String, Subscription)]) {
        let Some(session) = self.sessions.get(id) else {
            return;
        };

        {
            let mut subscriptions = session.subscriptions.write();
            for (requested, sub) in accepted {
                subscriptions.retain(|s| s.requested != *requested);
                subscriptions.push(ActiveSubscription {
                    requested: requested.clone(),
                    filter: sub.topic_filter.clone(),
                    qos: sub.qos,
                });
            }
        }

        let Some(hooks) = self.hooks() else {
            return;
        };
        let retained: Vec<Message> = self.retained.read().values().cloned().collect();

        for message in retained {
            let Some(granted) = accepted
                .iter()
                .filter(|(_, sub)| self.matcher.matches(&message.topic, &sub.topic_filter))
                .map(|(_, sub)| sub.qos)
                .max()
            else {
                continue;
            };

            if let Some(mut forwarded) = hooks.authorize_forward(&session.info, &message) {
                forwarded.qos = self.qos.delivery_qos(message.qos, granted);
                forwarded.retain = true;
                session.deliver(forwarded);
            }
        }
    }

    fn remove_subscriptions(&self, id: &str, requested: &[String]) {
        if let Some(session) = self.sessions.get(id) {
            session
                .subscriptions
                .write()
                .retain(|s| !requested.contains(&s.requested));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    /// Prefixes subscriptions with `g/` and strips it on forward
    struct PrefixHooks;

    #[async_trait]
    impl BrokerHooks for PrefixHooks {
        async fn pre_connect(&self, _conn: &ConnectionInfo) -> bool {
            true
        }

        async fn authenticate(
            &self,
            _conn: &ConnectionInfo,
            _username: Option<&str>,
            _password: Option<&[u8]>,
        ) -> Result<()> {
            Ok(())
        }

        async fn authorize_publish(&self, _conn: &ConnectionInfo, message: Message) -> Result<Message> {
            Ok(message)
        }

        async fn authorize_subscribe(
            &self,
            _conn: &ConnectionInfo,
            sub: Subscription,
        ) -> Result<Option<Subscription>> {
            Ok(Some(Subscription::new(format!("g/{}", sub.topic_filter), sub.qos)))
        }

        fn authorize_forward(&self, _conn: &ConnectionInfo, message: &Message) -> Option<Message> {
            let topic = message.topic.strip_prefix("g/")?;
            (topic != "hidden").then(|| message.with_topic(topic))
        }

        async fn client_disconnect(&self, _conn: &ConnectionInfo) {}
    }

    fn info(id: &str) -> Arc<ConnectionInfo> {
        Arc::new(ConnectionInfo {
            id: id.to_string(),
            remote_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000),
            listener: ListenerKind::Tcp,
        })
    }

    fn broker() -> LocalBroker {
        let broker = LocalBroker::new(1024);
        broker.set_hooks(Arc::new(PrefixHooks));
        broker
    }

    fn subscribe(broker: &LocalBroker, id: &str, filter: &str, qos: u8) {
        broker.add_subscriptions(
            id,
            &[(filter.to_string(), Subscription::new(format!("g/{filter}"), qos))],
        );
    }

    fn next_publish(rx: &mut mpsc::Receiver<Outgoing>) -> Option<Message> {
        match rx.try_recv().ok()? {
            Outgoing::Publish { message, .. } => Some(message),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_route_through_forward_hook() {
        let broker = broker();
        let mut a = broker.register(info("a")).outbound;
        let mut b = broker.register(info("b")).outbound;
        subscribe(&broker, "a", "sensors/#", 1);
        subscribe(&broker, "b", "other", 0);

        broker.publish(Message::new("g/sensors/t1", "21").with_qos(1)).await;

        let delivered = next_publish(&mut a).unwrap();
        assert_eq!(delivered.topic, "sensors/t1");
        assert_eq!(delivered.qos, 1);
        assert!(!delivered.retain);
        assert!(next_publish(&mut b).is_none());

        // forward hook suppression only affects that delivery
        subscribe(&broker, "b", "hidden", 0);
        broker.publish(Message::new("g/hidden", "x")).await;
        assert!(next_publish(&mut b).is_none());
    }

    #[tokio::test]
    async fn test_retained_replay_and_delete() {
        let broker = broker();
        broker.publish(Message::new("g/d/s", "true").with_retain(true)).await;
        broker.publish(Message::new("g/d/k", "x").with_retain(true)).await;
        assert_eq!(broker.retained_count(), 2);

        let mut rx = broker.register(info("a")).outbound;
        subscribe(&broker, "a", "d/s", 0);

        let replayed = next_publish(&mut rx).unwrap();
        assert_eq!(replayed.topic, "d/s");
        assert!(replayed.retain);
        assert!(next_publish(&mut rx).is_none());

        // empty payload deletes
        broker.publish(Message::new("g/d/k", "").with_retain(true)).await;
        assert_eq!(broker.retained_count(), 1);

        broker.clear_retained();
        assert_eq!(broker.retained_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_by_requested_filter() {
        let broker = broker();
        let mut rx = broker.register(info("a")).outbound;
        subscribe(&broker, "a", "d/#", 0);

        broker.remove_subscriptions("a", &["d/#".to_string()]);
        broker.publish(Message::new("g/d/s", "true")).await;
        assert!(next_publish(&mut rx).is_none());
    }

    #[tokio::test]
    async fn test_takeover_keeps_newest_session() {
        let broker = broker();
        let old = broker.register(info("a"));
        let mut new = broker.register(info("a")).outbound;
        assert_eq!(broker.session_count(), 1);

        // stale cleanup must not remove the new session
        broker.unregister("a", old.key);
        assert_eq!(broker.session_count(), 1);

        subscribe(&broker, "a", "x", 0);
        broker.publish(Message::new("g/x", "1")).await;
        assert!(next_publish(&mut new).is_some());
    }

    #[tokio::test]
    async fn test_no_hooks_no_routing() {
        let broker = LocalBroker::new(1024);
        assert!(!broker.has_hooks());
        let mut rx = broker.register(info("a")).outbound;
        subscribe(&broker, "a", "x", 0);

        broker.publish(Message::new("g/x", "1")).await;
        assert!(next_publish(&mut rx).is_none());
    }

    #[tokio::test]
    async fn test_full_queue_evicts_on_qos1_only() {
        let broker = broker();
        let at_most_once = broker.register(info("a"));
        let at_least_once = broker.register(info("b"));
        subscribe(&broker, "a", "x", 0);
        subscribe(&broker, "b", "y", 1);

        for _ in 0..=SESSION_QUEUE {
            broker.publish(Message::new("g/x", "1")).await;
            broker.publish(Message::new("g/y", "1").with_qos(1)).await;
        }
        assert_eq!(at_most_once.outbound.len(), SESSION_QUEUE);
        assert_eq!(at_least_once.outbound.len(), SESSION_QUEUE);

        let wait = std::time::Duration::from_millis(20);
        assert!(tokio::time::timeout(wait, at_most_once.evict.notified())
            .await
            .is_err());
        assert!(tokio::time::timeout(wait, at_least_once.evict.notified())
            .await
            .is_ok());
    }
}
