//! Proxy orchestrator
//!
//! Owns the embedded broker, its listeners and the upstream transport, and
//! bridges them: everything the upstream delivers is injected into the local
//! broker, everything a client is allowed to publish goes upstream.

mod hooks;

pub use hooks::ProxyHooks;

use crate::auth::{Authenticator, Directory};
use crate::broker::{Listener, ListenerKind, LocalBroker};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::transport::{BridgeEvent, UpstreamTransport};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Topic filter subscribed upstream for the whole process
const WILDCARD_ALL: &str = "#";

/// Lifecycle of the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Uninitialized,
    Initializing,
    Initialized,
    Destroying,
}

/// Multi-tenant MQTT proxy
pub struct MqttProxy {
    state: Mutex<ProxyState>,
    broker: Arc<LocalBroker>,
    hooks: Arc<ProxyHooks>,
    transport: Arc<dyn UpstreamTransport>,
    listeners: Arc<Vec<Listener>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    log_packets: bool,
}

impl MqttProxy {
    pub fn new(
        config: &GatewayConfig,
        transport: Arc<dyn UpstreamTransport>,
        directory: Arc<dyn Directory>,
    ) -> Self {
        let authenticator =
            Authenticator::new(directory, config.devices.max_additional_relays_number);
        let hooks = Arc::new(ProxyHooks::new(
            transport.clone(),
            authenticator,
            config.general.log_packets,
        ));

        let listeners: Vec<Listener> = [
            (ListenerKind::Tcp, config.listener.tcp_addr()),
            (ListenerKind::WebSocket, config.listener.ws_addr()),
        ]
        .into_iter()
        .filter_map(|(kind, addr)| addr.map(|addr| Listener::new(kind, addr)))
        .collect();

        Self {
            state: Mutex::new(ProxyState::Uninitialized),
            broker: Arc::new(LocalBroker::new(config.listener.max_packet_size)),
            hooks,
            transport,
            listeners: Arc::new(listeners),
            pump: Mutex::new(None),
            log_packets: config.general.log_packets,
        }
    }

    pub fn state(&self) -> ProxyState {
        *self.state.lock()
    }

    pub fn broker(&self) -> &Arc<LocalBroker> {
        &self.broker
    }

    pub fn hooks(&self) -> &Arc<ProxyHooks> {
        &self.hooks
    }

    /// Bound address of a listener, `None` when disabled or stopped
    pub async fn listener_addr(&self, kind: ListenerKind) -> Option<SocketAddr> {
        match self.listeners.iter().find(|l| l.kind() == kind) {
            Some(listener) => listener.local_addr().await,
            None => None,
        }
    }

    /// Open downstream sockets across all listeners
    pub fn connection_count(&self) -> usize {
        self.listeners.iter().map(|l| l.connection_count()).sum()
    }

    /// Start listeners, connect upstream and subscribe to everything.
    ///
    /// No-op when already initializing or initialized.
    pub async fn init(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ProxyState::Destroying => return Err(GatewayError::DestroyInProgress),
                ProxyState::Initializing | ProxyState::Initialized => return Ok(()),
                ProxyState::Uninitialized => *state = ProxyState::Initializing,
            }
        }

        info!("Initializing");
        match self.start().await {
            Ok(()) => {
                *self.state.lock() = ProxyState::Initialized;
                info!("Initialized");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Initialization failed");
                self.teardown().await;
                *self.state.lock() = ProxyState::Uninitialized;
                Err(e)
            }
        }
    }

    /// Close the upstream session, stop listeners and unwire hooks.
    ///
    /// No-op when not initialized or already destroying.
    pub async fn destroy(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ProxyState::Initializing => return Err(GatewayError::InitInProgress),
                ProxyState::Uninitialized | ProxyState::Destroying => return Ok(()),
                ProxyState::Initialized => *state = ProxyState::Destroying,
            }
        }

        info!("Destroying");
        if let Err(e) = self.transport.unsubscribe(&[WILDCARD_ALL.to_string()]).await {
            warn!(error = %e, "Failed to unsubscribe upstream");
        }
        if let Err(e) = self.transport.end(false).await {
            warn!(error = %e, "Failed to end upstream session");
        }
        self.teardown().await;

        *self.state.lock() = ProxyState::Uninitialized;
        info!("Destroyed");
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.broker.set_hooks(self.hooks.clone());

        // before connecting, so the first Connect event is seen
        let events = self.transport.bridge();
        let pump = tokio::spawn(pump(
            events,
            self.broker.clone(),
            self.listeners.clone(),
            self.log_packets,
        ));
        if let Some(previous) = self.pump.lock().replace(pump) {
            previous.abort();
        }

        for listener in self.listeners.iter() {
            ensure_started(listener, &self.broker).await?;
        }

        self.transport.connect().await?;
        self.transport.subscribe(&[WILDCARD_ALL.to_string()]).await?;
        Ok(())
    }

    async fn teardown(&self) {
        for listener in self.listeners.iter() {
            if let Err(e) = listener.stop().await {
                debug!(listener = listener.kind().as_str(), error = %e, "Listener not stopped");
            }
        }

        self.broker.clear_hooks();

        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

/// Start a listener unless it is already running
async fn ensure_started(listener: &Listener, broker: &Arc<LocalBroker>) -> Result<()> {
    match listener.start(broker.clone()).await {
        Ok(_) | Err(GatewayError::AlreadyStarted(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Bridge upstream events into the embedded broker
async fn pump(
    mut events: mpsc::Receiver<BridgeEvent>,
    broker: Arc<LocalBroker>,
    listeners: Arc<Vec<Listener>>,
    log_packets: bool,
) {
    while let Some(event) = events.recv().await {
        match event {
            BridgeEvent::Connect => {
                info!("Upstream connected");
                broker.clear_retained();
                for listener in listeners.iter() {
                    if let Err(e) = ensure_started(listener, &broker).await {
                        error!(listener = listener.kind().as_str(), error = %e, "Failed to restart listener");
                    }
                }
            }
            BridgeEvent::Offline => {
                let closed: usize = listeners.iter().map(|l| l.force_close_all()).sum();
                warn!(closed, "Upstream offline, dropped downstream connections");
            }
            BridgeEvent::Message(message) => {
                if log_packets {
                    trace!(topic = %message.topic, retain = message.retain, "Received from upstream");
                }
                broker.publish(message).await;
            }
        }
    }
    debug!("Upstream bridge closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{DirectoryData, FileDirectory, ReaderEntry, TenantEntry};
    use crate::broker::{BrokerHooks, ConnectionInfo};
    use crate::mqtt::Message;
    use crate::transport::{Bridge, PublishOptions, TransportEvent};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::broadcast;

    struct MockTransport {
        connected: AtomicBool,
        connects: AtomicUsize,
        events: broadcast::Sender<TransportEvent>,
        bridge: Bridge,
        published: parking_lot::Mutex<Vec<(String, Bytes, PublishOptions)>>,
        subscribed: parking_lot::Mutex<Vec<String>>,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            let (events, _) = broadcast::channel(64);
            Arc::new(Self {
                connected: AtomicBool::new(false),
                connects: AtomicUsize::new(0),
                events,
                bridge: Bridge::default(),
                published: parking_lot::Mutex::new(Vec::new()),
                subscribed: parking_lot::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl UpstreamTransport for MockTransport {
        async fn connect(&self) -> Result<()> {
            if !self.connected.swap(true, Ordering::SeqCst) {
                self.connects.fetch_add(1, Ordering::SeqCst);
                let _ = self.events.send(TransportEvent::Connect);
                self.bridge.send(BridgeEvent::Connect).await;
            }
            Ok(())
        }

        async fn publish(&self, topic: &str, payload: Bytes, options: PublishOptions) -> Result<()> {
            if !self.is_connected() {
                return Err(GatewayError::TransportOffline);
            }
            self.published
                .lock()
                .push((topic.to_string(), payload, options));
            Ok(())
        }

        async fn subscribe(&self, topics: &[String]) -> Result<()> {
            self.subscribed.lock().extend(topics.iter().cloned());
            Ok(())
        }

        async fn unsubscribe(&self, topics: &[String]) -> Result<()> {
            self.subscribed.lock().retain(|t| !topics.contains(t));
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn end(&self, _force: bool) -> Result<()> {
            self.connected.store(false, Ordering::SeqCst);
            let _ = self.events.send(TransportEvent::End);
            Ok(())
        }

        fn events(&self) -> broadcast::Receiver<TransportEvent> {
            self.events.subscribe()
        }

        fn bridge(&self) -> mpsc::Receiver<BridgeEvent> {
            self.bridge.attach()
        }
    }

    fn directory() -> Arc<FileDirectory> {
        Arc::new(FileDirectory::from_data(DirectoryData {
            tenants: vec![TenantEntry {
                id: "t1".to_string(),
                login: "acme".to_string(),
                mqtt_token: "admin-secret".to_string(),
                access_token: "reader-secret".to_string(),
            }],
            readers: vec![ReaderEntry {
                id: "r1".to_string(),
                tenant: "t1".to_string(),
                code: "front".to_string(),
                enabled: true,
                archived: false,
            }],
            ..Default::default()
        }))
    }

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.listener.bind_ip = "127.0.0.1".parse().unwrap();
        config.listener.port = Some(0);
        config
    }

    fn conn(id: &str) -> ConnectionInfo {
        ConnectionInfo {
            id: id.to_string(),
            remote_addr: "127.0.0.1:50000".parse().unwrap(),
            listener: ListenerKind::Tcp,
        }
    }

    #[tokio::test]
    async fn test_destroy_before_init_is_noop() {
        let proxy = MqttProxy::new(&config(), MockTransport::new(), directory());
        proxy.destroy().await.unwrap();
        assert_eq!(proxy.state(), ProxyState::Uninitialized);
    }

    #[tokio::test]
    async fn test_lifecycle_conflicts() {
        let proxy = MqttProxy::new(&config(), MockTransport::new(), directory());

        *proxy.state.lock() = ProxyState::Destroying;
        assert!(matches!(
            proxy.init().await,
            Err(GatewayError::DestroyInProgress)
        ));

        *proxy.state.lock() = ProxyState::Initializing;
        assert!(matches!(
            proxy.destroy().await,
            Err(GatewayError::InitInProgress)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_init_binds_once() {
        let transport = MockTransport::new();
        let proxy = MqttProxy::new(&config(), transport.clone(), directory());

        let (a, b) = tokio::join!(proxy.init(), proxy.init());
        a.unwrap();
        b.unwrap();

        assert_eq!(proxy.state(), ProxyState::Initialized);
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
        assert_eq!(*transport.subscribed.lock(), vec!["#".to_string()]);
        assert!(proxy.listener_addr(ListenerKind::Tcp).await.is_some());
        assert!(proxy.listener_addr(ListenerKind::WebSocket).await.is_none());

        proxy.destroy().await.unwrap();
        assert_eq!(proxy.state(), ProxyState::Uninitialized);
        assert!(transport.subscribed.lock().is_empty());
        assert!(!transport.is_connected());
        assert!(proxy.listener_addr(ListenerKind::Tcp).await.is_none());
        assert!(!proxy.broker().has_hooks());
    }

    #[tokio::test]
    async fn test_pre_connect_follows_transport() {
        let transport = MockTransport::new();
        let proxy = MqttProxy::new(&config(), transport.clone(), directory());
        let hooks = proxy.hooks();

        assert!(!hooks.pre_connect(&conn("a")).await);
        transport.connect().await.unwrap();
        assert!(hooks.pre_connect(&conn("a")).await);
    }

    #[tokio::test]
    async fn test_authenticate_registers_once() {
        let proxy = MqttProxy::new(&config(), MockTransport::new(), directory());
        let hooks = proxy.hooks();

        hooks
            .authenticate(&conn("a"), Some("client/acme"), Some(&b"admin-secret"[..]))
            .await
            .unwrap();
        assert_eq!(hooks.identity("a").map(|i| i.kind()), Some("admin"));

        assert!(matches!(
            hooks
                .authenticate(&conn("a"), Some("client/acme"), Some(&b"admin-secret"[..]))
                .await,
            Err(GatewayError::Config(_))
        ));
        assert_eq!(hooks.identity_count(), 1);

        assert!(matches!(
            hooks
                .authenticate(&conn("b"), Some("client/acme"), Some(&b"wrong"[..]))
                .await,
            Err(GatewayError::BadCredentials)
        ));

        hooks.client_disconnect(&conn("a")).await;
        assert_eq!(hooks.identity_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_forwards_rewritten_topic() {
        let transport = MockTransport::new();
        transport.connect().await.unwrap();
        let proxy = MqttProxy::new(&config(), transport.clone(), directory());
        let hooks = proxy.hooks();

        let root = crate::auth::root_topic_hash("acme");
        let username = crate::auth::reader_mqtt_username(&root, "front");
        hooks
            .authenticate(&conn("r"), Some(username.as_str()), Some(&b"reader-secret"[..]))
            .await
            .unwrap();

        let accepted = hooks
            .authorize_publish(
                &conn("r"),
                Message::new("sweet-home/front/d/s", "true").with_retain(true),
            )
            .await
            .unwrap();
        assert_eq!(accepted.topic, format!("{root}/sweet-home/front/d/s"));

        let published = transport.published.lock().clone();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, accepted.topic);
        assert_eq!(published[0].1.as_ref(), b"true");
        assert_eq!(published[0].2.retain, Some(true));

        // outside the reader's subtree
        assert!(hooks
            .authorize_publish(&conn("r"), Message::new("sweet-home/back/d/s", "true"))
            .await
            .is_err());
        // unknown connection
        assert!(hooks
            .authorize_publish(&conn("x"), Message::new("sweet-home/front/d/s", "true"))
            .await
            .is_err());
        // upstream failure refuses the publish
        transport.connected.store(false, Ordering::SeqCst);
        assert!(matches!(
            hooks
                .authorize_publish(&conn("r"), Message::new("sweet-home/front/d/s", "true").with_qos(1))
                .await,
            Err(GatewayError::TransportOffline)
        ));
        assert_eq!(transport.published.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_forward_system_topics_unchanged() {
        let proxy = MqttProxy::new(&config(), MockTransport::new(), directory());
        let hooks = proxy.hooks();
        let message = Message::new("$SYS/broker/uptime", "42");

        // no identity needed
        assert_eq!(hooks.authorize_forward(&conn("x"), &message), Some(message.clone()));
        assert!(hooks
            .authorize_forward(&conn("x"), &Message::new("a/b", "1"))
            .is_none());
    }

    #[tokio::test]
    async fn test_connect_event_clears_retained() {
        let transport = MockTransport::new();
        let proxy = MqttProxy::new(&config(), transport.clone(), directory());
        proxy.init().await.unwrap();

        transport
            .bridge
            .send(BridgeEvent::Message(
                Message::new("x/y", "1").with_retain(true),
            ))
            .await;
        for _ in 0..100 {
            if proxy.broker().retained_count() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(proxy.broker().retained_count(), 1);

        transport.bridge.send(BridgeEvent::Connect).await;
        for _ in 0..100 {
            if proxy.broker().retained_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(proxy.broker().retained_count(), 0);

        proxy.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_pump_keeps_every_upstream_message() {
        let transport = MockTransport::new();
        let proxy = MqttProxy::new(&config(), transport.clone(), directory());
        proxy.init().await.unwrap();

        // far beyond any queue capacity
        for i in 0..5000 {
            transport
                .bridge
                .send(BridgeEvent::Message(
                    Message::new(format!("burst/{i}"), "1").with_retain(true),
                ))
                .await;
        }
        for _ in 0..1000 {
            if proxy.broker().retained_count() == 5000 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(proxy.broker().retained_count(), 5000);

        proxy.destroy().await.unwrap();
    }
}
