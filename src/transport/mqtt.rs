//! rumqttc-backed upstream session

use super::{
    apply_root, strip_root, Bridge, BridgeEvent, PublishOptions, TransportEvent, UpstreamTransport,
};
use crate::config::UpstreamConfig;
use crate::error::{GatewayError, Result};
use crate::mqtt::Message;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeFilter,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 1024;

/// Upper bound for a graceful DISCONNECT before the session is dropped
const GRACEFUL_END_TIMEOUT: Duration = Duration::from_secs(5);

/// Session state as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}

struct Shared {
    uri: String,
    root_topic: Option<String>,
    state: watch::Sender<LinkState>,
    /// Set on CONNACK, cleared on the close edge
    connected: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
    bridge: Bridge,
    /// Active filters with the root applied, restored on every fresh session
    filters: Mutex<Vec<String>>,
    packet_events: AtomicBool,
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    fn packet_event(&self, event: impl FnOnce() -> TransportEvent) {
        if self.packet_events.load(Ordering::Relaxed) {
            self.emit(event());
        }
    }

    async fn on_connack(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.state.send_if_modified(|s| {
            let changed = *s == LinkState::Connecting;
            if changed {
                *s = LinkState::Connected;
            }
            changed
        });
        info!(uri = %self.uri, "Connected to upstream broker");
        self.emit(TransportEvent::Connect);
        self.bridge.send(BridgeEvent::Connect).await;
    }

    /// Re-send the active filters, the broker forgot them with the session
    fn restore_subscriptions(&self, client: &AsyncClient) {
        let filters = self.filters.lock().clone();
        if filters.is_empty() {
            return;
        }
        info!(uri = %self.uri, count = filters.len(), "Restoring upstream subscriptions");

        let client = client.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let request = filters
                .into_iter()
                .map(|filter| SubscribeFilter::new(filter, QoS::AtMostOnce));
            if let Err(e) = client.subscribe_many(request).await {
                warn!(error = %e, "Failed to restore upstream subscriptions");
                let _ = events.send(TransportEvent::Error(e.to_string()));
            }
        });
    }

    fn close_edge(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!(uri = %self.uri, "Disconnected from upstream broker");
            self.emit(TransportEvent::Close);
        }
    }

    /// Connection dropped while the session should stay up
    async fn on_link_lost(&self) {
        let was_connected = self.connected.load(Ordering::SeqCst);
        self.state.send_if_modified(|s| {
            let changed = *s == LinkState::Connected;
            if changed {
                *s = LinkState::Connecting;
            }
            changed
        });
        self.close_edge();
        if was_connected {
            self.emit(TransportEvent::Offline);
            self.bridge.send(BridgeEvent::Offline).await;
        }
    }

    /// Session torn down on request
    fn finish(&self) {
        let previous = self.state.send_replace(LinkState::Idle);
        self.close_edge();
        if previous != LinkState::Idle {
            self.emit(TransportEvent::End);
        }
    }

    async fn deliver(&self, publish: rumqttc::Publish) {
        let Some(topic) = strip_root(self.root_topic.as_deref(), &publish.topic) else {
            trace!(topic = %publish.topic, "Ignoring message outside root topic");
            return;
        };

        let message = Message {
            topic: topic.to_string(),
            payload: publish.payload,
            qos: publish.qos as u8,
            retain: publish.retain,
        };
        self.emit(TransportEvent::Message(message.clone()));
        self.bridge.send(BridgeEvent::Message(message)).await;
    }
}

struct Session {
    client: AsyncClient,
    task: JoinHandle<()>,
}

/// Upstream transport over a rumqttc session
pub struct MqttTransport {
    config: UpstreamConfig,
    client_id: String,
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
}

impl MqttTransport {
    pub fn new(config: &UpstreamConfig) -> Self {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(generate_session_id);
        let (state, _) = watch::channel(LinkState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            config: config.clone(),
            client_id,
            shared: Arc::new(Shared {
                uri: format!("mqtt://{}:{}", config.host, config.port),
                root_topic: config.root_topic.clone(),
                state,
                connected: AtomicBool::new(false),
                events,
                bridge: Bridge::default(),
                filters: Mutex::new(Vec::new()),
                packet_events: AtomicBool::new(false),
            }),
            session: Mutex::new(None),
        }
    }

    /// Emit `PacketSend`/`PacketReceive` summaries
    pub fn with_packet_events(self, enabled: bool) -> Self {
        self.shared.packet_events.store(enabled, Ordering::Relaxed);
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn link_state(&self) -> LinkState {
        *self.shared.state.borrow()
    }

    /// Drop the current session and establish a new one, keeping the
    /// active subscriptions
    pub async fn reconnect(&self) -> Result<()> {
        self.stop_session(true).await;
        self.shared.emit(TransportEvent::Reconnect);
        self.connect().await
    }

    /// Filters restored when a fresh session is established
    pub fn active_filters(&self) -> Vec<String> {
        self.shared.filters.lock().clone()
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.config.host, self.config.port);
        options.set_keep_alive(self.config.keep_alive());
        options.set_clean_session(self.config.clean_session);
        options.set_max_packet_size(self.config.max_packet_size, self.config.max_packet_size);
        if let Some(username) = &self.config.username {
            options.set_credentials(
                username.clone(),
                self.config.password.clone().unwrap_or_default(),
            );
        }
        options
    }

    /// Spawn a session unless one is already running
    fn start_session(&self) {
        let mut session = self.session.lock();

        let started = self.shared.state.send_if_modified(|s| {
            let idle = *s == LinkState::Idle;
            if idle {
                *s = LinkState::Connecting;
            }
            idle
        });
        if !started {
            return;
        }

        debug!(uri = %self.shared.uri, client_id = %self.client_id, "Starting upstream session");
        let (client, eventloop) = AsyncClient::new(self.mqtt_options(), self.config.request_capacity);
        let task = tokio::spawn(drive(
            eventloop,
            client.clone(),
            Arc::clone(&self.shared),
            self.config.reconnect_delay(),
        ));
        *session = Some(Session { client, task });
    }

    fn client(&self) -> Result<AsyncClient> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.client.clone())
            .ok_or(GatewayError::TransportOffline)
    }

    fn root(&self) -> Option<&str> {
        self.config.root_topic.as_deref()
    }

    async fn stop_session(&self, force: bool) {
        let session = self.session.lock().take();
        let Some(session) = session else {
            return;
        };
        let was_connected = self.is_connected();
        self.shared.state.send_replace(LinkState::Disconnecting);

        if !force && was_connected && session.client.disconnect().await.is_ok() {
            let mut state = self.shared.state.subscribe();
            let drained = tokio::time::timeout(
                GRACEFUL_END_TIMEOUT,
                state.wait_for(|s| *s == LinkState::Idle),
            )
            .await
            .is_ok();
            if !drained {
                debug!(uri = %self.shared.uri, "Graceful disconnect timed out");
            }
        }

        session.task.abort();
        self.shared.finish();
    }
}

async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    reconnect_delay: Duration,
) {
    loop {
        let event = eventloop.poll().await;

        if *shared.state.borrow() == LinkState::Disconnecting
            && matches!(event, Err(_) | Ok(Event::Outgoing(Outgoing::Disconnect)))
        {
            shared.finish();
            return;
        }

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    if !ack.session_present {
                        shared.restore_subscriptions(&client);
                    }
                    shared.on_connack().await;
                } else {
                    warn!(code = ?ack.code, "Upstream broker refused connection");
                    shared.emit(TransportEvent::Error(format!("Connection refused: {:?}", ack.code)));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                shared.packet_event(|| TransportEvent::PacketReceive(describe_publish(&publish)));
                shared.deliver(publish).await;
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                shared.emit(TransportEvent::Disconnect);
            }
            Ok(Event::Incoming(packet)) => {
                shared.packet_event(|| TransportEvent::PacketReceive(format!("{:?}", packet)));
            }
            Ok(Event::Outgoing(outgoing)) => {
                shared.packet_event(|| TransportEvent::PacketSend(format!("{:?}", outgoing)));
            }
            Err(e) => {
                warn!(uri = %shared.uri, error = %e, "Upstream connection error");
                shared.emit(TransportEvent::Error(e.to_string()));
                shared.on_link_lost().await;

                tokio::time::sleep(reconnect_delay).await;
                shared.emit(TransportEvent::Reconnect);
            }
        }
    }
}

#[async_trait]
impl UpstreamTransport for MqttTransport {
    async fn connect(&self) -> Result<()> {
        let mut state = self.shared.state.subscribe();

        loop {
            let current = *state.borrow_and_update();
            match current {
                LinkState::Connected => return Ok(()),
                LinkState::Idle => self.start_session(),
                LinkState::Disconnecting => {
                    state
                        .wait_for(|s| *s != LinkState::Disconnecting)
                        .await
                        .map_err(|e| GatewayError::Transport(e.to_string()))?;
                }
                LinkState::Connecting => {
                    let reached = state
                        .wait_for(|s| matches!(s, LinkState::Connected | LinkState::Idle))
                        .await
                        .map(|s| *s)
                        .map_err(|e| GatewayError::Transport(e.to_string()))?;

                    if reached == LinkState::Idle {
                        return Err(GatewayError::Transport(
                            "Session ended before the handshake completed".to_string(),
                        ));
                    }
                    return Ok(());
                }
            }
        }
    }

    async fn publish(&self, topic: &str, payload: Bytes, options: PublishOptions) -> Result<()> {
        let client = self.client()?;
        let retain = options.retain.unwrap_or(self.config.retain);
        let topic = apply_root(self.root(), topic);
        let qos = to_qos(options.qos);

        // the event loop would drop the whole session on an oversized packet
        let size = publish_size(&topic, payload.len(), qos);
        if size > self.config.max_packet_size {
            return Err(GatewayError::PacketTooLarge {
                size,
                limit: self.config.max_packet_size,
            });
        }

        client
            .publish_bytes(topic, qos, retain, payload)
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))
    }

    async fn subscribe(&self, topics: &[String]) -> Result<()> {
        let client = self.client()?;
        let filters: Vec<String> = topics.iter().map(|t| apply_root(self.root(), t)).collect();
        let request = filters
            .iter()
            .map(|f| SubscribeFilter::new(f.clone(), QoS::AtMostOnce));

        if let Err(e) = client.subscribe_many(request).await {
            self.shared.emit(TransportEvent::Error(e.to_string()));
            return Err(GatewayError::Transport(e.to_string()));
        }
        {
            let mut active = self.shared.filters.lock();
            for filter in filters {
                if !active.contains(&filter) {
                    active.push(filter);
                }
            }
        }
        self.shared.emit(TransportEvent::Subscribed(topics.to_vec()));
        Ok(())
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<()> {
        let client = self.client()?;

        for topic in topics {
            let filter = apply_root(self.root(), topic);
            self.shared.filters.lock().retain(|f| *f != filter);
            if let Err(e) = client.unsubscribe(filter).await {
                self.shared.emit(TransportEvent::Error(e.to_string()));
                return Err(GatewayError::Transport(e.to_string()));
            }
        }
        self.shared.emit(TransportEvent::Unsubscribed(topics.to_vec()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link_state() == LinkState::Connected
    }

    async fn end(&self, force: bool) -> Result<()> {
        self.shared.filters.lock().clear();
        self.stop_session(force).await;
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    fn bridge(&self) -> mpsc::Receiver<BridgeEvent> {
        self.shared.bridge.attach()
    }
}

fn generate_session_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("session_{}", &id[..8])
}

/// Encoded PUBLISH length, fixed header included
fn publish_size(topic: &str, payload: usize, qos: QoS) -> usize {
    let packet_id = if qos == QoS::AtMostOnce { 0 } else { 2 };
    let remaining = 2 + topic.len() + packet_id + payload;
    let length_bytes = match remaining {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    };
    1 + length_bytes + remaining
}

/// Summary without the payload
fn describe_publish(publish: &rumqttc::Publish) -> String {
    format!(
        "Publish(topic = {}, qos = {:?}, retain = {}, pkid = {}, bytes = {})",
        publish.topic,
        publish.qos,
        publish.retain,
        publish.pkid,
        publish.payload.len()
    )
}

fn to_qos(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}
