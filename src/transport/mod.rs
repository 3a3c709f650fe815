//! Upstream transport
//!
//! One long-lived session to the central broker shared by the whole process.
//! Topics handed to and received from a transport never carry the fixed
//! root prefix; the transport applies and strips it.

mod mqtt;

pub use mqtt::{LinkState, MqttTransport};

use crate::error::Result;
use crate::mqtt::Message;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

/// Pending bridge events before the transport waits for the consumer
const BRIDGE_CAPACITY: usize = 1024;

/// Lifecycle and traffic notifications of a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Session handshake completed (first connect and every reconnect)
    Connect,
    /// A reconnect attempt is starting
    Reconnect,
    /// Connected → not connected edge
    Close,
    /// Session lost, reconnecting in the background
    Offline,
    /// Session ended on request
    End,
    /// Server sent DISCONNECT
    Disconnect,
    Error(String),
    /// Inbound application message, root prefix already stripped
    Message(Message),
    Subscribed(Vec<String>),
    Unsubscribed(Vec<String>),
    /// Packet summaries, only emitted when packet logging is enabled
    PacketSend(String),
    PacketReceive(String),
}

/// Events the proxy must see in order and without loss
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    Connect,
    Offline,
    Message(Message),
}

/// Lossless single-consumer channel next to the broadcast events.
///
/// Attaching replaces the previous consumer. Senders wait when the consumer
/// falls behind.
#[derive(Default)]
pub struct Bridge {
    sender: Mutex<Option<mpsc::Sender<BridgeEvent>>>,
}

impl Bridge {
    pub fn attach(&self) -> mpsc::Receiver<BridgeEvent> {
        let (sender, receiver) = mpsc::channel(BRIDGE_CAPACITY);
        *self.sender.lock() = Some(sender);
        receiver
    }

    pub async fn send(&self, event: BridgeEvent) {
        let Some(sender) = self.sender.lock().clone() else {
            return;
        };
        if sender.send(event).await.is_err() {
            debug!("Bridge consumer detached");
        }
    }
}

/// Per-publish overrides
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Retain flag, transport default when `None`
    pub retain: Option<bool>,
    pub qos: u8,
}

impl PublishOptions {
    pub fn retain(retain: bool) -> Self {
        Self {
            retain: Some(retain),
            qos: 0,
        }
    }
}

impl From<&Message> for PublishOptions {
    fn from(message: &Message) -> Self {
        Self {
            retain: Some(message.retain),
            qos: message.qos,
        }
    }
}

/// Upstream broker session
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Resolve once the handshake completes. Waits for a disconnect in
    /// progress first; no-op when already connected.
    async fn connect(&self) -> Result<()>;

    async fn publish(&self, topic: &str, payload: Bytes, options: PublishOptions) -> Result<()>;

    async fn subscribe(&self, topics: &[String]) -> Result<()>;

    async fn unsubscribe(&self, topics: &[String]) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Tear the session down, dropping queued requests when `force` is set
    async fn end(&self, force: bool) -> Result<()>;

    /// Subscribe to transport events
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Attach the single consumer of connect, offline and message events
    fn bridge(&self) -> mpsc::Receiver<BridgeEvent>;
}

/// `root/topic`, or `topic` when no root is configured
pub fn apply_root(root: Option<&str>, topic: &str) -> String {
    match root {
        Some(root) => format!("{root}/{topic}"),
        None => topic.to_string(),
    }
}

/// Inverse of [`apply_root`], `None` when the topic lacks the prefix
pub fn strip_root<'a>(root: Option<&str>, topic: &'a str) -> Option<&'a str> {
    match root {
        Some(root) => topic.strip_prefix(root)?.strip_prefix('/'),
        None => Some(topic),
    }
}
