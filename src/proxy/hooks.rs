//! Broker hooks backed by the connection registry

use crate::acl::Identity;
use crate::auth::Authenticator;
use crate::broker::{BrokerHooks, ConnectionInfo};
use crate::error::{GatewayError, Result};
use crate::mqtt::{Message, Subscription, TopicMatcher};
use crate::transport::{PublishOptions, UpstreamTransport};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Wires the embedded broker to the identity layer and the upstream session.
///
/// Holds one [`Identity`] per authenticated connection id.
pub struct ProxyHooks {
    transport: Arc<dyn UpstreamTransport>,
    authenticator: Authenticator,
    identities: DashMap<String, Identity>,
    matcher: TopicMatcher,
    log_packets: bool,
}

impl ProxyHooks {
    pub fn new(
        transport: Arc<dyn UpstreamTransport>,
        authenticator: Authenticator,
        log_packets: bool,
    ) -> Self {
        Self {
            transport,
            authenticator,
            identities: DashMap::new(),
            matcher: TopicMatcher::new(),
            log_packets,
        }
    }

    /// Identity registered for a connection id
    pub fn identity(&self, id: &str) -> Option<Identity> {
        self.identities.get(id).map(|entry| entry.clone())
    }

    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }

    fn register(&self, id: &str, identity: Identity) -> Result<()> {
        match self.identities.entry(id.to_string()) {
            Entry::Occupied(_) => Err(GatewayError::Config(format!(
                "Connection {id} already exists"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(identity);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl BrokerHooks for ProxyHooks {
    async fn pre_connect(&self, conn: &ConnectionInfo) -> bool {
        debug!(client_id = %conn.id, remote_addr = %conn.remote_addr, "Received CONNECT");

        let connected = self.transport.is_connected();
        if !connected {
            warn!(client_id = %conn.id, "Upstream transport is not connected, refusing client");
        }
        connected
    }

    async fn authenticate(
        &self,
        conn: &ConnectionInfo,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> Result<()> {
        let identity = self.authenticator.authenticate(username, password).await?;
        let kind = identity.kind();

        if let Err(e) = self.register(&conn.id, identity) {
            error!(client_id = %conn.id, error = %e, "Duplicate connection id");
            return Err(e);
        }

        info!(client_id = %conn.id, identity = kind, "Client authenticated");
        Ok(())
    }

    async fn authorize_publish(&self, conn: &ConnectionInfo, message: Message) -> Result<Message> {
        let accepted = {
            let identity = self
                .identities
                .get(&conn.id)
                .ok_or_else(|| GatewayError::NotPermitted("Not permitted".to_string()))?;
            identity.authorize_publish(&message)?
        };

        debug!(client_id = %conn.id, topic = %message.topic, upstream = %accepted.topic, "Client published");

        // an Err drops the client before any PUBACK
        if let Err(e) = self
            .transport
            .publish(
                &accepted.topic,
                accepted.payload.clone(),
                PublishOptions::from(&accepted),
            )
            .await
        {
            warn!(client_id = %conn.id, topic = %accepted.topic, error = %e, "Failed to forward upstream");
            return Err(e);
        }

        Ok(accepted)
    }

    async fn authorize_subscribe(
        &self,
        conn: &ConnectionInfo,
        sub: Subscription,
    ) -> Result<Option<Subscription>> {
        let identity = self
            .identities
            .get(&conn.id)
            .ok_or_else(|| GatewayError::NotPermitted("Not permitted".to_string()))?;

        identity.authorize_subscribe(&sub).map(Some)
    }

    fn authorize_forward(&self, conn: &ConnectionInfo, message: &Message) -> Option<Message> {
        if self.matcher.is_system_topic(&message.topic) {
            return Some(message.clone());
        }
        if self.log_packets {
            trace!(client_id = %conn.id, topic = %message.topic, "Forwarding");
        }

        self.identities.get(&conn.id)?.authorize_forward(message)
    }

    async fn published(&self, message: &Message, conn: Option<&ConnectionInfo>) -> Result<()> {
        if self.log_packets {
            match conn {
                Some(conn) => debug!(client_id = %conn.id, topic = %message.topic, "Published"),
                None => debug!(topic = %message.topic, "Published from upstream"),
            }
        }
        Ok(())
    }

    async fn subscribed(&self, subs: &[Subscription], conn: &ConnectionInfo) {
        debug!(client_id = %conn.id, count = subs.len(), "Client subscribed");
    }

    async fn client_disconnect(&self, conn: &ConnectionInfo) {
        info!(client_id = %conn.id, "Client disconnected");
        self.identities.remove(&conn.id);
    }

    fn client_error(&self, conn: &ConnectionInfo, error: &GatewayError) {
        error!(client_id = %conn.id, error = %error, "Client error");
    }
}
